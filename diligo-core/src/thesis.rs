//! Investment thesis model — the weighted set of pillars driving a run.
//!
//! A `Thesis` is immutable once a research run starts; the orchestrator
//! validates it up front and treats any defect as unrecoverable.

use crate::error::OrchestratorError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tolerance when checking that pillar weights sum to 1.0.
const WEIGHT_SUM_EPSILON: f64 = 1e-6;

/// A weighted sub-topic of the thesis with its own research questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pillar {
    /// Unique identifier.
    pub id: Uuid,
    /// Short pillar name, e.g. "Revenue durability".
    pub name: String,
    /// Weight in [0,1]; weights across a thesis sum to 1.
    pub weight: f64,
    /// The research questions this pillar must answer.
    pub questions: Vec<String>,
    /// Optional key terms to bias query generation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_terms: Vec<String>,
}

impl Pillar {
    pub fn new(name: impl Into<String>, weight: f64, questions: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            weight,
            questions,
            key_terms: Vec::new(),
        }
    }

    /// All question text joined, used for relevance embedding.
    pub fn question_text(&self) -> String {
        self.questions.join(" ")
    }
}

/// The investment thesis driving a research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thesis {
    /// The thesis statement.
    pub statement: String,
    /// Target company name.
    pub company: String,
    /// Target company website.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Ordered pillars; weights sum to 1.
    pub pillars: Vec<Pillar>,
}

impl Thesis {
    /// Validate the thesis: at least one pillar, each pillar has questions,
    /// weights in [0,1] summing to 1.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.statement.trim().is_empty() {
            return Err(OrchestratorError::InvalidThesis {
                reason: "statement is empty".into(),
            });
        }
        if self.company.trim().is_empty() {
            return Err(OrchestratorError::InvalidThesis {
                reason: "company is empty".into(),
            });
        }
        if self.pillars.is_empty() {
            return Err(OrchestratorError::InvalidThesis {
                reason: "thesis has no pillars".into(),
            });
        }

        let mut sum = 0.0;
        for pillar in &self.pillars {
            if !(0.0..=1.0).contains(&pillar.weight) {
                return Err(OrchestratorError::InvalidThesis {
                    reason: format!(
                        "pillar '{}' weight {} is outside [0,1]",
                        pillar.name, pillar.weight
                    ),
                });
            }
            if pillar.questions.is_empty() {
                return Err(OrchestratorError::InvalidThesis {
                    reason: format!("pillar '{}' has no questions", pillar.name),
                });
            }
            sum += pillar.weight;
        }

        if (sum - 1.0).abs() > WEIGHT_SUM_EPSILON {
            return Err(OrchestratorError::InvalidThesis {
                reason: format!("pillar weights sum to {sum}, expected 1.0"),
            });
        }

        Ok(())
    }

    /// Parse a thesis from TOML (the CLI input format).
    pub fn from_toml(input: &str) -> Result<Self, OrchestratorError> {
        let thesis: Thesis =
            toml::from_str(input).map_err(|e| OrchestratorError::InvalidThesis {
                reason: format!("TOML parse error: {e}"),
            })?;
        thesis.validate()?;
        Ok(thesis)
    }

    /// Look up a pillar by id.
    pub fn pillar(&self, id: &Uuid) -> Option<&Pillar> {
        self.pillars.iter().find(|p| p.id == *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn two_pillar_thesis() -> Thesis {
        Thesis {
            statement: "Acme's vertical SaaS moat is durable".into(),
            company: "Acme".into(),
            website: Some("https://acme.example".into()),
            pillars: vec![
                Pillar::new(
                    "Revenue durability",
                    0.5,
                    vec!["What is net revenue retention?".into()],
                ),
                Pillar::new(
                    "Competitive moat",
                    0.5,
                    vec!["Who are the closest competitors?".into()],
                ),
            ],
        }
    }

    #[test]
    fn test_valid_thesis() {
        assert!(two_pillar_thesis().validate().is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut thesis = two_pillar_thesis();
        thesis.pillars[0].weight = 0.9;
        let err = thesis.validate().unwrap_err();
        assert!(err.to_string().contains("sum"));
    }

    #[test]
    fn test_empty_pillars_rejected() {
        let mut thesis = two_pillar_thesis();
        thesis.pillars.clear();
        assert!(thesis.validate().is_err());
    }

    #[test]
    fn test_pillar_without_questions_rejected() {
        let mut thesis = two_pillar_thesis();
        thesis.pillars[0].questions.clear();
        assert!(thesis.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let input = r#"
statement = "Acme wins the mid-market"
company = "Acme"

[[pillars]]
id = "7f0c0a10-9d1a-4c57-9f68-2b4a3f1a9e01"
name = "Growth"
weight = 0.6
questions = ["How fast is ARR growing?"]

[[pillars]]
id = "7f0c0a10-9d1a-4c57-9f68-2b4a3f1a9e02"
name = "Retention"
weight = 0.4
questions = ["What is gross churn?"]
"#;
        let thesis = Thesis::from_toml(input).unwrap();
        assert_eq!(thesis.pillars.len(), 2);
        assert_eq!(thesis.company, "Acme");
    }
}
