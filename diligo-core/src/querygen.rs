//! Query generation — initial and gap-driven refinement queries.
//!
//! Query counts lean toward higher-weight pillars and, on refinement,
//! toward the pillars the gap analyzer ranked most under-covered. A
//! per-run seen-query set guarantees no query is ever re-issued.

use crate::coverage::PillarGap;
use crate::thesis::Thesis;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// A search query bound to the pillar it investigates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    pub pillar_id: Uuid,
    pub text: String,
}

/// Generates de-duplicated query batches for a run.
pub struct QueryGenerator {
    /// Queries per unit of pillar weight in the initial batch.
    queries_per_weight: usize,
    /// Cap per pillar per batch.
    max_per_pillar: usize,
}

impl QueryGenerator {
    pub fn new(queries_per_weight: usize, max_per_pillar: usize) -> Self {
        Self {
            queries_per_weight: queries_per_weight.max(1),
            max_per_pillar: max_per_pillar.max(1),
        }
    }

    /// Initial batch: every pillar question becomes a company-scoped query,
    /// plus key-term probes (author-supplied and interpretation-derived)
    /// for heavier pillars. Updates `seen` in place.
    pub fn initial_batch(
        &self,
        thesis: &Thesis,
        derived_terms: &BTreeMap<Uuid, Vec<String>>,
        seen: &mut HashSet<String>,
    ) -> Vec<SearchQuery> {
        let mut batch = Vec::new();

        for pillar in &thesis.pillars {
            let budget = ((pillar.weight * self.queries_per_weight as f64 * thesis.pillars.len() as f64)
                .ceil() as usize)
                .clamp(1, self.max_per_pillar);
            let mut emitted = 0usize;

            for question in &pillar.questions {
                if emitted >= budget {
                    break;
                }
                let text = format!("{} {}", thesis.company, question);
                if Self::push_unseen(&mut batch, seen, pillar.id, text) {
                    emitted += 1;
                }
            }

            let derived = derived_terms.get(&pillar.id);
            for term in pillar.key_terms.iter().chain(derived.into_iter().flatten()) {
                if emitted >= budget {
                    break;
                }
                let text = format!("{} {}", thesis.company, term);
                if Self::push_unseen(&mut batch, seen, pillar.id, text) {
                    emitted += 1;
                }
            }
        }

        batch
    }

    /// Refinement batch: derived from the gap analyzer's unanswered
    /// questions rather than regenerated from scratch. Gaps arrive ranked
    /// most-severe first; that order is preserved.
    pub fn refine_batch(
        &self,
        thesis: &Thesis,
        derived_terms: &BTreeMap<Uuid, Vec<String>>,
        gaps: &[PillarGap],
        seen: &mut HashSet<String>,
    ) -> Vec<SearchQuery> {
        let mut batch = Vec::new();

        for gap in gaps {
            let mut emitted = 0usize;
            let mut key_terms = thesis
                .pillar(&gap.pillar_id)
                .map(|p| p.key_terms.clone())
                .unwrap_or_default();
            if let Some(derived) = derived_terms.get(&gap.pillar_id) {
                key_terms.extend(derived.iter().cloned());
            }

            for question in &gap.unanswered_questions {
                if emitted >= self.max_per_pillar {
                    break;
                }
                // Narrow the phrasing on refinement instead of repeating
                // the original query.
                let text = format!("{} {} details", thesis.company, question);
                if Self::push_unseen(&mut batch, seen, gap.pillar_id, text) {
                    emitted += 1;
                }
                if let Some(term) = key_terms.first() {
                    if emitted >= self.max_per_pillar {
                        break;
                    }
                    let text = format!("{} {} {}", thesis.company, term, question);
                    if Self::push_unseen(&mut batch, seen, gap.pillar_id, text) {
                        emitted += 1;
                    }
                }
            }

            // A gap with every question nominally addressed still needs
            // deeper evidence; probe with the pillar name.
            if emitted == 0 {
                let text = format!(
                    "{} {} analysis evidence",
                    thesis.company, gap.pillar_name
                );
                Self::push_unseen(&mut batch, seen, gap.pillar_id, text);
            }
        }

        batch
    }

    fn push_unseen(
        batch: &mut Vec<SearchQuery>,
        seen: &mut HashSet<String>,
        pillar_id: Uuid,
        text: String,
    ) -> bool {
        let key = text.to_lowercase();
        if seen.contains(&key) {
            return false;
        }
        seen.insert(key);
        batch.push(SearchQuery { pillar_id, text });
        true
    }
}

impl Default for QueryGenerator {
    fn default() -> Self {
        Self::new(2, 6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thesis::{Pillar, Thesis};

    fn thesis() -> Thesis {
        let mut growth = Pillar::new(
            "Growth",
            0.7,
            vec![
                "How fast is ARR growing?".into(),
                "What drives expansion revenue?".into(),
            ],
        );
        growth.key_terms = vec!["net revenue retention".into()];
        Thesis {
            statement: "Acme compounds".into(),
            company: "Acme".into(),
            website: None,
            pillars: vec![
                growth,
                Pillar::new("Moat", 0.3, vec!["What are switching costs?".into()]),
            ],
        }
    }

    #[test]
    fn test_initial_batch_covers_all_pillars() {
        let thesis = thesis();
        let mut seen = HashSet::new();
        let batch = QueryGenerator::default().initial_batch(&thesis, &BTreeMap::new(), &mut seen);

        for pillar in &thesis.pillars {
            assert!(batch.iter().any(|q| q.pillar_id == pillar.id));
        }
        assert!(batch.iter().all(|q| q.text.contains("Acme")));
    }

    #[test]
    fn test_heavier_pillar_gets_more_queries() {
        let thesis = thesis();
        let mut seen = HashSet::new();
        let batch = QueryGenerator::default().initial_batch(&thesis, &BTreeMap::new(), &mut seen);

        let growth = thesis.pillars[0].id;
        let moat = thesis.pillars[1].id;
        let growth_count = batch.iter().filter(|q| q.pillar_id == growth).count();
        let moat_count = batch.iter().filter(|q| q.pillar_id == moat).count();
        assert!(growth_count > moat_count);
    }

    #[test]
    fn test_seen_queries_never_reissued() {
        let thesis = thesis();
        let mut seen = HashSet::new();
        let generator = QueryGenerator::default();

        let first = generator.initial_batch(&thesis, &BTreeMap::new(), &mut seen);
        assert!(!first.is_empty());
        let second = generator.initial_batch(&thesis, &BTreeMap::new(), &mut seen);
        assert!(second.is_empty());
    }

    #[test]
    fn test_derived_terms_extend_probes() {
        let thesis = thesis();
        let moat = thesis.pillars[1].id;
        let mut derived = BTreeMap::new();
        derived.insert(moat, vec!["lock-in".to_string()]);

        let mut seen = HashSet::new();
        let batch = QueryGenerator::default().initial_batch(&thesis, &derived, &mut seen);
        assert!(
            batch
                .iter()
                .any(|q| q.pillar_id == moat && q.text.contains("lock-in"))
        );
    }

    #[test]
    fn test_refine_batch_targets_unanswered_questions() {
        let thesis = thesis();
        let mut seen = HashSet::new();
        let gap = PillarGap {
            pillar_id: thesis.pillars[1].id,
            pillar_name: "Moat".into(),
            coverage: 0.2,
            severity: 0.15,
            unanswered_questions: vec!["What are switching costs?".into()],
        };

        let batch = QueryGenerator::default().refine_batch(&thesis, &BTreeMap::new(), &[gap], &mut seen);
        assert!(!batch.is_empty());
        assert!(batch.iter().all(|q| q.pillar_id == thesis.pillars[1].id));
        assert!(batch[0].text.contains("switching costs"));
    }

    #[test]
    fn test_refine_without_unanswered_probes_pillar_name() {
        let thesis = thesis();
        let mut seen = HashSet::new();
        let gap = PillarGap {
            pillar_id: thesis.pillars[1].id,
            pillar_name: "Moat".into(),
            coverage: 0.5,
            severity: 0.06,
            unanswered_questions: vec![],
        };

        let batch = QueryGenerator::default().refine_batch(&thesis, &BTreeMap::new(), &[gap], &mut seen);
        assert_eq!(batch.len(), 1);
        assert!(batch[0].text.contains("Moat"));
    }

    #[test]
    fn test_refinement_respects_seen_set() {
        let thesis = thesis();
        let mut seen = HashSet::new();
        let gap = PillarGap {
            pillar_id: thesis.pillars[1].id,
            pillar_name: "Moat".into(),
            coverage: 0.2,
            severity: 0.15,
            unanswered_questions: vec!["What are switching costs?".into()],
        };

        let generator = QueryGenerator::default();
        let first = generator.refine_batch(&thesis, &BTreeMap::new(), &[gap.clone()], &mut seen);
        let second = generator.refine_batch(&thesis, &BTreeMap::new(), &[gap], &mut seen);
        assert!(!first.is_empty());
        // Second pass only emits the pillar-name probe if anything at all.
        assert!(second.iter().all(|q| !first.contains(q)));
    }
}
