//! Report synthesis — the cited artifact produced once a run converges.
//!
//! Runs once per run, after the stop condition. Each pillar gets a section
//! built from its top-N highest-quality live evidence, with inline
//! citations referencing evidence ids. Overall confidence is the weighted
//! average of per-pillar coverage times quality; a run stopped at the
//! iteration cap without meeting the coverage bar is emitted in the low
//! confidence band with its unresolved gaps listed.

use crate::evidence::Evidence;
use crate::state::{PillarAggregate, ResearchState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An inline citation tying a report section to an evidence record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub evidence_id: Uuid,
    pub section_id: Uuid,
    /// Quoted excerpt from the evidence summary.
    pub excerpt: String,
}

/// Confidence band attached to the finished report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Moderate,
    Low,
}

impl ConfidenceBand {
    fn from_confidence(confidence: f64, capped: bool) -> Self {
        if capped {
            return ConfidenceBand::Low;
        }
        if confidence >= 0.75 {
            ConfidenceBand::High
        } else if confidence >= 0.5 {
            ConfidenceBand::Moderate
        } else {
            ConfidenceBand::Low
        }
    }
}

/// One pillar's narrative section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    pub id: Uuid,
    pub pillar_id: Uuid,
    pub title: String,
    /// Narrative with `[n]` citation markers.
    pub narrative: String,
    pub coverage: f64,
    pub mean_quality: f64,
}

/// A pillar left under-covered when the run stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedGap {
    pub pillar_id: Uuid,
    pub pillar_name: String,
    pub coverage: f64,
    /// Questions the evidence never adequately addressed.
    pub open_questions: Vec<String>,
}

/// The final research report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub company: String,
    pub thesis_statement: String,
    pub sections: Vec<ReportSection>,
    pub citations: Vec<Citation>,
    /// Weighted average of per-pillar coverage x quality, in [0,1].
    pub confidence: f64,
    pub confidence_band: ConfidenceBand,
    /// Pillars below the coverage bar when the run stopped.
    pub unresolved_gaps: Vec<UnresolvedGap>,
    pub iterations_used: u32,
    pub generated_at: DateTime<Utc>,
}

/// Assembles the report from accumulated, scored evidence.
pub struct ReportSynthesizer {
    /// Max evidence items cited per pillar section.
    top_n: usize,
    /// Evidence below this overall score is excluded from synthesis.
    quality_floor: f64,
    /// Coverage bar a pillar must meet to avoid the unresolved-gap list.
    coverage_target: f64,
}

impl ReportSynthesizer {
    pub fn new(top_n: usize, quality_floor: f64, coverage_target: f64) -> Self {
        Self {
            top_n: top_n.max(1),
            quality_floor,
            coverage_target,
        }
    }

    /// Build the report. `stopped_at_cap` marks a run that hit
    /// `max_iterations` without meeting the coverage bar, which forces the
    /// low confidence band.
    pub fn synthesize(&self, state: &ResearchState, stopped_at_cap: bool) -> Report {
        let mut sections = Vec::new();
        let mut citations = Vec::new();
        let mut unresolved_gaps = Vec::new();
        let mut confidence = 0.0;

        for pillar in &state.thesis.pillars {
            let aggregate = state
                .pillar_aggregates
                .get(&pillar.id)
                .cloned()
                .unwrap_or_default();

            let selected = self.select_top(state, &pillar.id);
            let section_id = Uuid::new_v4();
            let narrative = self.narrative(&pillar.name, &selected);

            for (i, evidence) in selected.iter().enumerate() {
                citations.push(Citation {
                    evidence_id: evidence.id,
                    section_id,
                    excerpt: excerpt_of(evidence, i),
                });
            }

            sections.push(ReportSection {
                id: section_id,
                pillar_id: pillar.id,
                title: pillar.name.clone(),
                narrative,
                coverage: aggregate.coverage,
                mean_quality: aggregate.mean_quality,
            });

            confidence += pillar.weight * aggregate.coverage * aggregate.mean_quality;

            if aggregate.coverage < self.coverage_target {
                unresolved_gaps.push(UnresolvedGap {
                    pillar_id: pillar.id,
                    pillar_name: pillar.name.clone(),
                    coverage: aggregate.coverage,
                    open_questions: pillar.questions.clone(),
                });
            }
        }

        let confidence = confidence.clamp(0.0, 1.0);
        let capped = stopped_at_cap && !unresolved_gaps.is_empty();

        Report {
            run_id: state.id,
            company: state.thesis.company.clone(),
            thesis_statement: state.thesis.statement.clone(),
            sections,
            citations,
            confidence,
            confidence_band: ConfidenceBand::from_confidence(confidence, capped),
            unresolved_gaps,
            iterations_used: state.iteration_count,
            generated_at: Utc::now(),
        }
    }

    /// Top-N live, scored, above-floor evidence for a pillar, best first.
    fn select_top<'a>(&self, state: &'a ResearchState, pillar_id: &Uuid) -> Vec<&'a Evidence> {
        let mut live: Vec<&Evidence> = state
            .live_evidence_for(pillar_id)
            .into_iter()
            .filter(|e| e.overall_quality() >= self.quality_floor)
            .collect();
        live.sort_by(|a, b| {
            b.overall_quality()
                .partial_cmp(&a.overall_quality())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        live.truncate(self.top_n);
        live
    }

    fn narrative(&self, pillar_name: &str, selected: &[&Evidence]) -> String {
        if selected.is_empty() {
            return format!("No evidence meeting the quality floor was found for {pillar_name}.");
        }
        let mut out = String::new();
        for (i, evidence) in selected.iter().enumerate() {
            out.push_str(evidence.summary.trim());
            out.push_str(&format!(" [{}]", i + 1));
            if i + 1 < selected.len() {
                out.push(' ');
            }
        }
        out
    }
}

fn excerpt_of(evidence: &Evidence, _index: usize) -> String {
    let mut excerpt = evidence.summary.clone();
    if excerpt.len() > 200 {
        excerpt.truncate(200);
    }
    excerpt
}

/// Render a report as markdown for the CLI and file export.
pub fn render_markdown(report: &Report) -> String {
    let mut out = format!(
        "# Research Report: {} — {}\n\n",
        report.company, report.thesis_statement
    );
    out.push_str(&format!(
        "**Confidence:** {:.0}% ({:?}) | **Iterations:** {} | **Citations:** {}\n\n",
        report.confidence * 100.0,
        report.confidence_band,
        report.iterations_used,
        report.citations.len(),
    ));

    for section in &report.sections {
        out.push_str(&format!("## {}\n\n", section.title));
        out.push_str(&format!(
            "_Coverage {:.0}%, mean quality {:.0}%_\n\n",
            section.coverage * 100.0,
            section.mean_quality * 100.0
        ));
        out.push_str(&section.narrative);
        out.push_str("\n\n");
    }

    if !report.unresolved_gaps.is_empty() {
        out.push_str("## Unresolved Gaps\n\n");
        for gap in &report.unresolved_gaps {
            out.push_str(&format!(
                "- **{}** (coverage {:.0}%)\n",
                gap.pillar_name,
                gap.coverage * 100.0
            ));
            for q in &gap.open_questions {
                out.push_str(&format!("  - {q}\n"));
            }
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::RawDocument;
    use crate::quality::QualityScore;
    use crate::state::ResearchState;
    use crate::thesis::{Pillar, Thesis};

    fn thesis() -> Thesis {
        Thesis {
            statement: "Acme compounds".into(),
            company: "Acme".into(),
            website: None,
            pillars: vec![
                Pillar::new("Growth", 0.5, vec!["How fast?".into()]),
                Pillar::new("Moat", 0.5, vec!["How defensible?".into()]),
            ],
        }
    }

    fn scored_evidence(pillar_id: Uuid, content: &str, overall_target: f64) -> Evidence {
        let mut e = Evidence::from_raw(
            RawDocument {
                title: "doc".into(),
                url: "https://reuters.com/news/acme".into(),
                content: content.into(),
                published_at: None,
            },
            pillar_id,
            "mock",
            None,
            0,
        );
        // Uniform components reproduce the requested overall (bias inverted).
        e.quality = Some(QualityScore::new(
            overall_target,
            overall_target,
            overall_target,
            overall_target,
            1.0 - overall_target,
        ));
        e.status = crate::evidence::EvidenceStatus::Scored;
        e
    }

    fn state_with_evidence() -> ResearchState {
        let mut state = ResearchState::new(thesis(), 2);
        let growth = state.thesis.pillars[0].id;
        let moat = state.thesis.pillars[1].id;

        for q in [0.9, 0.8, 0.3] {
            let e = scored_evidence(growth, &format!("Growth signal at {q}. More detail."), q);
            state.push_evidence(e);
        }
        state.push_evidence(scored_evidence(moat, "Moat evidence. Strong lock-in.", 0.7));

        state.pillar_aggregates.insert(
            growth,
            PillarAggregate {
                coverage: 0.9,
                mean_quality: 0.85,
                evidence_count: 2,
            },
        );
        state.pillar_aggregates.insert(
            moat,
            PillarAggregate {
                coverage: 0.8,
                mean_quality: 0.7,
                evidence_count: 1,
            },
        );
        state
    }

    #[test]
    fn test_citations_reference_existing_evidence() {
        let state = state_with_evidence();
        let report = ReportSynthesizer::new(5, 0.4, 0.7).synthesize(&state, false);
        for citation in &report.citations {
            assert!(
                state.evidence.iter().any(|e| e.id == citation.evidence_id),
                "citation references unknown evidence id"
            );
        }
        assert!(!report.citations.is_empty());
    }

    #[test]
    fn test_quality_floor_excludes_low_evidence() {
        let state = state_with_evidence();
        let report = ReportSynthesizer::new(5, 0.4, 0.7).synthesize(&state, false);
        let growth_section = &report.sections[0];
        let cited: Vec<_> = report
            .citations
            .iter()
            .filter(|c| c.section_id == growth_section.id)
            .collect();
        // The 0.3-quality record is below the floor.
        assert_eq!(cited.len(), 2);
    }

    #[test]
    fn test_top_n_truncation() {
        let state = state_with_evidence();
        let report = ReportSynthesizer::new(1, 0.0, 0.7).synthesize(&state, false);
        let growth_section = &report.sections[0];
        let cited = report
            .citations
            .iter()
            .filter(|c| c.section_id == growth_section.id)
            .count();
        assert_eq!(cited, 1);
    }

    #[test]
    fn test_confidence_is_weighted_coverage_times_quality() {
        let state = state_with_evidence();
        let report = ReportSynthesizer::new(5, 0.4, 0.7).synthesize(&state, false);
        let expected = 0.5 * 0.9 * 0.85 + 0.5 * 0.8 * 0.7;
        assert!((report.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_capped_run_with_gaps_is_low_band() {
        let mut state = state_with_evidence();
        // Push one pillar below the coverage bar.
        let moat = state.thesis.pillars[1].id;
        state.pillar_aggregates.get_mut(&moat).unwrap().coverage = 0.3;

        let report = ReportSynthesizer::new(5, 0.4, 0.7).synthesize(&state, true);
        assert_eq!(report.confidence_band, ConfidenceBand::Low);
        assert_eq!(report.unresolved_gaps.len(), 1);
        assert_eq!(report.unresolved_gaps[0].pillar_name, "Moat");
    }

    #[test]
    fn test_markdown_render_contains_sections_and_gaps() {
        let mut state = state_with_evidence();
        let moat = state.thesis.pillars[1].id;
        state.pillar_aggregates.get_mut(&moat).unwrap().coverage = 0.3;

        let report = ReportSynthesizer::new(5, 0.4, 0.7).synthesize(&state, true);
        let md = render_markdown(&report);
        assert!(md.contains("## Growth"));
        assert!(md.contains("Unresolved Gaps"));
        assert!(md.contains("How defensible?"));
    }

    #[test]
    fn test_empty_pillar_gets_placeholder_narrative() {
        let state = ResearchState::new(thesis(), 2);
        let report = ReportSynthesizer::new(5, 0.4, 0.7).synthesize(&state, false);
        assert!(report.sections[0].narrative.contains("No evidence"));
        assert!(report.citations.is_empty());
    }
}
