//! Gap analysis — per-pillar coverage, refinement targets, and the
//! stopping rule.
//!
//! Coverage scoring is a heuristic kept behind the `CoverageScorer` trait
//! so it can be swapped or unit-tested independently of the orchestration
//! state machine. The analyzer also computes the iteration-over-iteration
//! delta in thesis-wide weighted quality that drives stagnation detection.

use crate::embeddings::{Embedder, cosine_similarity};
use crate::evidence::Evidence;
use crate::state::{PillarAggregate, ResearchState};
use crate::thesis::Pillar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Why the analyzer decided to stop, or that it should continue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopDecision {
    /// At least one under-covered pillar and budget remains.
    Continue,
    /// Every pillar meets the coverage and quality bar.
    CoverageMet,
    /// Iteration cap reached; report is emitted at lower confidence.
    MaxIterations,
    /// Quality improvement stayed below the minimum delta for the
    /// configured number of consecutive iterations.
    Stagnation,
}

impl StopDecision {
    pub fn should_stop(&self) -> bool {
        !matches!(self, StopDecision::Continue)
    }
}

/// An under-covered pillar, ranked for refinement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PillarGap {
    pub pillar_id: Uuid,
    pub pillar_name: String,
    pub coverage: f64,
    /// Weight-scaled shortfall used for ranking.
    pub severity: f64,
    /// Questions with no adequate supporting evidence.
    pub unanswered_questions: Vec<String>,
}

/// Result of one gap-analysis pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapAnalysis {
    /// Refreshed per-pillar aggregates.
    pub aggregates: BTreeMap<Uuid, PillarAggregate>,
    /// Under-covered pillars, most severe first.
    pub gaps: Vec<PillarGap>,
    /// Thesis-wide weighted quality in [0,1].
    pub weighted_quality: f64,
    /// Improvement over the previous iteration, if there was one.
    pub quality_delta: Option<f64>,
    pub decision: StopDecision,
}

/// Pluggable per-pillar coverage scoring.
pub trait CoverageScorer: Send + Sync {
    /// Score a pillar's coverage from its live evidence. Returns the
    /// aggregate and the list of questions judged unanswered.
    fn score_pillar(&self, pillar: &Pillar, evidence: &[&Evidence]) -> (PillarAggregate, Vec<String>);
}

/// Default scorer: quality-weighted evidence mass against a target, with
/// per-question semantic matching.
pub struct QualityWeightedScorer<E: Embedder> {
    embedder: E,
    /// Quality mass equivalent to "fully covered" (e.g. 2.0 means two
    /// perfect-quality records saturate a pillar).
    target_mass: f64,
    /// Evidence below this overall score contributes nothing.
    quality_floor: f64,
    /// Similarity above which a question counts as addressed.
    question_match_threshold: f32,
}

impl<E: Embedder> QualityWeightedScorer<E> {
    pub fn new(embedder: E, target_mass: f64, quality_floor: f64) -> Self {
        Self {
            embedder,
            target_mass: target_mass.max(f64::EPSILON),
            quality_floor,
            question_match_threshold: 0.25,
        }
    }
}

impl<E: Embedder> CoverageScorer for QualityWeightedScorer<E> {
    fn score_pillar(&self, pillar: &Pillar, evidence: &[&Evidence]) -> (PillarAggregate, Vec<String>) {
        let usable: Vec<&&Evidence> = evidence
            .iter()
            .filter(|e| e.overall_quality() >= self.quality_floor)
            .collect();

        let mass: f64 = usable.iter().map(|e| e.overall_quality()).sum();
        let coverage = (mass / self.target_mass).min(1.0);
        let mean_quality = if usable.is_empty() {
            0.0
        } else {
            mass / usable.len() as f64
        };

        let mut unanswered = Vec::new();
        for question in &pillar.questions {
            let question_vec = self.embedder.embed(question);
            let addressed = usable.iter().any(|e| {
                cosine_similarity(&question_vec, &self.embedder.embed(&e.content))
                    >= self.question_match_threshold
            });
            if !addressed {
                unanswered.push(question.clone());
            }
        }

        (
            PillarAggregate {
                coverage,
                mean_quality,
                evidence_count: usable.len(),
            },
            unanswered,
        )
    }
}

/// Convergence thresholds for the stopping rule. All values are
/// configuration, not fixed behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Coverage a pillar must reach to count as covered. Default 0.7.
    pub coverage_target: f64,
    /// Mean quality a pillar must reach alongside coverage. Default 0.4.
    pub quality_bar: f64,
    /// Minimum thesis-wide quality improvement per iteration. Default 0.02.
    pub min_quality_delta: f64,
    /// Consecutive sub-delta iterations before stagnation. Default 2.
    pub stagnation_window: usize,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            coverage_target: 0.7,
            quality_bar: 0.4,
            min_quality_delta: 0.02,
            stagnation_window: 2,
        }
    }
}

/// Computes coverage, ranks gaps, and applies the stopping rule.
pub struct GapAnalyzer<S: CoverageScorer> {
    scorer: S,
    convergence: ConvergenceConfig,
}

impl<S: CoverageScorer> GapAnalyzer<S> {
    pub fn new(scorer: S, convergence: ConvergenceConfig) -> Self {
        Self { scorer, convergence }
    }

    /// Analyze the run after an evaluation pass. `state.quality_history`
    /// must already contain entries for prior iterations but not the
    /// current one.
    pub fn analyze(&self, state: &ResearchState) -> GapAnalysis {
        let mut aggregates = BTreeMap::new();
        let mut gaps = Vec::new();
        let mut weighted_quality = 0.0;

        for pillar in &state.thesis.pillars {
            let live = state.live_evidence_for(&pillar.id);
            let (aggregate, unanswered) = self.scorer.score_pillar(pillar, &live);

            weighted_quality += pillar.weight * aggregate.coverage * aggregate.mean_quality;

            let covered = aggregate.coverage >= self.convergence.coverage_target
                && aggregate.mean_quality >= self.convergence.quality_bar;
            if !covered {
                gaps.push(PillarGap {
                    pillar_id: pillar.id,
                    pillar_name: pillar.name.clone(),
                    coverage: aggregate.coverage,
                    severity: pillar.weight * (self.convergence.coverage_target - aggregate.coverage).max(0.0),
                    unanswered_questions: unanswered,
                });
            }

            aggregates.insert(pillar.id, aggregate);
        }

        gaps.sort_by(|a, b| {
            b.severity
                .partial_cmp(&a.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let weighted_quality = weighted_quality.clamp(0.0, 1.0);
        let quality_delta = state
            .quality_history
            .last()
            .map(|prev| weighted_quality - prev);

        let decision = self.decide(state, &gaps, quality_delta);

        GapAnalysis {
            aggregates,
            gaps,
            weighted_quality,
            quality_delta,
            decision,
        }
    }

    /// The stopping rule: coverage bar first, then the
    /// iteration cap, then stagnation; otherwise continue.
    fn decide(
        &self,
        state: &ResearchState,
        gaps: &[PillarGap],
        quality_delta: Option<f64>,
    ) -> StopDecision {
        if gaps.is_empty() {
            return StopDecision::CoverageMet;
        }
        if state.iteration_count >= state.max_iterations {
            return StopDecision::MaxIterations;
        }

        // Stagnation: the current delta plus the tail of history must show
        // `stagnation_window` consecutive sub-threshold improvements.
        if let Some(delta) = quality_delta {
            if delta < self.convergence.min_quality_delta {
                let w = self.convergence.stagnation_window;
                let mut consecutive = 1usize;
                let history = &state.quality_history;
                for pair in history.windows(2).rev() {
                    if pair[1] - pair[0] < self.convergence.min_quality_delta {
                        consecutive += 1;
                    } else {
                        break;
                    }
                }
                if consecutive >= w {
                    return StopDecision::Stagnation;
                }
            }
        }

        StopDecision::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::LocalEmbedder;
    use crate::evidence::RawDocument;
    use crate::quality::QualityScore;
    use crate::state::ResearchState;
    use crate::thesis::Thesis;

    fn thesis() -> Thesis {
        Thesis {
            statement: "Acme compounds".into(),
            company: "Acme".into(),
            website: None,
            pillars: vec![
                Pillar::new(
                    "Growth",
                    0.5,
                    vec!["How fast is annual recurring revenue growing?".into()],
                ),
                Pillar::new(
                    "Moat",
                    0.5,
                    vec!["What switching costs protect the product?".into()],
                ),
            ],
        }
    }

    fn scored(pillar: Uuid, content: &str, quality: f64) -> Evidence {
        let mut e = Evidence::from_raw(
            RawDocument {
                title: "doc".into(),
                url: "https://reuters.com/news/acme".into(),
                content: content.into(),
                published_at: None,
            },
            pillar,
            "mock",
            None,
            0,
        );
        e.quality = Some(QualityScore::new(quality, quality, quality, quality, 1.0 - quality));
        e
    }

    fn analyzer() -> GapAnalyzer<QualityWeightedScorer<LocalEmbedder>> {
        GapAnalyzer::new(
            QualityWeightedScorer::new(LocalEmbedder::default(), 2.0, 0.4),
            ConvergenceConfig::default(),
        )
    }

    /// With coverage {high, low} and budget remaining, the
    /// low pillar is selected and the decision is Continue.
    #[test]
    fn test_undercovered_pillar_selected_for_refinement() {
        let mut state = ResearchState::new(thesis(), 2);
        state.iteration_count = 1;
        let growth = state.thesis.pillars[0].id;
        let moat = state.thesis.pillars[1].id;

        // Saturate growth, starve moat.
        for _ in 0..3 {
            state.push_evidence(scored(
                growth,
                "Annual recurring revenue growing 45% with strong cohorts.",
                0.9,
            ));
        }
        state.push_evidence(scored(moat, "Brief mention of switching costs.", 0.3));

        let analysis = analyzer().analyze(&state);
        assert_eq!(analysis.decision, StopDecision::Continue);
        assert_eq!(analysis.gaps.len(), 1);
        assert_eq!(analysis.gaps[0].pillar_id, moat);
        assert!(analysis.aggregates[&growth].coverage > analysis.aggregates[&moat].coverage);
    }

    #[test]
    fn test_coverage_met_stops() {
        let mut state = ResearchState::new(thesis(), 3);
        state.iteration_count = 1;
        for pillar in state.thesis.pillars.clone() {
            for _ in 0..3 {
                state.push_evidence(scored(
                    pillar.id,
                    &format!("Detailed evidence addressing: {}", pillar.questions[0]),
                    0.9,
                ));
            }
        }
        let analysis = analyzer().analyze(&state);
        assert_eq!(analysis.decision, StopDecision::CoverageMet);
        assert!(analysis.gaps.is_empty());
    }

    /// Iteration cap reached with gaps remaining.
    #[test]
    fn test_max_iterations_stops_with_gaps() {
        let mut state = ResearchState::new(thesis(), 1);
        state.iteration_count = 1;
        let analysis = analyzer().analyze(&state);
        assert_eq!(analysis.decision, StopDecision::MaxIterations);
        assert!(!analysis.gaps.is_empty());
    }

    #[test]
    fn test_stagnation_after_two_flat_iterations() {
        let mut state = ResearchState::new(thesis(), 10);
        state.iteration_count = 3;
        // History shows one flat step already; current delta is flat too.
        state.quality_history = vec![0.30, 0.305];
        let analysis = analyzer().analyze(&state);
        // weighted_quality is ~0 here, so current delta is negative (flat).
        assert_eq!(analysis.decision, StopDecision::Stagnation);
    }

    #[test]
    fn test_improving_run_continues() {
        let mut state = ResearchState::new(thesis(), 10);
        state.iteration_count = 2;
        state.quality_history = vec![0.1];
        let growth = state.thesis.pillars[0].id;
        state.push_evidence(scored(
            growth,
            "Annual recurring revenue growing 45% with expansion revenue.",
            0.9,
        ));
        let analysis = analyzer().analyze(&state);
        assert!(analysis.quality_delta.unwrap() >= 0.02);
        assert_eq!(analysis.decision, StopDecision::Continue);
    }

    #[test]
    fn test_gaps_ranked_by_weighted_severity() {
        let mut t = thesis();
        t.pillars[0].weight = 0.8;
        t.pillars[1].weight = 0.2;
        let mut state = ResearchState::new(t, 5);
        state.iteration_count = 1;

        let analysis = analyzer().analyze(&state);
        assert_eq!(analysis.gaps.len(), 2);
        // Both have zero coverage, so the heavier pillar ranks first.
        assert_eq!(analysis.gaps[0].pillar_name, "Growth");
    }

    #[test]
    fn test_unanswered_questions_reported() {
        let mut state = ResearchState::new(thesis(), 5);
        state.iteration_count = 1;
        let growth = state.thesis.pillars[0].id;
        state.push_evidence(scored(
            growth,
            "Completely unrelated content about office furniture.",
            0.8,
        ));

        let analysis = analyzer().analyze(&state);
        let growth_gap = analysis
            .gaps
            .iter()
            .find(|g| g.pillar_id == growth);
        if let Some(gap) = growth_gap {
            assert!(!gap.unanswered_questions.is_empty());
        }
    }
}
