//! Research run state — the crash-recoverable snapshot owned by the engine.
//!
//! `ResearchState` is the single source of truth for a run. The engine
//! mutates it stage-by-stage and persists it before every stage advance, so
//! a crash resumes at the last completed stage. Evidence accumulates
//! monotonically; records are flagged superseded, never deleted.

use crate::error::OrchestratorError;
use crate::evidence::Evidence;
use crate::coverage::StopDecision;
use crate::querygen::SearchQuery;
use crate::report::{Citation, Report};
use crate::thesis::Thesis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Phase of a research run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResearchStatus {
    /// Run created, thesis not yet validated.
    Initializing,
    /// Validating and interpreting the thesis.
    InterpretingThesis,
    /// Generating or refining search queries.
    GeneratingQueries,
    /// Fan-out evidence collection in flight.
    GatheringEvidence,
    /// Scoring newly collected evidence.
    EvaluatingQuality,
    /// Coverage/gap analysis and the continue-or-stop decision.
    ReflectingAndRefining,
    /// Synthesizing the final report.
    GeneratingReport,
    /// Terminal: report produced.
    Completed,
    /// Terminal: unrecoverable error.
    Failed,
    /// Terminal: cooperative cancellation observed at a checkpoint.
    Cancelled,
}

impl ResearchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResearchStatus::Completed | ResearchStatus::Failed | ResearchStatus::Cancelled
        )
    }

    /// Legal forward transitions of the state machine. `Failed` is
    /// reachable from any non-terminal state and is not listed here;
    /// `Cancelled` likewise.
    fn can_advance_to(&self, next: ResearchStatus) -> bool {
        use ResearchStatus::*;
        matches!(
            (self, next),
            (Initializing, InterpretingThesis)
                | (InterpretingThesis, GeneratingQueries)
                | (GeneratingQueries, GatheringEvidence)
                | (GatheringEvidence, EvaluatingQuality)
                | (EvaluatingQuality, ReflectingAndRefining)
                | (ReflectingAndRefining, GeneratingQueries)
                | (ReflectingAndRefining, GeneratingReport)
                | (GeneratingReport, Completed)
        )
    }
}

impl std::fmt::Display for ResearchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResearchStatus::Initializing => "initializing",
            ResearchStatus::InterpretingThesis => "interpreting_thesis",
            ResearchStatus::GeneratingQueries => "generating_queries",
            ResearchStatus::GatheringEvidence => "gathering_evidence",
            ResearchStatus::EvaluatingQuality => "evaluating_quality",
            ResearchStatus::ReflectingAndRefining => "reflecting_and_refining",
            ResearchStatus::GeneratingReport => "generating_report",
            ResearchStatus::Completed => "completed",
            ResearchStatus::Failed => "failed",
            ResearchStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A non-fatal or fatal error recorded on the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    /// Stage during which the error occurred.
    pub stage: ResearchStatus,
    /// Pillar affected, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pillar_id: Option<Uuid>,
    /// Human-readable message.
    pub message: String,
    /// Whether this was a dead-lettered job (retries exhausted).
    #[serde(default)]
    pub dead_letter: bool,
    pub at: DateTime<Utc>,
}

/// Per-pillar aggregate refreshed after each evaluation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PillarAggregate {
    /// Coverage ratio in [0,1] against the configured target.
    pub coverage: f64,
    /// Mean overall quality of live evidence above the floor.
    pub mean_quality: f64,
    /// Count of live evidence records.
    pub evidence_count: usize,
}

/// The crash-recoverable state of one research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchState {
    /// Unique run id.
    pub id: Uuid,
    /// The immutable thesis driving this run.
    pub thesis: Thesis,
    /// Current phase.
    pub status: ResearchStatus,
    /// Completed refinement iterations.
    pub iteration_count: u32,
    /// Iteration cap for this run.
    pub max_iterations: u32,
    /// All evidence collected so far, append-only.
    pub evidence: Vec<Evidence>,
    /// Per-pillar aggregates keyed by pillar id.
    pub pillar_aggregates: BTreeMap<Uuid, PillarAggregate>,
    /// Citations produced during report synthesis.
    pub citations: Vec<Citation>,
    /// Errors recorded on the run (dead letters included).
    pub errors: Vec<RunError>,
    /// The final report, present once Completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
    /// Key terms derived during thesis interpretation, keyed by pillar id.
    /// The submitted thesis itself is never modified.
    #[serde(default)]
    pub derived_key_terms: BTreeMap<Uuid, Vec<String>>,
    /// Queries already issued this run; refinement never repeats one.
    pub seen_queries: HashSet<String>,
    /// Queries generated but not yet collected; drained by the gathering
    /// stage so a crash between the two stages loses no work.
    #[serde(default)]
    pub pending_queries: Vec<SearchQuery>,
    /// Thesis-wide weighted quality after each iteration, oldest first.
    pub quality_history: Vec<f64>,
    /// The stop decision that ended refinement, set when reflection stops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_decision: Option<StopDecision>,
    /// Set when cancellation was observed at a checkpoint.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Optimistic-concurrency version; incremented on every persisted write.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchState {
    /// Create a fresh run for a thesis.
    pub fn new(thesis: Thesis, max_iterations: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            thesis,
            status: ResearchStatus::Initializing,
            iteration_count: 0,
            max_iterations: max_iterations.max(1),
            evidence: Vec::new(),
            pillar_aggregates: BTreeMap::new(),
            citations: Vec::new(),
            errors: Vec::new(),
            report: None,
            derived_key_terms: BTreeMap::new(),
            seen_queries: HashSet::new(),
            pending_queries: Vec::new(),
            quality_history: Vec::new(),
            stop_decision: None,
            cancel_requested: false,
            version: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Advance to the next stage, enforcing the state machine's legal
    /// transitions.
    pub fn advance(&mut self, next: ResearchStatus) -> Result<(), OrchestratorError> {
        if !self.status.can_advance_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Move the run to `Failed`, recording the error.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.errors.push(RunError {
            stage: self.status,
            pillar_id: None,
            message: message.into(),
            dead_letter: false,
            at: Utc::now(),
        });
        self.status = ResearchStatus::Failed;
        self.touch();
    }

    /// Move the run to `Cancelled`. In-flight job results are discarded by
    /// the engine at the next checkpoint.
    pub fn cancel(&mut self) {
        self.cancel_requested = true;
        if !self.status.is_terminal() {
            self.status = ResearchStatus::Cancelled;
        }
        self.touch();
    }

    /// Append evidence; the evidence list is monotonic.
    pub fn push_evidence(&mut self, evidence: Evidence) {
        self.evidence.push(evidence);
        self.touch();
    }

    /// Record a dead-lettered collection job as a non-fatal gap.
    pub fn record_dead_letter(&mut self, pillar_id: Option<Uuid>, message: impl Into<String>) {
        self.errors.push(RunError {
            stage: self.status,
            pillar_id,
            message: message.into(),
            dead_letter: true,
            at: Utc::now(),
        });
        self.touch();
    }

    /// Live (non-superseded) evidence for a pillar.
    pub fn live_evidence_for(&self, pillar_id: &Uuid) -> Vec<&Evidence> {
        self.evidence
            .iter()
            .filter(|e| e.is_live() && e.pillar_id == *pillar_id)
            .collect()
    }

    /// Count of live evidence records across all pillars.
    pub fn live_evidence_count(&self) -> usize {
        self.evidence.iter().filter(|e| e.is_live()).count()
    }

    /// Whether every pillar is blocked by dead-lettered collection and has
    /// no evidence at all. This is the only provider-failure mode surfaced
    /// as a run-level failure.
    pub fn all_pillars_blocked(&self) -> bool {
        self.thesis.pillars.iter().all(|p| {
            self.live_evidence_for(&p.id).is_empty()
                && self
                    .errors
                    .iter()
                    .any(|e| e.dead_letter && e.pillar_id == Some(p.id))
        })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Status snapshot returned to external pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub status: ResearchStatus,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub evidence_count: usize,
    pub error_count: usize,
}

impl From<&ResearchState> for RunStatus {
    fn from(state: &ResearchState) -> Self {
        Self {
            run_id: state.id,
            status: state.status,
            iteration_count: state.iteration_count,
            max_iterations: state.max_iterations,
            evidence_count: state.live_evidence_count(),
            error_count: state.errors.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thesis::{Pillar, Thesis};

    fn thesis() -> Thesis {
        Thesis {
            statement: "Acme compounds".into(),
            company: "Acme".into(),
            website: None,
            pillars: vec![Pillar::new("Growth", 1.0, vec!["How fast?".into()])],
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut state = ResearchState::new(thesis(), 3);
        let path = [
            ResearchStatus::InterpretingThesis,
            ResearchStatus::GeneratingQueries,
            ResearchStatus::GatheringEvidence,
            ResearchStatus::EvaluatingQuality,
            ResearchStatus::ReflectingAndRefining,
            ResearchStatus::GeneratingReport,
            ResearchStatus::Completed,
        ];
        for next in path {
            state.advance(next).unwrap();
        }
        assert!(state.status.is_terminal());
    }

    #[test]
    fn test_refinement_loop_transition() {
        let mut state = ResearchState::new(thesis(), 3);
        state.advance(ResearchStatus::InterpretingThesis).unwrap();
        state.advance(ResearchStatus::GeneratingQueries).unwrap();
        state.advance(ResearchStatus::GatheringEvidence).unwrap();
        state.advance(ResearchStatus::EvaluatingQuality).unwrap();
        state
            .advance(ResearchStatus::ReflectingAndRefining)
            .unwrap();
        // Loop back for another iteration.
        state.advance(ResearchStatus::GeneratingQueries).unwrap();
        assert_eq!(state.status, ResearchStatus::GeneratingQueries);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut state = ResearchState::new(thesis(), 3);
        let err = state.advance(ResearchStatus::GeneratingReport).unwrap_err();
        assert!(err.to_string().contains("initializing"));
    }

    #[test]
    fn test_fail_from_any_state() {
        let mut state = ResearchState::new(thesis(), 3);
        state.advance(ResearchStatus::InterpretingThesis).unwrap();
        state.fail("malformed thesis");
        assert_eq!(state.status, ResearchStatus::Failed);
        assert_eq!(state.errors.len(), 1);
        assert_eq!(state.errors[0].stage, ResearchStatus::InterpretingThesis);
    }

    #[test]
    fn test_cancel_is_terminal_and_sticky() {
        let mut state = ResearchState::new(thesis(), 3);
        state.cancel();
        assert_eq!(state.status, ResearchStatus::Cancelled);
        assert!(state.cancel_requested);
        assert!(state.advance(ResearchStatus::InterpretingThesis).is_err());
    }

    #[test]
    fn test_dead_letter_recorded_not_fatal() {
        let mut state = ResearchState::new(thesis(), 3);
        let pillar_id = state.thesis.pillars[0].id;
        state.record_dead_letter(Some(pillar_id), "rate limited 3 times");
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].dead_letter);
        assert!(!state.status.is_terminal());
    }

    #[test]
    fn test_all_pillars_blocked() {
        let mut state = ResearchState::new(thesis(), 3);
        let pillar_id = state.thesis.pillars[0].id;
        assert!(!state.all_pillars_blocked());
        state.record_dead_letter(Some(pillar_id), "exhausted");
        assert!(state.all_pillars_blocked());
    }

    #[test]
    fn test_status_snapshot() {
        let state = ResearchState::new(thesis(), 2);
        let status = RunStatus::from(&state);
        assert_eq!(status.status, ResearchStatus::Initializing);
        assert_eq!(status.evidence_count, 0);
        assert_eq!(status.max_iterations, 2);
    }
}
