//! The research engine: drives a run through its lifecycle.
//!
//! Each stage mutates the run state, advances the status, and persists the
//! snapshot before the next stage executes, so resuming after a crash
//! re-enters at the first stage whose work is not yet recorded. Work is
//! dispatched through the typed job queues: evidence collection on the
//! search pool, model summarization on the analysis pool, scoring on the
//! quality pool, and gap analysis on the orchestration pool.

use crate::collector::EvidenceCollector;
use crate::config::{DiligoConfig, QueueConfig};
use crate::coverage::{GapAnalysis, GapAnalyzer, QualityWeightedScorer, StopDecision};
use crate::dedup::Deduplicator;
use crate::embeddings::LocalEmbedder;
use crate::error::{DiligoError, OrchestratorError, ProviderError, Result};
use crate::evidence::{Evidence, EvidenceStatus};
use crate::providers::{OutputSchema, ProviderPool, SearchProvider, TaskKind};
use crate::quality::{QualityEvaluator, QualityScore};
use crate::querygen::QueryGenerator;
use crate::queue::{JobQueues, JobResult, JobSpec, PoolConfig, Priority, RetryPolicy};
use crate::report::{Report, ReportSynthesizer};
use crate::state::{ResearchState, ResearchStatus, RunStatus};
use crate::store::StateStore;
use crate::thesis::{Pillar, Thesis};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Callback invoked after every persisted stage transition.
pub type ProgressFn = dyn Fn(RunStatus) + Send + Sync;

/// Orchestrates research runs end to end.
pub struct ResearchEngine {
    config: DiligoConfig,
    store: Arc<dyn StateStore>,
    queues: JobQueues,
    collector: EvidenceCollector,
    models: Arc<ProviderPool>,
    evaluator: Arc<QualityEvaluator<LocalEmbedder>>,
    deduplicator: Deduplicator<LocalEmbedder>,
    analyzer: Arc<GapAnalyzer<QualityWeightedScorer<LocalEmbedder>>>,
    query_generator: QueryGenerator,
    synthesizer: ReportSynthesizer,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    active_runs: Mutex<HashSet<Uuid>>,
    on_progress: Option<Box<ProgressFn>>,
}

fn pool_config(queue: &QueueConfig) -> PoolConfig {
    PoolConfig {
        concurrency: queue.concurrency,
        attempt_timeout: Duration::from_secs(queue.attempt_timeout_secs),
        retry: RetryPolicy {
            max_attempts: queue.max_attempts,
            base_delay_ms: queue.base_delay_ms,
            max_delay_ms: queue.max_delay_ms,
        },
    }
}

impl ResearchEngine {
    pub fn new(
        config: DiligoConfig,
        store: Arc<dyn StateStore>,
        search: Arc<dyn SearchProvider>,
        models: ProviderPool,
    ) -> Self {
        let embedder = LocalEmbedder::new(config.engine.embedding_dimensions);
        let queues = JobQueues::new(
            pool_config(&config.queues.search),
            pool_config(&config.queues.analysis),
            pool_config(&config.queues.quality),
            pool_config(&config.queues.orchestration),
        );
        let collector = EvidenceCollector::new(
            search,
            config.search.max_docs_per_query,
            config.search.fetch_full_below,
        );
        let analyzer = GapAnalyzer::new(
            QualityWeightedScorer::new(
                embedder.clone(),
                config.engine.coverage_target_mass,
                config.quality.quality_floor,
            ),
            config.engine.convergence.clone(),
        );
        let synthesizer = ReportSynthesizer::new(
            config.quality.citations_per_pillar,
            config.quality.quality_floor,
            config.engine.convergence.coverage_target,
        );
        let query_generator = QueryGenerator::new(
            config.engine.queries_per_weight,
            config.engine.max_queries_per_pillar,
        );
        let deduplicator =
            Deduplicator::new(embedder.clone(), config.engine.dedup_similarity as f32);

        Self {
            store,
            queues,
            collector,
            models: Arc::new(models),
            evaluator: Arc::new(
                QualityEvaluator::new(embedder).with_half_life(config.quality.recency_half_life_days),
            ),
            deduplicator,
            analyzer: Arc::new(analyzer),
            query_generator,
            synthesizer,
            cancel_tokens: Mutex::new(HashMap::new()),
            active_runs: Mutex::new(HashSet::new()),
            on_progress: None,
            config,
        }
    }

    /// Install a progress callback invoked after every persisted stage.
    pub fn with_progress(mut self, f: impl Fn(RunStatus) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Validate a thesis and create a new run in `Initializing`.
    pub async fn start_run(&self, thesis: Thesis) -> Result<Uuid> {
        thesis.validate().map_err(DiligoError::Orchestrator)?;
        let mut state = ResearchState::new(thesis, self.config.engine.max_iterations);
        self.store.save(&mut state).await?;
        info!(run_id = %state.id, company = %state.thesis.company, "run created");
        Ok(state.id)
    }

    /// Drive a run until it reaches a terminal state. Also serves as
    /// resume: a run loaded mid-lifecycle re-enters at its persisted stage.
    pub async fn run_to_completion(&self, id: Uuid) -> Result<RunStatus> {
        let cancel = self.token_for(id);
        self.mark_active(id, true);
        let result = self.drive(id, &cancel).await;
        self.mark_active(id, false);
        result
    }

    /// Current status snapshot of a run.
    pub async fn get_status(&self, id: Uuid) -> Result<RunStatus> {
        let state = self.store.load(id).await?;
        Ok(RunStatus::from(&state))
    }

    /// The finished report; an error until the run completes.
    pub async fn get_report(&self, id: Uuid) -> Result<Report> {
        let state = self.store.load(id).await?;
        state
            .report
            .clone()
            .ok_or(DiligoError::Orchestrator(OrchestratorError::NotFinished {
                id,
            }))
    }

    /// Request cooperative cancellation.
    ///
    /// A running driver observes the token at its next checkpoint. A run
    /// with no active driver is moved to `Cancelled` directly.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        self.token_for(id).cancel();
        let is_active = self
            .active_runs
            .lock()
            .map(|a| a.contains(&id))
            .unwrap_or(false);
        if !is_active {
            let mut state = self.store.load(id).await?;
            if !state.status.is_terminal() {
                state.cancel();
                self.store.save(&mut state).await?;
            }
        }
        info!(run_id = %id, "cancellation requested");
        Ok(())
    }

    /// All known runs, most recently updated first.
    pub async fn list_runs(&self) -> Result<Vec<RunStatus>> {
        Ok(self.store.list().await?)
    }

    fn token_for(&self, id: Uuid) -> CancellationToken {
        let mut tokens = match self.cancel_tokens.lock() {
            Ok(tokens) => tokens,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens.entry(id).or_default().clone()
    }

    fn mark_active(&self, id: Uuid, active: bool) {
        if let Ok(mut runs) = self.active_runs.lock() {
            if active {
                runs.insert(id);
            } else {
                runs.remove(&id);
            }
        }
    }

    async fn persist(&self, state: &mut ResearchState) -> Result<()> {
        self.store.save(state).await?;
        if let Some(on_progress) = &self.on_progress {
            on_progress(RunStatus::from(&*state));
        }
        Ok(())
    }

    async fn drive(&self, id: Uuid, cancel: &CancellationToken) -> Result<RunStatus> {
        let mut state = self.store.load(id).await?;

        while !state.status.is_terminal() {
            // Cancellation checkpoint between stages. Results of jobs that
            // already settled stay in the persisted state.
            if cancel.is_cancelled() {
                state.cancel();
                self.persist(&mut state).await?;
                break;
            }

            debug!(run_id = %id, stage = %state.status, iteration = state.iteration_count, "entering stage");
            match state.status {
                ResearchStatus::Initializing => {
                    if let Err(err) = state.thesis.validate() {
                        state.fail(err.to_string());
                    } else {
                        state.advance(ResearchStatus::InterpretingThesis)?;
                    }
                }
                ResearchStatus::InterpretingThesis => {
                    self.interpret_thesis(&mut state).await;
                    state.advance(ResearchStatus::GeneratingQueries)?;
                }
                ResearchStatus::GeneratingQueries => {
                    self.generate_queries(&mut state).await;
                    state.advance(ResearchStatus::GatheringEvidence)?;
                }
                ResearchStatus::GatheringEvidence => {
                    let cancelled = self.gather_evidence(&mut state, cancel).await;
                    if cancelled {
                        state.cancel();
                    } else if state.all_pillars_blocked() {
                        state.fail(OrchestratorError::AllPillarsBlocked.to_string());
                    } else {
                        state.advance(ResearchStatus::EvaluatingQuality)?;
                    }
                }
                ResearchStatus::EvaluatingQuality => {
                    self.evaluate_quality(&mut state, cancel).await;
                    self.summarize_evidence(&mut state, cancel).await;
                    state.advance(ResearchStatus::ReflectingAndRefining)?;
                }
                ResearchStatus::ReflectingAndRefining => {
                    // The pass that just gathered counts against the cap
                    // before the analyzer decides whether to run another.
                    state.iteration_count += 1;
                    let analysis = self.reflect(&state, cancel).await;
                    state.pillar_aggregates = analysis.aggregates.clone();
                    state.quality_history.push(analysis.weighted_quality);

                    match analysis.decision {
                        StopDecision::Continue => {
                            info!(
                                run_id = %id,
                                iteration = state.iteration_count,
                                gaps = analysis.gaps.len(),
                                weighted_quality = analysis.weighted_quality,
                                "refining"
                            );
                            state.advance(ResearchStatus::GeneratingQueries)?;
                        }
                        decision => {
                            info!(run_id = %id, ?decision, "refinement stopped");
                            state.stop_decision = Some(decision);
                            state.advance(ResearchStatus::GeneratingReport)?;
                        }
                    }
                }
                ResearchStatus::GeneratingReport => {
                    let report = self.generate_report(&state).await;
                    state.citations = report.citations.clone();
                    state.report = Some(report);
                    state.advance(ResearchStatus::Completed)?;
                }
                // Terminal states exit the loop above.
                ResearchStatus::Completed | ResearchStatus::Failed | ResearchStatus::Cancelled => {
                    break;
                }
            }

            self.persist(&mut state).await?;
        }

        info!(run_id = %id, status = %state.status, "run settled");
        Ok(RunStatus::from(&state))
    }

    /// Thesis interpretation: derive key terms per pillar, heuristically
    /// and (when a model serves the task) semantically. Derived terms live
    /// on the run state; the submitted thesis is never modified.
    async fn interpret_thesis(&self, state: &mut ResearchState) {
        for pillar in &state.thesis.pillars {
            if pillar.key_terms.is_empty() {
                state
                    .derived_key_terms
                    .insert(pillar.id, heuristic_key_terms(pillar));
            }
        }

        if !self.models.supports(TaskKind::InterpretThesis) {
            return;
        }

        let schema = OutputSchema::new(vec!["key_terms"]);
        for pillar in &state.thesis.pillars {
            let prompt = format!(
                "Extract 3-5 short search key terms for the research pillar '{}' of an \
                 investment thesis on {}. Thesis: {}. Pillar questions: {}",
                pillar.name,
                state.thesis.company,
                state.thesis.statement,
                pillar.question_text(),
            );
            match self
                .models
                .complete(TaskKind::InterpretThesis, &prompt, &schema)
                .await
            {
                Ok(value) => {
                    let terms: Vec<String> = value["key_terms"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|t| t.as_str())
                                .map(str::to_string)
                                .collect()
                        })
                        .unwrap_or_default();
                    let derived = state.derived_key_terms.entry(pillar.id).or_default();
                    for term in terms {
                        if !pillar
                            .key_terms
                            .iter()
                            .chain(derived.iter())
                            .any(|t| t.eq_ignore_ascii_case(&term))
                        {
                            derived.push(term);
                        }
                    }
                }
                Err(err) => {
                    // Interpretation is an enrichment; degrade to heuristics.
                    warn!(pillar = %pillar.name, error = %err, "thesis interpretation degraded");
                }
            }
        }
    }

    async fn generate_queries(&self, state: &mut ResearchState) {
        let batch = if state.iteration_count == 0 {
            let mut seen = std::mem::take(&mut state.seen_queries);
            let batch = self.query_generator.initial_batch(
                &state.thesis,
                &state.derived_key_terms,
                &mut seen,
            );
            state.seen_queries = seen;
            batch
        } else {
            let gaps = self.analyzer.analyze(state).gaps;
            let mut seen = std::mem::take(&mut state.seen_queries);
            let batch = self.query_generator.refine_batch(
                &state.thesis,
                &state.derived_key_terms,
                &gaps,
                &mut seen,
            );
            state.seen_queries = seen;
            batch
        };
        debug!(run_id = %state.id, queries = batch.len(), "query batch generated");
        state.pending_queries = batch;
        if state.iteration_count == 0 {
            self.phrase_pending_queries(state).await;
        }
    }

    /// Rewrite the initial batch's question-shaped queries as search
    /// phrasings, when a model serves the task. Keeps a query's original
    /// text when the model's phrasing is empty or already seen.
    async fn phrase_pending_queries(&self, state: &mut ResearchState) {
        if !self.models.supports(TaskKind::PhraseQueries) || state.pending_queries.is_empty() {
            return;
        }

        let listing = state
            .pending_queries
            .iter()
            .enumerate()
            .map(|(i, q)| format!("{}. {}", i + 1, q.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Rewrite each numbered research question about {} as a concise web search \
             query. Return a JSON field 'queries' holding exactly {} strings, in order.\n\n{}",
            state.thesis.company,
            state.pending_queries.len(),
            listing
        );
        let schema = OutputSchema::new(vec!["queries"]);

        match self
            .models
            .complete(TaskKind::PhraseQueries, &prompt, &schema)
            .await
        {
            Ok(value) => {
                let phrased: Vec<String> = value["queries"]
                    .as_array()
                    .map(|a| {
                        a.iter()
                            .filter_map(|q| q.as_str())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                if phrased.len() != state.pending_queries.len() {
                    warn!(
                        expected = state.pending_queries.len(),
                        got = phrased.len(),
                        "query phrasing count mismatch; keeping original batch"
                    );
                    return;
                }
                for (query, text) in state.pending_queries.iter_mut().zip(phrased) {
                    let text = text.trim().to_string();
                    if !text.is_empty() && state.seen_queries.insert(text.to_lowercase()) {
                        query.text = text;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "query phrasing degraded; keeping original batch");
            }
        }
    }

    /// Returns true when cancellation was observed mid-batch.
    async fn gather_evidence(&self, state: &mut ResearchState, cancel: &CancellationToken) -> bool {
        let queries = std::mem::take(&mut state.pending_queries);
        if queries.is_empty() {
            return false;
        }
        // Refinement passes jump the queue ahead of any other search work.
        let priority = if state.iteration_count == 0 {
            Priority::Normal
        } else {
            Priority::High
        };

        let batch = self
            .collector
            .collect(
                queries,
                &self.queues.search,
                priority,
                state.thesis.website.as_deref(),
                state.iteration_count,
                cancel,
            )
            .await;

        for evidence in batch.evidence {
            state.push_evidence(evidence);
        }
        for failure in &batch.dead_letters {
            state.record_dead_letter(
                Some(failure.pillar_id),
                format!("query '{}' dead-lettered: {}", failure.query, failure.error),
            );
        }

        let superseded = self.deduplicator.dedup(&mut state.evidence);
        if superseded > 0 {
            debug!(run_id = %state.id, superseded, "dedup pass merged duplicates");
        }
        batch.cancelled
    }

    /// Score every unscored live record on the quality pool, one job per
    /// pillar.
    async fn evaluate_quality(&self, state: &mut ResearchState, cancel: &CancellationToken) {
        let now = Utc::now();
        let mut specs: Vec<JobSpec<Vec<(Uuid, QualityScore)>>> = Vec::new();

        for pillar in &state.thesis.pillars {
            let unscored: Vec<Evidence> = state
                .evidence
                .iter()
                .filter(|e| {
                    e.pillar_id == pillar.id && e.is_live() && e.status == EvidenceStatus::Collected
                })
                .cloned()
                .collect();
            if unscored.is_empty() {
                continue;
            }

            let evaluator = self.evaluator.clone();
            // Score against the derived terms too, without touching the
            // submitted thesis.
            let mut pillar = pillar.clone();
            if let Some(derived) = state.derived_key_terms.get(&pillar.id) {
                pillar.key_terms.extend(derived.iter().cloned());
            }
            specs.push(JobSpec {
                name: format!("score:{}", pillar.name),
                priority: Priority::Normal,
                pillar_id: Some(pillar.id),
                op: Box::new(move |_attempt| {
                    let evaluator = evaluator.clone();
                    let pillar = pillar.clone();
                    let unscored = unscored.clone();
                    Box::pin(async move {
                        Ok::<_, ProviderError>(
                            unscored
                                .iter()
                                .map(|e| (e.id, evaluator.score(e, &pillar, now)))
                                .collect(),
                        )
                    })
                }),
            });
        }

        let outcomes = self.queues.quality.run_batch(specs, cancel).await;
        for outcome in outcomes {
            if let JobResult::Completed(scores) = outcome.result {
                for (id, score) in scores {
                    if let Some(evidence) = state.evidence.iter_mut().find(|e| e.id == id) {
                        evidence.quality = Some(score);
                        evidence.status = EvidenceStatus::Scored;
                    }
                }
            }
        }
    }

    /// Replace heuristic summaries with model summaries for evidence worth
    /// citing, when a model serves the task. Failures keep the heuristic.
    async fn summarize_evidence(&self, state: &mut ResearchState, cancel: &CancellationToken) {
        if !self.models.supports(TaskKind::Summarize) {
            return;
        }

        let floor = self.config.quality.quality_floor;
        let candidates: Vec<(Uuid, String, String)> = state
            .evidence
            .iter()
            .filter(|e| {
                e.is_live()
                    && e.overall_quality() >= floor
                    && e.iteration == state.iteration_count
            })
            .map(|e| {
                let pillar_questions = state
                    .thesis
                    .pillar(&e.pillar_id)
                    .map(|p| p.question_text())
                    .unwrap_or_default();
                (e.id, truncate(&e.content, 2000), pillar_questions)
            })
            .collect();

        let schema = Arc::new(OutputSchema::new(vec!["summary"]));
        let specs: Vec<JobSpec<(Uuid, String)>> = candidates
            .into_iter()
            .map(|(id, content, questions)| {
                let models = self.models.clone();
                let schema = schema.clone();
                JobSpec {
                    name: format!("summarize:{id}"),
                    priority: Priority::Low,
                    pillar_id: None,
                    op: Box::new(move |_attempt| {
                        let models = models.clone();
                        let schema = schema.clone();
                        let prompt = format!(
                            "Summarize the following source material in 2-3 sentences, \
                             focused on: {questions}\n\n{content}"
                        );
                        Box::pin(async move {
                            let value = models
                                .complete(TaskKind::Summarize, &prompt, &schema)
                                .await
                                .map_err(|e| ProviderError::RequestFailed {
                                    provider: "model-pool".into(),
                                    message: e.to_string(),
                                })?;
                            let summary = value["summary"]
                                .as_str()
                                .unwrap_or_default()
                                .trim()
                                .to_string();
                            Ok((id, summary))
                        })
                    }),
                }
            })
            .collect();

        let outcomes = self.queues.analysis.run_batch(specs, cancel).await;
        for outcome in outcomes {
            if let JobResult::Completed((id, summary)) = outcome.result {
                if summary.is_empty() {
                    continue;
                }
                if let Some(evidence) = state.evidence.iter_mut().find(|e| e.id == id) {
                    evidence.summary = summary;
                }
            }
        }
    }

    /// Run gap analysis on the orchestration pool.
    async fn reflect(&self, state: &ResearchState, cancel: &CancellationToken) -> GapAnalysis {
        let analyzer = self.analyzer.clone();
        let snapshot = state.clone();
        let spec: JobSpec<GapAnalysis> = JobSpec {
            name: format!("reflect:{}", state.id),
            priority: Priority::High,
            pillar_id: None,
            op: Box::new(move |_attempt| {
                let analyzer = analyzer.clone();
                let snapshot = snapshot.clone();
                Box::pin(async move { Ok::<_, ProviderError>(analyzer.analyze(&snapshot)) })
            }),
        };

        let mut outcomes = self.queues.orchestration.run_batch(vec![spec], cancel).await;
        match outcomes.pop().map(|o| o.result) {
            Some(JobResult::Completed(analysis)) => analysis,
            // Cancelled or dead-lettered: analyze inline so the stage can
            // still settle; the cancellation checkpoint runs next.
            _ => self.analyzer.analyze(state),
        }
    }

    async fn generate_report(&self, state: &ResearchState) -> Report {
        let stopped_at_cap = state.stop_decision == Some(StopDecision::MaxIterations);
        let mut report = self.synthesizer.synthesize(state, stopped_at_cap);

        if self.models.supports(TaskKind::ReportProse) {
            let schema = OutputSchema::new(vec!["narrative"]);
            for section in &mut report.sections {
                if section.narrative.is_empty() {
                    continue;
                }
                let prompt = format!(
                    "Rewrite the following research notes on '{}' as a concise analytical \
                     paragraph. Keep every [n] citation marker exactly where its fact is \
                     used.\n\n{}",
                    section.title, section.narrative
                );
                match self
                    .models
                    .complete(TaskKind::ReportProse, &prompt, &schema)
                    .await
                {
                    Ok(value) => {
                        if let Some(narrative) = value["narrative"].as_str() {
                            if !narrative.trim().is_empty() {
                                section.narrative = narrative.trim().to_string();
                            }
                        }
                    }
                    Err(err) => {
                        warn!(section = %section.title, error = %err, "report prose degraded");
                    }
                }
            }
        }

        report
    }
}

/// Significant words from a pillar's questions, used as search probes when
/// the thesis author supplied no key terms.
fn heuristic_key_terms(pillar: &Pillar) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "what", "how", "why", "when", "where", "which", "does", "the", "are", "is", "and", "for",
        "with", "their", "that", "this", "from", "have", "has", "its",
    ];

    let mut terms = Vec::new();
    for question in &pillar.questions {
        for word in question.split_whitespace() {
            let word: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if word.len() > 3
                && !STOPWORDS.contains(&word.as_str())
                && !terms.contains(&word)
            {
                terms.push(word);
            }
            if terms.len() >= 4 {
                return terms;
            }
        }
    }
    terms
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heuristic_key_terms_skip_stopwords() {
        let pillar = Pillar::new(
            "Growth",
            1.0,
            vec!["How fast is annual recurring revenue growing?".into()],
        );
        let terms = heuristic_key_terms(&pillar);
        assert!(terms.contains(&"annual".to_string()));
        assert!(terms.contains(&"revenue".to_string()));
        assert!(!terms.iter().any(|t| t == "how" || t == "is"));
        assert!(terms.len() <= 4);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "ARR wächst überproportional schnell";
        let out = truncate(text, 12);
        assert!(out.len() <= 12);
        assert!(text.starts_with(&out));
    }

    #[test]
    fn test_pool_config_mapping() {
        let queue = QueueConfig {
            concurrency: 3,
            attempt_timeout_secs: 7,
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 900,
        };
        let pool = pool_config(&queue);
        assert_eq!(pool.concurrency, 3);
        assert_eq!(pool.attempt_timeout, Duration::from_secs(7));
        assert_eq!(pool.retry.max_attempts, 5);
    }
}
