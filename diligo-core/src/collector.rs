//! Evidence collection — fan-out of a query batch through the search queue.
//!
//! Every query becomes one job on the search pool: the provider is asked,
//! snippet-sized results are followed to their page for the full text,
//! and results are normalized into `Evidence` records attributed to the
//! query's pillar. Dead-lettered queries are returned with their pillar so
//! the orchestrator can record the gap without failing the run. In-flight
//! provider calls are additionally capped at the provider's own declared
//! concurrency limit, which may be tighter than the pool's.

use crate::error::ProviderError;
use crate::evidence::{Evidence, RawDocument};
use crate::queue::{JobResult, JobSpec, Priority, WorkerPool};
use crate::querygen::SearchQuery;
use crate::providers::SearchProvider;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// A failed query with pillar attribution.
#[derive(Debug, Clone)]
pub struct CollectionFailure {
    pub pillar_id: Uuid,
    pub query: String,
    pub error: String,
}

/// The settled result of one collection pass.
#[derive(Debug, Default)]
pub struct CollectionBatch {
    /// Normalized evidence, in job completion order.
    pub evidence: Vec<Evidence>,
    /// Queries whose retries were exhausted.
    pub dead_letters: Vec<CollectionFailure>,
    /// Whether cancellation was observed mid-batch.
    pub cancelled: bool,
}

/// Fans query batches out through the search worker pool.
pub struct EvidenceCollector {
    provider: Arc<dyn SearchProvider>,
    /// Cap on documents kept per query.
    max_docs_per_query: usize,
    /// Results shorter than this are followed to their page for full text.
    fetch_full_below: usize,
    /// Caps in-flight provider calls at `provider.concurrency_limit()`,
    /// independent of the search pool's own size.
    limiter: Arc<Semaphore>,
}

impl EvidenceCollector {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        max_docs_per_query: usize,
        fetch_full_below: usize,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(provider.concurrency_limit().max(1)));
        Self {
            provider,
            max_docs_per_query: max_docs_per_query.max(1),
            fetch_full_below,
            limiter,
        }
    }

    /// Run a query batch to settlement on the search pool.
    ///
    /// Results from jobs that completed before a cancellation are kept;
    /// per-query failures never abort the batch.
    pub async fn collect(
        &self,
        queries: Vec<SearchQuery>,
        pool: &WorkerPool,
        priority: Priority,
        company_site: Option<&str>,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> CollectionBatch {
        let total = queries.len();
        debug!(queries = total, iteration, "starting collection pass");

        let specs: Vec<JobSpec<Vec<Evidence>>> = queries
            .into_iter()
            .map(|query| self.spec_for(query, priority, company_site, iteration))
            .collect();

        let outcomes = pool.run_batch(specs, cancel).await;

        let mut batch = CollectionBatch::default();
        for outcome in outcomes {
            match outcome.result {
                JobResult::Completed(evidence) => batch.evidence.extend(evidence),
                JobResult::DeadLettered { error } => {
                    if let Some(pillar_id) = outcome.job.pillar_id {
                        batch.dead_letters.push(CollectionFailure {
                            pillar_id,
                            query: outcome.job.name,
                            error,
                        });
                    }
                }
                JobResult::Cancelled => batch.cancelled = true,
            }
        }

        info!(
            queries = total,
            collected = batch.evidence.len(),
            dead_letters = batch.dead_letters.len(),
            cancelled = batch.cancelled,
            "collection pass settled"
        );
        batch
    }

    fn spec_for(
        &self,
        query: SearchQuery,
        priority: Priority,
        company_site: Option<&str>,
        iteration: u32,
    ) -> JobSpec<Vec<Evidence>> {
        let provider = self.provider.clone();
        let max_docs = self.max_docs_per_query;
        let fetch_below = self.fetch_full_below;
        let limiter = self.limiter.clone();
        let company_site = company_site.map(str::to_string);
        let pillar_id = query.pillar_id;
        let text = query.text.clone();

        JobSpec {
            name: text.clone(),
            priority,
            pillar_id: Some(pillar_id),
            op: Box::new(move |_attempt| {
                let provider = provider.clone();
                let limiter = limiter.clone();
                let text = text.clone();
                let company_site = company_site.clone();
                Box::pin(async move {
                    // The permit covers the search and any follow-up
                    // fetches, so the provider never sees more than its
                    // declared concurrency limit.
                    let _permit = limiter.acquire_owned().await.map_err(|_| {
                        ProviderError::RequestFailed {
                            provider: provider.name().to_string(),
                            message: "provider limiter closed".into(),
                        }
                    })?;

                    let docs = provider.search(&text).await?;
                    if docs.is_empty() {
                        // An empty result set is a miss, not an error; retrying
                        // the same query would return the same nothing.
                        return Err(ProviderError::NotFound { url: text });
                    }
                    let mut kept: Vec<RawDocument> =
                        docs.into_iter().take(max_docs).collect();
                    for doc in &mut kept {
                        if doc.content.len() >= fetch_below || doc.url.is_empty() {
                            continue;
                        }
                        // Snippet-sized results are followed to their page
                        // for the full text. A failed fetch keeps the
                        // snippet; retrying the whole query for it would
                        // redo the search.
                        match provider.fetch(&doc.url).await {
                            Ok(full) if !full.content.trim().is_empty() => {
                                doc.content = full.content;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                debug!(url = %doc.url, error = %err, "full-text fetch failed, keeping snippet");
                            }
                        }
                    }

                    let provider_name = provider.name().to_string();
                    Ok(kept
                        .into_iter()
                        .map(|raw| {
                            Evidence::from_raw(
                                raw,
                                pillar_id,
                                &provider_name,
                                company_site.as_deref(),
                                iteration,
                            )
                        })
                        .collect())
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockSearchProvider;
    use crate::queue::{JobKind, PoolConfig, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn search_pool() -> WorkerPool {
        WorkerPool::new(
            JobKind::Search,
            PoolConfig {
                concurrency: 4,
                attempt_timeout: Duration::from_millis(500),
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_delay_ms: 1,
                    max_delay_ms: 5,
                },
            },
        )
    }

    fn doc(title: &str, url: &str) -> RawDocument {
        RawDocument {
            title: title.into(),
            url: url.into(),
            content: format!("{title}. Detailed findings about Acme growth."),
            published_at: None,
        }
    }

    fn query(pillar_id: Uuid, text: &str) -> SearchQuery {
        SearchQuery {
            pillar_id,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_collect_normalizes_and_attributes_pillar() {
        let provider = Arc::new(MockSearchProvider::new(
            "mock",
            vec![doc("Acme Q3", "https://reuters.com/news/acme")],
        ));
        let collector = EvidenceCollector::new(provider, 5, 0);
        let pool = search_pool();
        let pillar_id = Uuid::new_v4();

        let batch = collector
            .collect(
                vec![query(pillar_id, "Acme ARR growth")],
                &pool,
                Priority::Normal,
                None,
                1,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(batch.evidence.len(), 1);
        assert_eq!(batch.evidence[0].pillar_id, pillar_id);
        assert_eq!(batch.evidence[0].iteration, 1);
        assert_eq!(batch.evidence[0].source.provider, "mock");
        assert!(batch.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_collect_caps_documents_per_query() {
        let docs = (0..10)
            .map(|i| doc(&format!("Doc {i}"), &format!("https://example.org/{i}")))
            .collect();
        let provider = Arc::new(MockSearchProvider::new("mock", docs));
        let collector = EvidenceCollector::new(provider, 3, 0);
        let pool = search_pool();

        let batch = collector
            .collect(
                vec![query(Uuid::new_v4(), "Acme")],
                &pool,
                Priority::Normal,
                None,
                0,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(batch.evidence.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_results_are_not_retried() {
        let provider = Arc::new(MockSearchProvider::new("mock", vec![]));
        let collector = EvidenceCollector::new(provider, 5, 0);
        let pool = search_pool();
        let pillar_id = Uuid::new_v4();

        let batch = collector
            .collect(
                vec![query(pillar_id, "Acme obscure detail")],
                &pool,
                Priority::Normal,
                None,
                0,
                &CancellationToken::new(),
            )
            .await;

        assert!(batch.evidence.is_empty());
        assert_eq!(batch.dead_letters.len(), 1);
        assert_eq!(batch.dead_letters[0].pillar_id, pillar_id);
    }

    #[tokio::test]
    async fn test_exhausted_provider_dead_letters_with_pillar() {
        let provider = Arc::new(
            MockSearchProvider::new("mock", vec![doc("x", "https://example.org")]).with_failures(
                vec![
                    ProviderError::RateLimited {
                        provider: "mock".into(),
                        retry_after_secs: 0,
                    },
                    ProviderError::RateLimited {
                        provider: "mock".into(),
                        retry_after_secs: 0,
                    },
                ],
            ),
        );
        let collector = EvidenceCollector::new(provider, 5, 0);
        let pool = search_pool();
        let pillar_id = Uuid::new_v4();

        let batch = collector
            .collect(
                vec![query(pillar_id, "Acme pricing")],
                &pool,
                Priority::Normal,
                None,
                0,
                &CancellationToken::new(),
            )
            .await;

        // Two queued failures against max_attempts 2.
        assert!(batch.evidence.is_empty());
        assert_eq!(batch.dead_letters.len(), 1);
        assert!(batch.dead_letters[0].error.contains("Rate limited"));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_results() {
        // One queued transient failure: whichever query draws it retries
        // and still succeeds.
        let provider = Arc::new(
            MockSearchProvider::new("mock", vec![doc("Acme Q3", "https://example.org/a")])
                .with_failures(vec![ProviderError::Timeout {
                    provider: "mock".into(),
                    timeout_secs: 1,
                }]),
        );
        let collector = EvidenceCollector::new(provider, 5, 0);
        let pool = search_pool();

        let batch = collector
            .collect(
                vec![
                    query(Uuid::new_v4(), "Acme growth"),
                    query(Uuid::new_v4(), "Acme churn"),
                ],
                &pool,
                Priority::Normal,
                None,
                0,
                &CancellationToken::new(),
            )
            .await;

        // Both queries settle; the transient failure is retried away.
        assert_eq!(batch.evidence.len(), 2);
        assert!(batch.dead_letters.is_empty());
    }

    /// Declares a low tolerance and records its observed peak in-flight.
    #[derive(Default)]
    struct ThrottledProvider {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for ThrottledProvider {
        fn name(&self) -> &str {
            "throttled"
        }

        async fn search(&self, _query: &str) -> Result<Vec<RawDocument>, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![doc("Acme note", "https://example.org/note")])
        }

        async fn fetch(&self, url: &str) -> Result<RawDocument, ProviderError> {
            Err(ProviderError::NotFound { url: url.into() })
        }

        fn concurrency_limit(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn test_provider_concurrency_limit_bounds_in_flight_calls() {
        let provider = Arc::new(ThrottledProvider::default());
        let collector = EvidenceCollector::new(provider.clone(), 5, 0);
        // Pool permits 4 jobs at once; the provider tolerates 2.
        let pool = search_pool();

        let queries = (0..6)
            .map(|i| query(Uuid::new_v4(), &format!("Acme topic {i}")))
            .collect();
        let batch = collector
            .collect(
                queries,
                &pool,
                Priority::Normal,
                None,
                0,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(batch.evidence.len(), 6);
        assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    }

    /// Returns snippet-length results; fetch serves the full page or fails.
    struct SnippetProvider {
        fetch_works: bool,
    }

    #[async_trait]
    impl SearchProvider for SnippetProvider {
        fn name(&self) -> &str {
            "snippet"
        }

        async fn search(&self, _query: &str) -> Result<Vec<RawDocument>, ProviderError> {
            Ok(vec![doc("Acme note", "https://example.org/full")])
        }

        async fn fetch(&self, url: &str) -> Result<RawDocument, ProviderError> {
            if self.fetch_works {
                Ok(RawDocument {
                    title: "Acme note".into(),
                    url: url.into(),
                    content: "Full page: Acme ARR grew 42% with durable expansion across customer cohorts."
                        .into(),
                    published_at: None,
                })
            } else {
                Err(ProviderError::NotFound { url: url.into() })
            }
        }
    }

    #[tokio::test]
    async fn test_short_results_fetched_for_full_text() {
        let provider = Arc::new(SnippetProvider { fetch_works: true });
        let collector = EvidenceCollector::new(provider, 5, 100);
        let pool = search_pool();

        let batch = collector
            .collect(
                vec![query(Uuid::new_v4(), "Acme ARR growth")],
                &pool,
                Priority::Normal,
                None,
                0,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(batch.evidence.len(), 1);
        assert!(batch.evidence[0].content.starts_with("Full page:"));
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_snippet() {
        let provider = Arc::new(SnippetProvider { fetch_works: false });
        let collector = EvidenceCollector::new(provider, 5, 100);
        let pool = search_pool();

        let batch = collector
            .collect(
                vec![query(Uuid::new_v4(), "Acme ARR growth")],
                &pool,
                Priority::Normal,
                None,
                0,
                &CancellationToken::new(),
            )
            .await;

        // The page fetch failing never fails the query.
        assert_eq!(batch.evidence.len(), 1);
        assert!(batch.evidence[0].content.contains("Detailed findings"));
        assert!(batch.dead_letters.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_batch_flagged() {
        let provider = Arc::new(MockSearchProvider::new(
            "mock",
            vec![doc("x", "https://example.org")],
        ));
        let collector = EvidenceCollector::new(provider, 5, 0);
        let pool = search_pool();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = collector
            .collect(
                vec![query(Uuid::new_v4(), "Acme")],
                &pool,
                Priority::Normal,
                None,
                0,
                &cancel,
            )
            .await;

        assert!(batch.cancelled);
        assert!(batch.evidence.is_empty());
    }
}
