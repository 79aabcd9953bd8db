//! Worker pools — bounded-concurrency execution with retry and
//! dead-lettering.
//!
//! Each typed queue owns a pool: a semaphore caps concurrent jobs, every
//! attempt runs under a timeout, transient failures back off exponentially,
//! and a job that exhausts its attempt budget is returned dead-lettered so
//! the orchestrator can record it on the run. Cancellation is cooperative:
//! a job checks the token before starting; attempts already running finish.

use super::job::{Job, JobKind, Priority, RetryPolicy, Retryable};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Specification of one job in a batch. The operation is invoked once per
/// attempt with the 1-based attempt number.
pub struct JobSpec<T> {
    pub name: String,
    pub priority: Priority,
    pub pillar_id: Option<Uuid>,
    pub op: Box<dyn Fn(u32) -> BoxFuture<'static, Result<T, crate::error::ProviderError>> + Send + Sync>,
}

/// Terminal result of a job after all retries.
#[derive(Debug)]
pub enum JobResult<T> {
    Completed(T),
    DeadLettered { error: String },
    Cancelled,
}

/// A finished job with its record.
#[derive(Debug)]
pub struct JobOutcome<T> {
    pub job: Job,
    pub result: JobResult<T>,
}

/// Configuration for one typed queue's pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Max jobs in flight at once.
    pub concurrency: usize,
    /// Per-attempt timeout.
    pub attempt_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            attempt_timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
        }
    }
}

/// A bounded worker pool for one job kind.
pub struct WorkerPool {
    kind: JobKind,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(kind: JobKind, config: PoolConfig) -> Self {
        Self {
            kind,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Run a batch of jobs to settlement: every job either completes, is
    /// dead-lettered, or observes cancellation. Higher-priority jobs are
    /// started first; the semaphore bounds how many run at once.
    pub async fn run_batch<T: Send + 'static>(
        &self,
        mut specs: Vec<JobSpec<T>>,
        cancel: &CancellationToken,
    ) -> Vec<JobOutcome<T>> {
        specs.sort_by(|a, b| b.priority.cmp(&a.priority));

        let futures = specs.into_iter().map(|spec| self.run_one(spec, cancel));
        // buffer_unordered alongside the semaphore: the former bounds this
        // batch, the latter bounds the queue across concurrent runs.
        futures::stream::iter(futures)
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await
    }

    async fn run_one<T: Send + 'static>(
        &self,
        spec: JobSpec<T>,
        cancel: &CancellationToken,
    ) -> JobOutcome<T> {
        let mut job = Job::new(self.kind, spec.name, spec.priority, self.config.retry.max_attempts);
        job.pillar_id = spec.pillar_id;

        if cancel.is_cancelled() {
            job.cancel();
            return JobOutcome {
                job,
                result: JobResult::Cancelled,
            };
        }

        // A closed semaphore never happens here; treat it as cancellation.
        let Ok(_permit) = self.semaphore.acquire().await else {
            job.cancel();
            return JobOutcome {
                job,
                result: JobResult::Cancelled,
            };
        };

        job.status = super::job::JobStatus::Running;
        let mut last_error = String::new();

        while job.attempts < job.max_attempts {
            if cancel.is_cancelled() && job.attempts > 0 {
                // Don't start another retry once cancellation is observed.
                job.cancel();
                return JobOutcome {
                    job,
                    result: JobResult::Cancelled,
                };
            }

            job.attempts += 1;
            let attempt = job.attempts;
            debug!(queue = %self.kind, job = %job.name, attempt, "job attempt");

            let outcome = tokio::time::timeout(self.config.attempt_timeout, (spec.op)(attempt)).await;
            match outcome {
                Ok(Ok(value)) => {
                    job.complete();
                    return JobOutcome {
                        job,
                        result: JobResult::Completed(value),
                    };
                }
                Ok(Err(err)) => {
                    last_error = err.to_string();
                    if !err.is_retryable() {
                        warn!(queue = %self.kind, job = %job.name, error = %last_error, "non-retryable failure");
                        break;
                    }
                }
                Err(_elapsed) => {
                    last_error = format!(
                        "attempt timed out after {}s",
                        self.config.attempt_timeout.as_secs()
                    );
                }
            }

            if job.attempts < job.max_attempts {
                tokio::time::sleep(self.config.retry.delay_for(job.attempts)).await;
            }
        }

        warn!(
            queue = %self.kind,
            job = %job.name,
            attempts = job.attempts,
            error = %last_error,
            "job dead-lettered"
        );
        job.dead_letter(last_error.clone());
        JobOutcome {
            job,
            result: JobResult::DeadLettered { error: last_error },
        }
    }
}

/// The four typed queues of the engine.
pub struct JobQueues {
    pub search: WorkerPool,
    pub analysis: WorkerPool,
    pub quality: WorkerPool,
    pub orchestration: WorkerPool,
}

impl JobQueues {
    pub fn new(search: PoolConfig, analysis: PoolConfig, quality: PoolConfig, orchestration: PoolConfig) -> Self {
        Self {
            search: WorkerPool::new(JobKind::Search, search),
            analysis: WorkerPool::new(JobKind::Analysis, analysis),
            quality: WorkerPool::new(JobKind::Quality, quality),
            orchestration: WorkerPool::new(JobKind::Orchestration, orchestration),
        }
    }
}

impl Default for JobQueues {
    fn default() -> Self {
        Self::new(
            PoolConfig::default(),
            PoolConfig::default(),
            PoolConfig {
                concurrency: 4,
                ..PoolConfig::default()
            },
            PoolConfig {
                concurrency: 2,
                ..PoolConfig::default()
            },
        )
    }
}
