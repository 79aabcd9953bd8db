//! Job model for the background queue substrate.
//!
//! A job is enqueued, runs under a per-attempt timeout, retries with
//! exponential backoff up to its attempt budget, and is dead-lettered when
//! the budget is exhausted. Dead letters are recorded as errors on the
//! owning research state, never silently dropped.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// The typed queue a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Search/fetch against an external provider.
    Search,
    /// Document analysis and summarization.
    Analysis,
    /// Evidence quality scoring.
    Quality,
    /// Stage-level orchestration work.
    Orchestration,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Search => write!(f, "search"),
            JobKind::Analysis => write!(f, "analysis"),
            JobKind::Quality => write!(f, "quality"),
            JobKind::Orchestration => write!(f, "orchestration"),
        }
    }
}

/// Priority levels; higher runs first within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Retries exhausted; parked for inspection.
    DeadLettered,
    /// Cancellation observed before the job started.
    Cancelled,
}

/// A background job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub name: String,
    pub priority: Priority,
    /// Pillar this job serves, for dead-letter attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pillar_id: Option<Uuid>,
    /// Attempts made so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        name: impl Into<String>,
        priority: Priority,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            name: name.into(),
            priority,
            pillar_id: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            status: JobStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn complete(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn dead_letter(&mut self, error: impl Into<String>) {
        self.status = JobStatus::DeadLettered;
        self.last_error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Completed | JobStatus::DeadLettered | JobStatus::Cancelled
        )
    }
}

/// Errors the queue will retry. Implemented by the provider error types.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for crate::error::ProviderError {
    fn is_retryable(&self) -> bool {
        crate::error::ProviderError::is_retryable(self)
    }
}

impl Retryable for crate::error::ModelError {
    fn is_retryable(&self) -> bool {
        crate::error::ModelError::is_retryable(self)
    }
}

/// Explicit retry policy applied uniformly by the queue substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Base backoff delay in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based: the delay after the
    /// first failure is `delay_for(1)`). Exponential with +/-25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
            .min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((exp as f64 * jitter) as u64)
    }
}
