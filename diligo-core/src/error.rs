//! Error types for the Diligo research engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering external providers, model calls, the job queue, durable state
//! storage, and the orchestrator itself.

use std::path::PathBuf;
use uuid::Uuid;

/// Top-level error type for the Diligo core library.
#[derive(Debug, thiserror::Error)]
pub enum DiligoError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from external search/fetch providers.
///
/// Everything except `NotFound` is transient and eligible for retry by the
/// job queue's backoff policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Rate limited by provider '{provider}', retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("Request to provider '{provider}' timed out after {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    #[error("Resource not found: {url}")]
    NotFound { url: String },

    #[error("Provider '{provider}' request failed: {message}")]
    RequestFailed { provider: String, message: String },
}

impl ProviderError {
    /// Whether the job queue should retry after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::NotFound { .. })
    }
}

/// Errors from language-model provider interactions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("API request to '{provider}' failed: {message}")]
    ApiRequest { provider: String, message: String },

    #[error("Rate limited by model provider '{provider}'")]
    RateLimited { provider: String },

    #[error("Model request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Model output failed schema validation: {reason}")]
    ValidationFailed { reason: String },

    #[error("No provider registered for task '{task}'")]
    NoProvider { task: String },

    #[error("All providers exhausted for task '{task}'")]
    AllProvidersFailed { task: String },
}

impl ModelError {
    /// Whether a retry (possibly against another pooled provider) may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ModelError::ApiRequest { .. }
                | ModelError::RateLimited { .. }
                | ModelError::Timeout { .. }
                | ModelError::ValidationFailed { .. }
        )
    }
}

/// Errors from the background job queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue '{queue}' is closed")]
    Closed { queue: String },

    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Job '{name}' exhausted {attempts} attempts and was dead-lettered: {last_error}")]
    DeadLettered {
        name: String,
        attempts: u32,
        last_error: String,
    },
}

/// Errors from the durable state store. Always fatal for the owning run:
/// without durable state the engine cannot guarantee crash recovery.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Research state {id} not found")]
    NotFound { id: Uuid },

    #[error("Stale write rejected for {id}: incoming version {incoming} <= stored {stored}")]
    StaleWrite {
        id: Uuid,
        incoming: u64,
        stored: u64,
    },

    #[error("Failed to persist state at {path}: {message}")]
    WriteFailed { path: PathBuf, message: String },

    #[error("Failed to load state: {message}")]
    LoadFailed { message: String },
}

/// Errors from the orchestrator state machine.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid thesis: {reason}")]
    InvalidThesis { reason: String },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Run {id} is not in a terminal state")]
    NotFinished { id: Uuid },

    #[error("All pillars blocked by exhausted provider retries")]
    AllPillarsBlocked,
}

/// Errors from the configuration loader.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// A type alias for results using the top-level `DiligoError`.
pub type Result<T> = std::result::Result<T, DiligoError>;
