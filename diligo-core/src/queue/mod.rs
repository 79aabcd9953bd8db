//! Background job queue substrate — typed queues with priority, retry
//! with backoff, and dead-lettering.

pub mod job;
pub mod worker;

pub use job::{Job, JobKind, JobStatus, Priority, RetryPolicy, Retryable};
pub use worker::{JobOutcome, JobQueues, JobResult, JobSpec, PoolConfig, WorkerPool};
