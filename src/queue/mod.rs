//! Queue backends feeding the worker pool.
//!
//! The pool and scaler only ever talk to [`QueueBackend`]; the crate ships
//! a Redis implementation with reliable dequeue for production and an
//! in-process implementation for tests and single-node embedders.

mod memory;
mod redis;

pub use self::memory::MemoryJobQueue;
pub use self::redis::RedisJobQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::job::Job;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the queue backend.
    #[error("queue connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("redis operation failed: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Failed to serialize or deserialize a job.
    #[error("job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which set of jobs to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Enqueued, not yet picked up by a worker.
    Waiting,
    /// Currently being processed.
    Active,
    /// Failed terminally and parked for inspection.
    DeadLetter,
}

/// Point-in-time job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    /// Jobs waiting to be dequeued.
    pub waiting: usize,
    /// Jobs currently being processed.
    pub active: usize,
    /// Jobs completed successfully since the queue was created.
    pub completed: u64,
    /// Jobs that failed terminally since the queue was created.
    pub failed: u64,
}

impl JobCounts {
    /// Waiting plus active jobs — the scaler's notion of queue size.
    pub fn queue_size(&self) -> usize {
        self.waiting + self.active
    }
}

/// A named backlog of jobs, dequeued by workers and observed by the scaler.
///
/// Attempt accounting: the worker increments a job's attempt counter
/// before processing; [`fail`](QueueBackend::fail) re-queues the job while
/// attempts remain and dead-letters it otherwise.
#[async_trait]
pub trait QueueBackend: Send + Sync + std::fmt::Debug {
    /// Returns the queue's name.
    fn name(&self) -> &str;

    /// Adds a job to the back of the queue.
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Removes the oldest waiting job and marks it active, waiting up to
    /// `wait` for one to arrive. `Ok(None)` means the wait elapsed.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError>;

    /// Marks an active job as completed.
    async fn complete(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Returns an active job to the front of the queue after `delay`.
    ///
    /// Used for rate-limited jobs carrying a computed backoff. The job
    /// leaves the active set immediately; the re-queue happens after the
    /// delay elapses.
    async fn retry(&self, job: Job, delay: Duration) -> Result<(), QueueError>;

    /// Records a failed execution: re-queues the job while attempts
    /// remain, otherwise dead-letters it and counts a terminal failure.
    async fn fail(&self, job: Job, error: &str) -> Result<(), QueueError>;

    /// Returns current counts for this queue.
    async fn job_counts(&self) -> Result<JobCounts, QueueError>;

    /// Returns the number of waiting jobs.
    async fn waiting_count(&self) -> Result<usize, QueueError>;

    /// Returns the number of active jobs.
    async fn active_count(&self) -> Result<usize, QueueError>;

    /// Lists jobs in the given state, oldest first.
    async fn jobs(
        &self,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Job>, QueueError>;

    /// Returns the enqueue timestamp of the oldest waiting job.
    async fn oldest_waiting(&self) -> Result<Option<DateTime<Utc>>, QueueError>;

    /// Recovers jobs stuck in the active set by a crashed worker,
    /// re-queueing or dead-lettering them by remaining attempts.
    /// Returns how many jobs were found stalled.
    async fn recover_stalled(&self) -> Result<usize, QueueError>;
}
