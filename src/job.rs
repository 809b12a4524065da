//! Job definitions shared across the queue, worker pool, and scaler.
//!
//! - `Job`: a unit of work stored in a queue and executed by workers
//! - `JobContext`: per-execution context handed to job handlers
//! - `JobStatus`: terminal status of an execution, used as a metrics label

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of attempts before a job is dead-lettered.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A job representing a unit of work to be executed.
///
/// Jobs are serialized into the queue backend and processed by workers.
/// The attempt counter is advanced by the queue system on each retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: Uuid,
    /// Name of the logical queue this job belongs to.
    pub queue: String,
    /// Job-type name, resolved against the job-type registry.
    pub job_type: String,
    /// Opaque payload passed to the job handler.
    pub payload: serde_json::Value,
    /// Number of times this job has been attempted.
    pub attempts: u32,
    /// Maximum number of attempts before moving to the dead letter queue.
    pub max_attempts: u32,
    /// When this job was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Explicit cache key, overriding the registry's derivation.
    #[serde(default)]
    pub cache_key: Option<String>,
    /// When set, the result cache is bypassed entirely for this job.
    #[serde(default)]
    pub no_cache: bool,
}

impl Job {
    /// Creates a new job for the given queue and job type.
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            enqueued_at: Utc::now(),
            cache_key: None,
            no_cache: false,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets an explicit cache key for this job.
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Marks this job as non-cacheable regardless of its job type.
    pub fn without_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// Increments the attempt counter.
    ///
    /// Called by the queue system before each execution attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether the job has attempts remaining after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Returns how long this job has been in the system.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// Execution context handed to a job handler alongside the payload.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// ID of the job being executed.
    pub job_id: Uuid,
    /// Name of the queue the job was dequeued from.
    pub queue: String,
    /// Attempt number for this execution (1-based).
    pub attempt: u32,
    /// When this execution started.
    pub started_at: DateTime<Utc>,
}

impl JobContext {
    /// Builds a context for the current attempt of `job`.
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            attempt: job.attempts.max(1),
            started_at: Utc::now(),
        }
    }
}

/// Terminal status of a job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job completed successfully (includes cache hits).
    Completed,
    /// Job failed.
    Failed,
    /// Job exceeded the circuit breaker's call timeout.
    TimedOut,
    /// Job was found stuck in the processing queue and recovered.
    Stalled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::TimedOut => write!(f, "timed_out"),
            JobStatus::Stalled => write!(f, "stalled"),
        }
    }
}
