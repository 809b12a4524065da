//! On-demand queue statistics.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::queue::JobCounts;
use crate::worker::WorkerPool;

/// Point-in-time statistics for one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    /// The queue this snapshot describes.
    pub queue: String,
    /// Job counts at sampling time.
    pub counts: JobCounts,
    /// Estimated average wait, from the oldest waiting job's enqueue time.
    pub avg_wait: Duration,
    /// Worker utilization as reported by the pool.
    pub utilization: f64,
    /// When the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
}

impl QueueSnapshot {
    /// Waiting plus active jobs.
    pub fn queue_size(&self) -> usize {
        self.counts.queue_size()
    }
}

/// Produces [`QueueSnapshot`]s for the auto-scaler.
///
/// Strictly read-only: backend failures degrade to a zeroed snapshot
/// with a warning rather than an error, so a momentarily unreachable
/// queue never takes down the control loop.
#[derive(Debug, Clone)]
pub struct QueueStatsSampler {
    pool: Arc<WorkerPool>,
}

impl QueueStatsSampler {
    /// Creates a sampler reading through the given pool.
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    /// Samples the named queue.
    pub async fn sample(&self, queue: &str) -> QueueSnapshot {
        let Some(backend) = self.pool.backend(queue) else {
            warn!(queue = %queue, "sampling unregistered queue");
            return Self::empty(queue);
        };

        let counts = match backend.job_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(queue = %queue, error = %e, "job counts unavailable, sampling zeros");
                JobCounts::default()
            }
        };

        let avg_wait = if counts.waiting == 0 {
            Duration::ZERO
        } else {
            match backend.oldest_waiting().await {
                Ok(Some(enqueued_at)) => (Utc::now() - enqueued_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO),
                Ok(None) => Duration::ZERO,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "oldest-waiting lookup failed");
                    Duration::ZERO
                }
            }
        };

        let utilization = self
            .pool
            .worker_stats(queue)
            .map(|stats| stats.utilization)
            .unwrap_or(0.0);

        QueueSnapshot {
            queue: queue.to_string(),
            counts,
            avg_wait,
            utilization,
            sampled_at: Utc::now(),
        }
    }

    fn empty(queue: &str) -> QueueSnapshot {
        QueueSnapshot {
            queue: queue.to_string(),
            counts: JobCounts::default(),
            avg_wait: Duration::ZERO,
            utilization: 0.0,
            sampled_at: Utc::now(),
        }
    }
}
