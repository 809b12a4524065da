//! Per-job execution contract: cache, then circuit breaker, then handler.
//!
//! Every dequeued job flows through [`JobProcessor::process`]:
//!
//! 1. Derive the cache key; a hit returns immediately without touching
//!    the handler or the breaker.
//! 2. Invoke the job type's handler through the queue's circuit breaker.
//! 3. On success, store cacheable results with the type's TTL.
//! 4. On failure, classify: rate limits become retryable errors carrying
//!    an exponential backoff delay; timeouts are tracked as their own
//!    metric; everything else propagates to the queue's retry policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngExt;
use thiserror::Error;
use tracing::debug;

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::cache::ResultCache;
use crate::config::BackoffConfig;
use crate::job::{Job, JobContext, JobStatus};
use crate::metrics::MetricsSink;
use crate::registry::{HandlerError, HandlerErrorKind, JobTypeRegistry};

/// Largest exponent applied to the backoff base; beyond this the cap
/// dominates anyway and the shift would overflow.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Errors surfaced by job processing.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The job names a type that was never registered.
    #[error("job type '{0}' not registered")]
    UnknownJobType(String),

    /// A downstream rate limit; retry after the computed backoff.
    #[error("rate limited: {message}; retry in {retry_after:?}")]
    RateLimited {
        /// The handler's description of the limit.
        message: String,
        /// Backoff delay computed for this attempt.
        retry_after: Duration,
    },

    /// The handler exceeded the breaker's call timeout or reported one.
    #[error("processing timed out after {elapsed:?}")]
    Timeout {
        /// How long the attempt ran.
        elapsed: Duration,
    },

    /// The queue's circuit is open; the handler was not invoked.
    #[error("circuit open; retry in {retry_after:?}")]
    CircuitOpen {
        /// Time remaining until the breaker permits a probe.
        retry_after: Duration,
    },

    /// The handler failed with an unclassified error.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),
}

/// Executes jobs for one queue, combining cache, breaker, and metrics.
#[derive(Debug)]
pub struct JobProcessor {
    queue_name: String,
    registry: Arc<JobTypeRegistry>,
    cache: Arc<dyn ResultCache>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<MetricsSink>,
    backoff: BackoffConfig,
}

impl JobProcessor {
    /// Creates a processor for the named queue.
    pub fn new(
        queue_name: impl Into<String>,
        registry: Arc<JobTypeRegistry>,
        cache: Arc<dyn ResultCache>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<MetricsSink>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            registry,
            cache,
            breaker,
            metrics,
            backoff,
        }
    }

    /// Returns the breaker guarding this queue's handlers.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Processes one job and records its lifecycle metrics.
    pub async fn process(&self, job: &Job) -> Result<serde_json::Value, ProcessError> {
        let started = Instant::now();
        let result = self.run(job, started).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.metrics
            .update_circuit_breaker_state(&self.queue_name, self.breaker.state());

        match &result {
            Ok(_) => self.metrics.record_job(
                &self.queue_name,
                &job.job_type,
                JobStatus::Completed,
                Some(duration_ms),
            ),
            Err(ProcessError::Timeout { .. }) => {
                self.metrics.record_job(
                    &self.queue_name,
                    &job.job_type,
                    JobStatus::TimedOut,
                    Some(duration_ms),
                );
                self.metrics.record_error("timeout", &self.queue_name);
            }
            Err(ProcessError::CircuitOpen { .. }) => {
                // Fast rejection: the handler never ran, so no duration.
                self.metrics
                    .record_job(&self.queue_name, &job.job_type, JobStatus::Failed, None);
                self.metrics.record_error("circuit_open", &self.queue_name);
            }
            Err(ProcessError::RateLimited { .. }) => {
                self.metrics.record_job(
                    &self.queue_name,
                    &job.job_type,
                    JobStatus::Failed,
                    Some(duration_ms),
                );
                self.metrics.record_error("rate_limit", &self.queue_name);
            }
            Err(_) => self.metrics.record_job(
                &self.queue_name,
                &job.job_type,
                JobStatus::Failed,
                Some(duration_ms),
            ),
        }

        result
    }

    async fn run(
        &self,
        job: &Job,
        started: Instant,
    ) -> Result<serde_json::Value, ProcessError> {
        let spec = self
            .registry
            .get(&job.job_type)
            .ok_or_else(|| ProcessError::UnknownJobType(job.job_type.clone()))?;

        let cache_key = self.registry.cache_key_for(job);
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key).await {
                debug!(job_id = %job.id, key = %key, "result served from cache");
                self.metrics.record_cache_event(&self.queue_name, "hit");
                return Ok(hit);
            }
            self.metrics.record_cache_event(&self.queue_name, "miss");
        }

        let ctx = JobContext::for_job(job);
        let handler = spec.handler();
        let payload = job.payload.clone();
        let outcome = self
            .breaker
            .execute(move || async move { handler.run(&payload, &ctx).await })
            .await;

        match outcome {
            Ok(value) => {
                if let Some(key) = cache_key {
                    let ttl = self.registry.effective_ttl(spec);
                    self.cache.set(&key, &value, ttl).await;
                    self.metrics.record_cache_event(&self.queue_name, "store");
                }
                Ok(value)
            }
            Err(BreakerError::Open { retry_after }) => {
                Err(ProcessError::CircuitOpen { retry_after })
            }
            Err(BreakerError::Timeout { elapsed }) => Err(ProcessError::Timeout { elapsed }),
            Err(BreakerError::Inner(e)) => Err(self.classify(e, job.attempts, started)),
        }
    }

    fn classify(&self, error: HandlerError, attempt: u32, started: Instant) -> ProcessError {
        match error.kind {
            HandlerErrorKind::RateLimit => ProcessError::RateLimited {
                message: error.message,
                retry_after: self.backoff_delay(attempt),
            },
            HandlerErrorKind::Timeout => ProcessError::Timeout {
                elapsed: started.elapsed(),
            },
            HandlerErrorKind::Other => ProcessError::Handler(error),
        }
    }

    /// Computes `base * 2^attempt`, capped, with up to 10% random jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
        let exponential = self
            .backoff
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff.max);
        let jitter = rand::rng().random_range(0.0..=0.1);
        exponential.mul_f64(1.0 + jitter)
    }
}
