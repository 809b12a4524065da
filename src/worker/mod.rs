//! Worker pool executing jobs across named queues.
//!
//! Each registered queue runs a set of workers; every worker processes up
//! to `concurrency` jobs simultaneously. Workers are added and removed
//! individually (the auto-scaler's levers), each carrying its own
//! shutdown channel: a removed worker stops dequeuing immediately and
//! exits once its in-flight jobs finish, so scale-down never cancels
//! running work.

mod processor;

pub use processor::{JobProcessor, ProcessError};

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::cache::ResultCache;
use crate::config::Settings;
use crate::job::Job;
use crate::metrics::MetricsSink;
use crate::queue::{QueueBackend, QueueError};
use crate::registry::{JobTypeRegistry, RegistryError};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The queue was already registered.
    #[error("queue '{0}' already registered")]
    QueueExists(String),

    /// The queue was never registered.
    #[error("queue '{0}' not registered")]
    UnknownQueue(String),

    /// The queue is already at its maximum worker count.
    #[error("queue '{queue}' already at max workers ({max})")]
    AtCapacity {
        /// The queue that refused the worker.
        queue: String,
        /// The configured ceiling.
        max: usize,
    },

    /// The queue is already at its minimum worker count.
    #[error("queue '{queue}' already at min workers ({min})")]
    AtFloor {
        /// The queue that refused the removal.
        queue: String,
        /// The configured floor.
        min: usize,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The job-type registry was inconsistent with the configuration.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A queue backend operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Point-in-time view of one queue's workers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerStats {
    /// Workers currently running.
    pub workers: usize,
    /// Jobs currently being processed.
    pub active_jobs: usize,
    /// Total concurrency capacity (`workers × concurrency`).
    pub capacity: usize,
    /// `active_jobs / capacity`, `0.0` for an empty queue.
    pub utilization: f64,
}

struct WorkerHandle {
    id: String,
    shutdown: watch::Sender<bool>,
    active: Arc<AtomicUsize>,
    // Dropped (detached) on removal; the worker drains on its own.
    join: JoinHandle<()>,
}

struct QueueWorkers {
    backend: Arc<dyn QueueBackend>,
    processor: Arc<JobProcessor>,
    handles: Vec<WorkerHandle>,
    spawned: u64,
}

/// Pool of workers across all registered queues.
///
/// Constructed once at bootstrap with the registry, cache, and metrics
/// sink; the auto-scaler drives it through [`add_worker`] and
/// [`remove_worker`].
///
/// [`add_worker`]: WorkerPool::add_worker
/// [`remove_worker`]: WorkerPool::remove_worker
#[derive(Debug)]
pub struct WorkerPool {
    settings: Settings,
    registry: Arc<JobTypeRegistry>,
    cache: Arc<dyn ResultCache>,
    metrics: Arc<MetricsSink>,
    queues: Mutex<HashMap<String, QueueWorkers>>,
}

impl std::fmt::Debug for QueueWorkers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorkers")
            .field("workers", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a pool, applying the configured cache-TTL policy to the
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Registry`] when a configured TTL override
    /// names a job type that was never registered.
    pub fn new(
        settings: Settings,
        mut registry: JobTypeRegistry,
        cache: Arc<dyn ResultCache>,
        metrics: Arc<MetricsSink>,
    ) -> Result<Self, PoolError> {
        registry = registry.with_default_ttl(settings.cache.default_ttl);
        for (job_type, ttl) in &settings.cache.ttl_overrides {
            registry.override_ttl(job_type, *ttl)?;
        }

        Ok(Self {
            settings,
            registry: Arc::new(registry),
            cache,
            metrics,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a queue and starts its minimum worker set.
    ///
    /// Jobs left in the backend's active set by a previous crash are
    /// recovered first and counted as stalled.
    pub async fn register_queue(&self, backend: Arc<dyn QueueBackend>) -> Result<(), PoolError> {
        let name = backend.name().to_string();

        match backend.recover_stalled().await {
            Ok(0) => {}
            Ok(stalled) => {
                info!(queue = %name, stalled, "recovered stalled jobs");
                for _ in 0..stalled {
                    self.metrics.record_error("stalled", &name);
                }
            }
            Err(e) => warn!(queue = %name, error = %e, "stalled-job recovery failed"),
        }

        let breaker = Arc::new(CircuitBreaker::new(&name, self.settings.breaker.clone()));
        let processor = Arc::new(JobProcessor::new(
            &name,
            Arc::clone(&self.registry),
            Arc::clone(&self.cache),
            breaker,
            Arc::clone(&self.metrics),
            self.settings.backoff.clone(),
        ));

        {
            let mut queues = self.lock();
            if queues.contains_key(&name) {
                return Err(PoolError::QueueExists(name));
            }
            let mut entry = QueueWorkers {
                backend,
                processor,
                handles: Vec::new(),
                spawned: 0,
            };
            for _ in 0..self.settings.scaling.min_workers {
                let handle = self.spawn_worker(&name, &mut entry);
                entry.handles.push(handle);
            }
            queues.insert(name.clone(), entry);
        }

        let workers = self.settings.scaling.min_workers;
        self.metrics.set_worker_count(&name, workers);
        info!(queue = %name, workers, "queue registered");
        Ok(())
    }

    /// Adds one worker to the queue, up to the configured maximum.
    ///
    /// Returns the new worker count.
    pub fn add_worker(&self, queue: &str) -> Result<usize, PoolError> {
        let max = self.settings.scaling.max_workers;
        let mut queues = self.lock();
        let entry = queues
            .get_mut(queue)
            .ok_or_else(|| PoolError::UnknownQueue(queue.to_string()))?;

        if entry.handles.len() >= max {
            return Err(PoolError::AtCapacity {
                queue: queue.to_string(),
                max,
            });
        }

        let handle = self.spawn_worker(queue, entry);
        entry.handles.push(handle);
        let workers = entry.handles.len();
        drop(queues);

        self.metrics.set_worker_count(queue, workers);
        info!(queue = %queue, workers, "worker added");
        Ok(workers)
    }

    /// Removes the most idle worker from the queue, down to the
    /// configured minimum.
    ///
    /// The worker stops dequeuing at once and exits when its in-flight
    /// jobs complete. Returns the new worker count.
    pub fn remove_worker(&self, queue: &str) -> Result<usize, PoolError> {
        let min = self.settings.scaling.min_workers;
        let mut queues = self.lock();
        let entry = queues
            .get_mut(queue)
            .ok_or_else(|| PoolError::UnknownQueue(queue.to_string()))?;

        if entry.handles.len() <= min {
            return Err(PoolError::AtFloor {
                queue: queue.to_string(),
                min,
            });
        }

        let most_idle = entry
            .handles
            .iter()
            .enumerate()
            .min_by_key(|(_, h)| h.active.load(Ordering::SeqCst))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let handle = entry.handles.remove(most_idle);
        let workers = entry.handles.len();
        drop(queues);

        let _ = handle.shutdown.send(true);
        self.metrics.set_worker_count(queue, workers);
        info!(queue = %queue, worker_id = %handle.id, workers, "worker draining");
        Ok(workers)
    }

    /// Returns the current worker count for a queue.
    pub fn worker_count(&self, queue: &str) -> Result<usize, PoolError> {
        let queues = self.lock();
        queues
            .get(queue)
            .map(|entry| entry.handles.len())
            .ok_or_else(|| PoolError::UnknownQueue(queue.to_string()))
    }

    /// Returns worker statistics for a queue.
    ///
    /// Utilization is active jobs over total concurrency capacity; the
    /// scaler's sampler and scale-down predicate both consume this value.
    pub fn worker_stats(&self, queue: &str) -> Result<WorkerStats, PoolError> {
        let queues = self.lock();
        let entry = queues
            .get(queue)
            .ok_or_else(|| PoolError::UnknownQueue(queue.to_string()))?;

        let workers = entry.handles.len();
        let active_jobs: usize = entry
            .handles
            .iter()
            .map(|h| h.active.load(Ordering::SeqCst))
            .sum();
        let capacity = workers * self.settings.concurrency;
        let utilization = if capacity == 0 {
            0.0
        } else {
            active_jobs as f64 / capacity as f64
        };

        Ok(WorkerStats {
            workers,
            active_jobs,
            capacity,
            utilization,
        })
    }

    /// Returns the names of all registered queues.
    pub fn queue_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Returns the backend registered for a queue.
    pub fn backend(&self, queue: &str) -> Option<Arc<dyn QueueBackend>> {
        self.lock().get(queue).map(|entry| Arc::clone(&entry.backend))
    }

    /// Returns the pool's settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Signals every worker to stop and waits for them to drain.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShutdownTimeout`] if workers are still
    /// running after the configured timeout; their tasks keep draining
    /// in the background.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        let handles: Vec<WorkerHandle> = {
            let mut queues = self.lock();
            queues
                .drain()
                .flat_map(|(_, entry)| entry.handles)
                .collect()
        };

        info!(workers = handles.len(), "worker pool shutting down");
        let mut joins = Vec::with_capacity(handles.len());
        for handle in handles {
            let _ = handle.shutdown.send(true);
            joins.push(handle.join);
        }

        let drained = async {
            for result in join_all(joins).await {
                if let Err(e) = result {
                    error!(error = %e, "worker task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(self.settings.shutdown_timeout, drained).await {
            Ok(()) => {
                info!("worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.settings.shutdown_timeout)),
        }
    }

    fn spawn_worker(&self, queue: &str, entry: &mut QueueWorkers) -> WorkerHandle {
        let id = format!("{}-{}", queue, entry.spawned);
        entry.spawned += 1;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            id: id.clone(),
            queue: Arc::clone(&entry.backend),
            processor: Arc::clone(&entry.processor),
            shutdown: shutdown_rx,
            poll_interval: self.settings.poll_interval,
            concurrency: self.settings.concurrency,
            active: Arc::clone(&active),
        };
        let join = tokio::spawn(worker.run());

        WorkerHandle {
            id,
            shutdown: shutdown_tx,
            active,
            join,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueWorkers>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A single worker: dequeues jobs and runs them on concurrency slots.
struct Worker {
    id: String,
    queue: Arc<dyn QueueBackend>,
    processor: Arc<JobProcessor>,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
    concurrency: usize,
    active: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "worker started");
        let slots = Arc::new(Semaphore::new(self.concurrency));

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Hold a slot before dequeuing so a full worker never takes a
            // job it cannot start.
            let permit = tokio::select! {
                _ = self.shutdown.changed() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = tokio::select! {
                _ = self.shutdown.changed() => {
                    drop(permit);
                    break;
                }
                dequeued = self.queue.dequeue(self.poll_interval) => match dequeued {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        drop(permit);
                        continue;
                    }
                    Err(e) => {
                        error!(worker_id = %self.id, error = %e, "dequeue failed");
                        drop(permit);
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                },
            };

            let queue = Arc::clone(&self.queue);
            let processor = Arc::clone(&self.processor);
            let active = Arc::clone(&self.active);
            let worker_id = self.id.clone();
            active.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _slot = permit;
                Self::handle_job(&worker_id, queue, processor, job).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        // Drain: wait for every slot to come back before reporting stopped.
        let _ = slots.acquire_many(self.concurrency as u32).await;
        info!(worker_id = %self.id, "worker stopped");
    }

    async fn handle_job(
        worker_id: &str,
        queue: Arc<dyn QueueBackend>,
        processor: Arc<JobProcessor>,
        mut job: Job,
    ) {
        job.increment_attempts();
        debug!(
            worker_id = %worker_id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "processing job"
        );

        match processor.process(&job).await {
            Ok(_) => {
                if let Err(e) = queue.complete(job.id).await {
                    error!(worker_id = %worker_id, job_id = %job.id, error = %e, "failed to mark job complete");
                }
            }
            Err(ProcessError::RateLimited {
                retry_after,
                message,
            }) if job.should_retry() => {
                warn!(
                    worker_id = %worker_id,
                    job_id = %job.id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    message = %message,
                    "rate limited, re-queueing with backoff"
                );
                if let Err(e) = queue.retry(job, retry_after).await {
                    error!(worker_id = %worker_id, error = %e, "failed to re-queue rate-limited job");
                }
            }
            Err(e) => {
                warn!(worker_id = %worker_id, job_id = %job.id, error = %e, "job failed");
                let message = e.to_string();
                if let Err(fail_err) = queue.fail(job, &message).await {
                    error!(worker_id = %worker_id, error = %fail_err, "failed to record job failure");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::job::JobContext;
    use crate::queue::MemoryJobQueue;
    use crate::registry::{HandlerError, JobHandler, JobTypeSpec};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Instant;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn run(
            &self,
            payload: &serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(payload.clone())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn run(
            &self,
            _payload: &serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Err(HandlerError::other("always fails"))
        }
    }

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.poll_interval = Duration::from_millis(50);
        settings.shutdown_timeout = Duration::from_secs(5);
        settings.scaling.min_workers = 1;
        settings.scaling.max_workers = 3;
        settings
    }

    fn pool_with(handler: Arc<dyn JobHandler>, job_type: &str) -> WorkerPool {
        let mut registry = JobTypeRegistry::new();
        registry
            .register(JobTypeSpec::new(job_type, handler))
            .expect("register type");

        WorkerPool::new(
            test_settings(),
            registry,
            Arc::new(MemoryCache::new()),
            Arc::new(MetricsSink::new().expect("sink")),
        )
        .expect("pool")
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition().await {
            assert!(Instant::now() < deadline, "condition not met within 5s");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn completed_count(queue: &MemoryJobQueue) -> u64 {
        queue.job_counts().await.map(|c| c.completed).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_register_starts_min_workers() {
        let pool = pool_with(Arc::new(EchoHandler), "echo");
        let queue = MemoryJobQueue::new("research");
        pool.register_queue(Arc::new(queue)).await.expect("register");

        assert_eq!(pool.worker_count("research").expect("count"), 1);
        let stats = pool.worker_stats("research").expect("stats");
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.active_jobs, 0);
        assert!(stats.utilization.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_duplicate_queue_rejected() {
        let pool = pool_with(Arc::new(EchoHandler), "echo");
        pool.register_queue(Arc::new(MemoryJobQueue::new("research")))
            .await
            .expect("first");

        let err = pool
            .register_queue(Arc::new(MemoryJobQueue::new("research")))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::QueueExists(_)));
    }

    #[tokio::test]
    async fn test_jobs_flow_to_completion() {
        let pool = pool_with(Arc::new(EchoHandler), "echo");
        let queue = MemoryJobQueue::new("research");
        pool.register_queue(Arc::new(queue.clone()))
            .await
            .expect("register");

        for i in 0..5 {
            queue
                .enqueue(Job::new("research", "echo", json!({"n": i})))
                .await
                .expect("enqueue");
        }

        wait_until(|| async { completed_count(&queue).await == 5 }).await;

        pool.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_failing_jobs_reach_dead_letter() {
        let pool = pool_with(Arc::new(FailingHandler), "flaky");
        let queue = MemoryJobQueue::new("writer");
        pool.register_queue(Arc::new(queue.clone()))
            .await
            .expect("register");

        queue
            .enqueue(Job::new("writer", "flaky", json!({})).with_max_attempts(2))
            .await
            .expect("enqueue");

        wait_until(|| async {
            queue.job_counts().await.map(|c| c.failed == 1).unwrap_or(false)
        })
        .await;

        assert_eq!(queue.dead_letter_entries().len(), 1);
        pool.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_add_worker_respects_max() {
        let pool = pool_with(Arc::new(EchoHandler), "echo");
        pool.register_queue(Arc::new(MemoryJobQueue::new("research")))
            .await
            .expect("register");

        assert_eq!(pool.add_worker("research").expect("add"), 2);
        assert_eq!(pool.add_worker("research").expect("add"), 3);
        let err = pool.add_worker("research").unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity { max: 3, .. }));
    }

    #[tokio::test]
    async fn test_remove_worker_respects_min() {
        let pool = pool_with(Arc::new(EchoHandler), "echo");
        pool.register_queue(Arc::new(MemoryJobQueue::new("research")))
            .await
            .expect("register");
        pool.add_worker("research").expect("add");

        assert_eq!(pool.remove_worker("research").expect("remove"), 1);
        let err = pool.remove_worker("research").unwrap_err();
        assert!(matches!(err, PoolError::AtFloor { min: 1, .. }));
    }

    #[tokio::test]
    async fn test_unknown_queue_operations_fail() {
        let pool = pool_with(Arc::new(EchoHandler), "echo");
        assert!(matches!(
            pool.add_worker("ghost").unwrap_err(),
            PoolError::UnknownQueue(_)
        ));
        assert!(matches!(
            pool.worker_stats("ghost").unwrap_err(),
            PoolError::UnknownQueue(_)
        ));
    }

    #[tokio::test]
    async fn test_removed_worker_finishes_current_jobs() {
        struct SlowHandler;

        #[async_trait]
        impl JobHandler for SlowHandler {
            async fn run(
                &self,
                payload: &serde_json::Value,
                _ctx: &JobContext,
            ) -> Result<serde_json::Value, HandlerError> {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(payload.clone())
            }
        }

        let pool = pool_with(Arc::new(SlowHandler), "slow");
        let queue = MemoryJobQueue::new("research");
        pool.register_queue(Arc::new(queue.clone()))
            .await
            .expect("register");
        pool.add_worker("research").expect("add");

        queue
            .enqueue(Job::new("research", "slow", json!({})))
            .await
            .expect("enqueue");
        wait_until(|| async {
            queue.active_count().await.map(|n| n == 1).unwrap_or(false)
        })
        .await;

        // Scale down while the job is running; it must still complete.
        pool.remove_worker("research").expect("remove");
        wait_until(|| async { completed_count(&queue).await == 1 }).await;

        pool.shutdown().await.expect("shutdown");
    }
}
