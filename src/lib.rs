//! loadshift: adaptive worker scaling and resilient job execution for
//! Redis-backed queues.
//!
//! The crate is a control-plane library: embedders register job handlers
//! in a [`registry::JobTypeRegistry`], hand queue backends to a
//! [`worker::WorkerPool`], and let the [`scaler::AutoScaler`] reconcile
//! worker counts with observed load. Job execution is cached
//! ([`cache::ResultCache`]) and circuit-protected
//! ([`breaker::CircuitBreaker`]) per queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use loadshift::{
//!     cache::RedisCache,
//!     config::Settings,
//!     metrics::MetricsSink,
//!     queue::RedisJobQueue,
//!     registry::{JobTypeRegistry, JobTypeSpec},
//!     scaler::AutoScaler,
//!     system::ProcSystemMetrics,
//!     worker::WorkerPool,
//! };
//!
//! let settings = Settings::from_env()?;
//! let metrics = Arc::new(MetricsSink::new()?);
//! let cache = Arc::new(RedisCache::connect(&settings.redis_url).await?);
//!
//! let mut registry = JobTypeRegistry::new();
//! registry.register(
//!     JobTypeSpec::new("deep_research", Arc::new(ResearchHandler))
//!         .with_cache_key(|payload| {
//!             payload.get("topic").and_then(|t| t.as_str())
//!                 .map(|t| format!("research:{t}"))
//!         })
//!         .with_ttl(std::time::Duration::from_secs(24 * 3600)),
//! )?;
//!
//! let pool = Arc::new(WorkerPool::new(settings.clone(), registry, cache, Arc::clone(&metrics))?);
//! pool.register_queue(Arc::new(RedisJobQueue::connect(&settings.redis_url, "research").await?)).await?;
//!
//! let scaler = Arc::new(AutoScaler::new(
//!     settings.scaling.clone(),
//!     Arc::clone(&pool),
//!     Arc::new(ProcSystemMetrics::new()),
//!     metrics,
//! ));
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let scaler_task = scaler.spawn(shutdown_rx);
//! ```

pub mod breaker;
pub mod cache;
pub mod config;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod scaler;
pub mod system;
pub mod worker;

// Re-export the types most embedders touch.
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use cache::ResultCache;
pub use config::{ScalingConfig, Settings};
pub use job::{Job, JobContext, JobStatus};
pub use metrics::MetricsSink;
pub use queue::{JobCounts, QueueBackend};
pub use registry::{HandlerError, JobHandler, JobTypeRegistry, JobTypeSpec};
pub use scaler::{AutoScaler, QueueSnapshot, ScalingDecision};
pub use system::{ProcSystemMetrics, SystemMetricsSource, SystemSnapshot};
pub use worker::{JobProcessor, PoolError, ProcessError, WorkerPool, WorkerStats};
