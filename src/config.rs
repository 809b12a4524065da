//! Configuration for the pool, processor, cache, and auto-scaler.
//!
//! Everything has a working default; `Settings::from_env` applies
//! `LOADSHIFT_*` overrides for deployments that configure through the
//! environment. Validation happens once at load, so a bad threshold is a
//! startup error instead of a silent misbehaving control loop.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::breaker::CircuitBreakerConfig;

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an unparseable value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// The offending variable.
        key: String,
        /// What was wrong with it.
        message: String,
    },

    /// The assembled configuration is inconsistent.
    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Thresholds and limits for the auto-scaler control loop.
#[derive(Debug, Clone)]
pub struct ScalingConfig {
    /// How often the control loop runs.
    pub check_interval: Duration,
    /// Lower bound on workers per queue.
    pub min_workers: usize,
    /// Upper bound on workers per queue.
    pub max_workers: usize,
    /// Workers added per scale-up decision.
    pub scale_up_step: usize,
    /// Workers removed per scale-down decision.
    pub scale_down_step: usize,
    /// Minimum time between scaling actions on one queue.
    pub cooldown: Duration,
    /// Queue size above which scale-up is signalled.
    pub queue_size_up_threshold: usize,
    /// Average wait above which scale-up is signalled.
    pub avg_wait_up_threshold: Duration,
    /// Queue size below which scale-down is signalled.
    pub queue_size_down_threshold: usize,
    /// How long a queue must sit with zero active jobs to signal scale-down.
    pub idle_time: Duration,
    /// Utilization below which scale-down is signalled.
    pub utilization_down_threshold: f64,
    /// CPU usage above which scale-up is refused.
    pub cpu_ceiling: f64,
    /// Memory usage above which scale-up is refused.
    pub memory_limit: f64,
    /// How much snapshot history is retained per queue.
    pub history_retention: Duration,
    /// Samples required before any scaling decision.
    pub min_samples: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            min_workers: 1,
            max_workers: 10,
            scale_up_step: 2,
            scale_down_step: 1,
            cooldown: Duration::from_secs(30),
            queue_size_up_threshold: 50,
            avg_wait_up_threshold: Duration::from_secs(30),
            queue_size_down_threshold: 10,
            idle_time: Duration::from_secs(60),
            utilization_down_threshold: 0.3,
            cpu_ceiling: 0.7,
            memory_limit: 0.8,
            history_retention: Duration::from_secs(600),
            min_samples: 3,
        }
    }
}

/// Exponential backoff applied to rate-limited jobs.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay for the first retry.
    pub base: Duration,
    /// Cap on the computed delay before jitter.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

/// Result-cache TTL policy.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// TTL for cacheable job types that did not specify one.
    pub default_ttl: Duration,
    /// Per-job-type TTL overrides, keyed by type name.
    pub ttl_overrides: HashMap<String, Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            ttl_overrides: HashMap::new(),
        }
    }
}

/// Top-level settings for a loadshift deployment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Redis connection URL for the queue backend and shared cache.
    pub redis_url: String,
    /// Simultaneous jobs per worker instance.
    pub concurrency: usize,
    /// How long a worker blocks waiting for a job before re-checking shutdown.
    pub poll_interval: Duration,
    /// Timeout for graceful pool shutdown.
    pub shutdown_timeout: Duration,
    /// Circuit breaker thresholds, shared by all queues.
    pub breaker: CircuitBreakerConfig,
    /// Rate-limit retry backoff.
    pub backoff: BackoffConfig,
    /// Result-cache TTL policy.
    pub cache: CacheSettings,
    /// Auto-scaler thresholds.
    pub scaling: ScalingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            breaker: CircuitBreakerConfig::default(),
            backoff: BackoffConfig::default(),
            cache: CacheSettings::default(),
            scaling: ScalingConfig::default(),
        }
    }
}

impl Settings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads settings from the environment.
    ///
    /// Every variable is optional and falls back to the default:
    ///
    /// - `LOADSHIFT_REDIS_URL`
    /// - `LOADSHIFT_CONCURRENCY`, `LOADSHIFT_POLL_INTERVAL_SECS`,
    ///   `LOADSHIFT_SHUTDOWN_TIMEOUT_SECS`
    /// - `LOADSHIFT_BREAKER_ERROR_THRESHOLD`,
    ///   `LOADSHIFT_BREAKER_RESET_TIMEOUT_SECS`,
    ///   `LOADSHIFT_BREAKER_CALL_TIMEOUT_SECS`
    /// - `LOADSHIFT_BACKOFF_BASE_MS`, `LOADSHIFT_BACKOFF_MAX_MS`
    /// - `LOADSHIFT_CACHE_DEFAULT_TTL_SECS`, `LOADSHIFT_CACHE_TTLS`
    ///   (`job_type=secs` pairs, comma-separated)
    /// - `LOADSHIFT_CHECK_INTERVAL_SECS`, `LOADSHIFT_MIN_WORKERS`,
    ///   `LOADSHIFT_MAX_WORKERS`, `LOADSHIFT_SCALE_UP_STEP`,
    ///   `LOADSHIFT_SCALE_DOWN_STEP`, `LOADSHIFT_COOLDOWN_SECS`,
    ///   `LOADSHIFT_QUEUE_SIZE_UP`, `LOADSHIFT_AVG_WAIT_UP_SECS`,
    ///   `LOADSHIFT_QUEUE_SIZE_DOWN`, `LOADSHIFT_IDLE_TIME_SECS`,
    ///   `LOADSHIFT_UTILIZATION_DOWN`, `LOADSHIFT_CPU_CEILING`,
    ///   `LOADSHIFT_MEMORY_LIMIT`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` on an unparseable value or an inconsistent
    /// combination (see [`validate`](Settings::validate)).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        if let Ok(url) = std::env::var("LOADSHIFT_REDIS_URL") {
            settings.redis_url = url;
        }
        if let Some(v) = env_parse("LOADSHIFT_CONCURRENCY")? {
            settings.concurrency = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_POLL_INTERVAL_SECS")? {
            settings.poll_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("LOADSHIFT_SHUTDOWN_TIMEOUT_SECS")? {
            settings.shutdown_timeout = Duration::from_secs(v);
        }

        if let Some(v) = env_parse("LOADSHIFT_BREAKER_ERROR_THRESHOLD")? {
            settings.breaker.error_threshold = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_BREAKER_RESET_TIMEOUT_SECS")? {
            settings.breaker.reset_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("LOADSHIFT_BREAKER_CALL_TIMEOUT_SECS")? {
            settings.breaker.call_timeout = Duration::from_secs(v);
        }

        if let Some(v) = env_parse("LOADSHIFT_BACKOFF_BASE_MS")? {
            settings.backoff.base = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("LOADSHIFT_BACKOFF_MAX_MS")? {
            settings.backoff.max = Duration::from_millis(v);
        }

        if let Some(v) = env_parse("LOADSHIFT_CACHE_DEFAULT_TTL_SECS")? {
            settings.cache.default_ttl = Duration::from_secs(v);
        }
        if let Ok(raw) = std::env::var("LOADSHIFT_CACHE_TTLS") {
            settings.cache.ttl_overrides = parse_ttl_table("LOADSHIFT_CACHE_TTLS", &raw)?;
        }

        let scaling = &mut settings.scaling;
        if let Some(v) = env_parse("LOADSHIFT_CHECK_INTERVAL_SECS")? {
            scaling.check_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("LOADSHIFT_MIN_WORKERS")? {
            scaling.min_workers = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_MAX_WORKERS")? {
            scaling.max_workers = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_SCALE_UP_STEP")? {
            scaling.scale_up_step = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_SCALE_DOWN_STEP")? {
            scaling.scale_down_step = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_COOLDOWN_SECS")? {
            scaling.cooldown = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("LOADSHIFT_QUEUE_SIZE_UP")? {
            scaling.queue_size_up_threshold = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_AVG_WAIT_UP_SECS")? {
            scaling.avg_wait_up_threshold = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("LOADSHIFT_QUEUE_SIZE_DOWN")? {
            scaling.queue_size_down_threshold = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_IDLE_TIME_SECS")? {
            scaling.idle_time = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("LOADSHIFT_UTILIZATION_DOWN")? {
            scaling.utilization_down_threshold = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_CPU_CEILING")? {
            scaling.cpu_ceiling = v;
        }
        if let Some(v) = env_parse("LOADSHIFT_MEMORY_LIMIT")? {
            scaling.memory_limit = v;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks the settings for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scaling;
        if s.min_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "min_workers must be at least 1".to_string(),
            ));
        }
        if s.min_workers > s.max_workers {
            return Err(ConfigError::ValidationFailed(format!(
                "min_workers ({}) exceeds max_workers ({})",
                s.min_workers, s.max_workers
            )));
        }
        if s.scale_up_step == 0 || s.scale_down_step == 0 {
            return Err(ConfigError::ValidationFailed(
                "scaling steps must be at least 1".to_string(),
            ));
        }
        if s.min_samples == 0 {
            return Err(ConfigError::ValidationFailed(
                "min_samples must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("utilization_down_threshold", s.utilization_down_threshold),
            ("cpu_ceiling", s.cpu_ceiling),
            ("memory_limit", s.memory_limit),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.backoff.base > self.backoff.max {
            return Err(ConfigError::ValidationFailed(
                "backoff base exceeds backoff max".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Parses `job_type=secs` pairs, comma-separated.
fn parse_ttl_table(key: &str, raw: &str) -> Result<HashMap<String, Duration>, ConfigError> {
    let mut table = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (name, secs) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected job_type=secs, got '{pair}'"),
            })?;
        let secs: u64 = secs
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("non-numeric TTL in '{pair}'"),
            })?;
        table.insert(name.trim().to_string(), Duration::from_secs(secs));
    }
    Ok(table)
}
