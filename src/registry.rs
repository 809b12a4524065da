//! Typed registry mapping job-type names to handlers and cache policy.
//!
//! The registry is assembled at process bootstrap and validated up front:
//! duplicate registrations are rejected, and executing a job whose type
//! was never registered is a hard error rather than a silent fall-through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::{Job, JobContext};

/// Short default TTL applied to cacheable types registered without one.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Classification of a handler failure, used by the processor to pick
/// retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    /// A downstream rate limit; retry after a computed backoff.
    RateLimit,
    /// The handler's own notion of a timeout.
    Timeout,
    /// Any other failure.
    Other,
}

/// Error returned by a job handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Failure class driving retry behavior.
    pub kind: HandlerErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl HandlerError {
    /// A rate-limit failure; the job will be retried with backoff.
    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::RateLimit,
            message: message.into(),
        }
    }

    /// A timeout reported by the handler itself.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Timeout,
            message: message.into(),
        }
    }

    /// Any other failure.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: HandlerErrorKind::Other,
            message: message.into(),
        }
    }
}

/// A job-type-specific processor function.
///
/// Handlers receive the job payload plus an execution context and return
/// an opaque, serializable result.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Executes one job.
    async fn run(
        &self,
        payload: &serde_json::Value,
        ctx: &JobContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Derives a cache key from a job payload; `None` means not cacheable.
pub type CacheKeyFn = Arc<dyn Fn(&serde_json::Value) -> Option<String> + Send + Sync>;

/// Everything the pool needs to know about one job type.
pub struct JobTypeSpec {
    name: String,
    handler: Arc<dyn JobHandler>,
    cacheable: bool,
    ttl: Option<Duration>,
    cache_key: Option<CacheKeyFn>,
}

impl std::fmt::Debug for JobTypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTypeSpec")
            .field("name", &self.name)
            .field("cacheable", &self.cacheable)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl JobTypeSpec {
    /// Creates a non-cacheable job type bound to `handler`.
    pub fn new(name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            cacheable: false,
            ttl: None,
            cache_key: None,
        }
    }

    /// Marks this type cacheable, deriving keys with `key_fn`.
    ///
    /// Payloads for which `key_fn` returns `None` bypass the cache.
    pub fn with_cache_key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Option<String> + Send + Sync + 'static,
    {
        self.cacheable = true;
        self.cache_key = Some(Arc::new(key_fn));
        self
    }

    /// Sets the TTL for cached results of this type.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Returns the job-type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether results of this type may be cached.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Returns the handler bound to this type.
    pub fn handler(&self) -> Arc<dyn JobHandler> {
        Arc::clone(&self.handler)
    }
}

/// Errors raised while assembling the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The same job-type name was registered twice.
    #[error("job type '{0}' already registered")]
    Duplicate(String),

    /// A job-type name was empty.
    #[error("job type name must be non-empty")]
    EmptyName,

    /// A TTL override named a type that was never registered.
    #[error("job type '{0}' not registered")]
    NotFound(String),
}

/// Registry of all job types the pool can execute.
#[derive(Debug)]
pub struct JobTypeRegistry {
    types: HashMap<String, JobTypeSpec>,
    default_ttl: Duration,
}

impl Default for JobTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTypeRegistry {
    /// Creates an empty registry with the crate's default cache TTL.
    pub fn new() -> Self {
        Self {
            types: HashMap::new(),
            default_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Sets the TTL used by cacheable types that did not specify one.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Registers a job type, rejecting duplicates.
    pub fn register(&mut self, spec: JobTypeSpec) -> Result<(), RegistryError> {
        if spec.name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.types.contains_key(&spec.name) {
            return Err(RegistryError::Duplicate(spec.name));
        }
        self.types.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Replaces the TTL of an already-registered type, e.g. from config.
    pub fn override_ttl(&mut self, name: &str, ttl: Duration) -> Result<(), RegistryError> {
        match self.types.get_mut(name) {
            Some(spec) => {
                spec.ttl = Some(ttl);
                Ok(())
            }
            None => Err(RegistryError::NotFound(name.to_string())),
        }
    }

    /// Looks up a job type by name.
    pub fn get(&self, name: &str) -> Option<&JobTypeSpec> {
        self.types.get(name)
    }

    /// Returns the effective TTL for a type's cached results.
    pub fn effective_ttl(&self, spec: &JobTypeSpec) -> Duration {
        spec.ttl.unwrap_or(self.default_ttl)
    }

    /// Derives the cache key for `job`, or `None` when the cache must be
    /// bypassed.
    ///
    /// The cache is bypassed when the job carries the no-cache flag, when
    /// its type is not cacheable, or when no key can be derived. An
    /// explicit key on the job wins over the type's derivation.
    pub fn cache_key_for(&self, job: &Job) -> Option<String> {
        if job.no_cache {
            return None;
        }
        let spec = self.get(&job.job_type)?;
        if !spec.cacheable {
            return None;
        }
        if let Some(key) = &job.cache_key {
            return Some(key.clone());
        }
        spec.cache_key.as_ref().and_then(|f| f(&job.payload))
    }

    /// Returns the registered type names.
    pub fn names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }

    /// Returns the number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn run(
            &self,
            _payload: &serde_json::Value,
            _ctx: &JobContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(json!(null))
        }
    }

    fn research_spec() -> JobTypeSpec {
        JobTypeSpec::new("deep_research", Arc::new(NoopHandler))
            .with_cache_key(|payload| {
                payload
                    .get("topic")
                    .and_then(|t| t.as_str())
                    .map(|t| format!("research:{t}"))
            })
            .with_ttl(Duration::from_secs(24 * 3600))
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = JobTypeRegistry::new();
        registry.register(research_spec()).expect("first");

        let err = registry.register(research_spec()).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "deep_research"));
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let mut registry = JobTypeRegistry::new();
        let err = registry
            .register(JobTypeSpec::new("", Arc::new(NoopHandler)))
            .unwrap_err();
        assert!(matches!(err, RegistryError::EmptyName));
    }

    #[test]
    fn test_cache_key_derivation_is_idempotent() {
        let mut registry = JobTypeRegistry::new();
        registry.register(research_spec()).expect("register");

        let job = Job::new("research", "deep_research", json!({"topic": "lifetimes"}));
        let first = registry.cache_key_for(&job);
        let second = registry.cache_key_for(&job);

        assert_eq!(first.as_deref(), Some("research:lifetimes"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_cache_flag_bypasses_derivation() {
        let mut registry = JobTypeRegistry::new();
        registry.register(research_spec()).expect("register");

        let job =
            Job::new("research", "deep_research", json!({"topic": "x"})).without_cache();
        assert_eq!(registry.cache_key_for(&job), None);
    }

    #[test]
    fn test_explicit_key_wins_over_derivation() {
        let mut registry = JobTypeRegistry::new();
        registry.register(research_spec()).expect("register");

        let job = Job::new("research", "deep_research", json!({"topic": "x"}))
            .with_cache_key("research:pinned");
        assert_eq!(registry.cache_key_for(&job).as_deref(), Some("research:pinned"));
    }

    #[test]
    fn test_non_cacheable_type_never_yields_a_key() {
        let mut registry = JobTypeRegistry::new();
        registry
            .register(JobTypeSpec::new("publish_draft", Arc::new(NoopHandler)))
            .expect("register");

        // Even an explicit key is ignored for non-cacheable types.
        let job =
            Job::new("writer", "publish_draft", json!({})).with_cache_key("publish:1");
        assert_eq!(registry.cache_key_for(&job), None);
    }

    #[test]
    fn test_underivable_key_bypasses_cache() {
        let mut registry = JobTypeRegistry::new();
        registry.register(research_spec()).expect("register");

        let job = Job::new("research", "deep_research", json!({"no_topic": true}));
        assert_eq!(registry.cache_key_for(&job), None);
    }

    #[test]
    fn test_effective_ttl_falls_back_to_default() {
        let mut registry =
            JobTypeRegistry::new().with_default_ttl(Duration::from_secs(120));
        registry.register(research_spec()).expect("research");
        registry
            .register(
                JobTypeSpec::new("format_summary", Arc::new(NoopHandler))
                    .with_cache_key(|_| Some("summary".to_string())),
            )
            .expect("summary");

        let research = registry.get("deep_research").expect("spec");
        let summary = registry.get("format_summary").expect("spec");
        assert_eq!(registry.effective_ttl(research), Duration::from_secs(24 * 3600));
        assert_eq!(registry.effective_ttl(summary), Duration::from_secs(120));
    }

    #[test]
    fn test_override_ttl() {
        let mut registry = JobTypeRegistry::new();
        registry.register(research_spec()).expect("register");

        registry
            .override_ttl("deep_research", Duration::from_secs(60))
            .expect("override");
        let spec = registry.get("deep_research").expect("spec");
        assert_eq!(registry.effective_ttl(spec), Duration::from_secs(60));

        let err = registry
            .override_ttl("missing", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
