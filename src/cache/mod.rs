//! Result cache consulted by workers before invoking job handlers.
//!
//! Cacheable job types store their results under a derived key with a
//! per-type TTL. Cache unavailability is deliberately invisible to job
//! execution: backends swallow their own errors and degrade to miss
//! behavior, so a broken cache can never fail a job.

mod memory;
mod redis;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

use std::time::Duration;

use async_trait::async_trait;

/// Key-value store for job results with per-entry TTL.
///
/// Implementations must treat backend failures as misses (`get`) or
/// no-ops (`set`) and log them, never surfacing an error to the caller.
#[async_trait]
pub trait ResultCache: Send + Sync + std::fmt::Debug {
    /// Returns the stored value if present and not expired.
    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Stores `value` under `key`, expiring after `ttl`. Overwrites any
    /// existing entry.
    async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration);
}
