//! In-process cache backend for tests and single-node embedders.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::ResultCache;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// A `HashMap`-backed cache with lazy expiry.
///
/// Expired entries are evicted on access; long-lived embedders can also
/// call [`purge_expired`](MemoryCache::purge_expired) from a periodic task.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes all expired entries and returns how many were evicted.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }

    /// Returns the number of entries, including not-yet-evicted expired ones.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        let entry = CacheEntry {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        };
        self.lock().insert(key.to_string(), entry);
    }
}
