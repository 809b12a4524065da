//! Redis-backed cache shared across worker processes.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use super::ResultCache;

/// Redis result cache using plain `SET key value EX ttl` / `GET`.
///
/// Values are stored as JSON strings under a `cache:` prefix. Per the
/// degradation contract, connection or protocol errors are logged and
/// reported as misses.
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connects to Redis at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(redis))
    }

    /// Creates a cache from an existing connection manager.
    ///
    /// Useful when the connection pool is shared with the queue backend.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            prefix: "cache:".to_string(),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl ResultCache for RedisCache {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = match conn.get(self.full_key(key)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "cache get failed, treating as miss");
                return None;
            }
        };

        raw.and_then(|s| match serde_json::from_str(&s) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "cached value unparseable, treating as miss");
                None
            }
        })
    }

    async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) {
        let serialized = match serde_json::to_string(value) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %key, error = %e, "result not serializable, skipping cache store");
                return;
            }
        };

        let mut conn = self.redis.clone();
        let ttl_secs = ttl.as_secs().max(1);
        if let Err(e) = conn
            .set_ex::<_, _, ()>(self.full_key(key), serialized, ttl_secs)
            .await
        {
            warn!(key = %key, error = %e, "cache store failed, result not cached");
        }
    }
}
