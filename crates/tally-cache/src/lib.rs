//! Redis cache tier for the tally engine
//!
//! Provides the cache adapter used by the batching manager and the sync
//! reconciler. Cache instances are region-scoped; [`RegionalCaches`] holds
//! one adapter per region plus the home region this process writes to.
//!
//! The cache tier is always advisory: every entry is TTL-bounded and fully
//! reconstructable from the durable store, and every operation is
//! fast-failing so the hot path can fall back immediately.

pub mod batch;
pub mod invalidate;
pub mod keys;

pub use batch::{BatchDeductManager, BatchDeduction, BatchOutcome, FallbackReason};
pub use invalidate::{invalidate_many, invalidate_scope, InvalidationTarget};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use std::collections::HashMap;
use tally_core::traits::CacheStore;
use tally_core::{EngineError, EngineResult};
use tracing::{debug, error, warn};

/// Redis cache adapter with connection pooling
///
/// Wraps a Redis ConnectionManager for multiplexed async access. All
/// operations return `EngineError`; I/O failures map to `CacheUnavailable`
/// so callers route to the durable fallback.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Create a new cache adapter
    ///
    /// # Errors
    ///
    /// Returns `EngineError::CacheUnavailable` if the connection fails
    pub async fn new(url: &str) -> EngineResult<Self> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            EngineError::CacheUnavailable(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            EngineError::CacheUnavailable(format!("Connection failed: {}", e))
        })?;

        Ok(Self { manager })
    }

    /// Ping the Redis server to check connectivity
    pub async fn ping(&self) -> EngineResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    pub(crate) fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    #[cfg(test)]
    pub async fn flush_db(&self) -> EngineResult<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}

/// Convert RedisError to EngineError
///
/// I/O faults become `CacheUnavailable` (infrastructure, recover via
/// fallback); everything else is a cache error the caller also falls back
/// from, but logged at a lower severity.
pub(crate) fn map_redis_error(err: RedisError) -> EngineError {
    match err.kind() {
        redis::ErrorKind::IoError => {
            error!("Redis I/O error: {}", err);
            EngineError::CacheUnavailable(format!("I/O error: {}", err))
        }
        redis::ErrorKind::TypeError => {
            warn!("Redis type error: {}", err);
            EngineError::CacheWriteFailed(format!("Type mismatch: {}", err))
        }
        _ => {
            error!("Redis error: {}", err);
            EngineError::CacheUnavailable(err.to_string())
        }
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn delete(&self, key: &str) -> EngineResult<bool> {
        debug!("DEL {}", key);
        let mut conn = self.manager.clone();

        let deleted: i32 = conn.del(key).await.map_err(map_redis_error)?;

        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> EngineResult<bool> {
        debug!("EXISTS {}", key);
        let mut conn = self.manager.clone();

        let exists: bool = conn.exists(key).await.map_err(map_redis_error)?;

        Ok(exists)
    }

    async fn hget_all(&self, key: &str) -> EngineResult<Vec<(String, String)>> {
        debug!("HGETALL {}", key);
        let mut conn = self.manager.clone();

        let fields: Vec<(String, String)> = conn.hgetall(key).await.map_err(map_redis_error)?;

        Ok(fields)
    }

    async fn hset_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_secs: u64,
    ) -> EngineResult<()> {
        debug!("HSET {} ({} fields, TTL: {}s)", key, fields.len(), ttl_secs);
        let mut conn = self.manager.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, value) in fields {
            pipe.hset(key, field, value);
        }
        pipe.expire(key, ttl_secs as i64);

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        Ok(())
    }
}

/// Per-region cache instances
///
/// Sync items carry their origin region so reconciliation reads the snapshot
/// that was actually written, not a possibly-divergent local one.
#[derive(Clone)]
pub struct RegionalCaches {
    caches: HashMap<String, RedisCache>,
    home_region: String,
}

impl RegionalCaches {
    /// Build the region map; `home_region` must be present in `caches`
    pub fn new(caches: HashMap<String, RedisCache>, home_region: String) -> EngineResult<Self> {
        if !caches.contains_key(&home_region) {
            return Err(EngineError::Config(format!(
                "home region {} has no cache instance",
                home_region
            )));
        }
        Ok(Self {
            caches,
            home_region,
        })
    }

    /// Single-region setup
    pub fn single(region: impl Into<String>, cache: RedisCache) -> Self {
        let region = region.into();
        let mut caches = HashMap::new();
        caches.insert(region.clone(), cache.clone());
        Self {
            caches,
            home_region: region,
        }
    }

    /// The cache this process writes to
    pub fn home(&self) -> &RedisCache {
        &self.caches[&self.home_region]
    }

    /// Name of the home region, stamped onto sync items
    pub fn home_region(&self) -> &str {
        &self.home_region
    }

    /// The cache for a specific region
    pub fn for_region(&self, region: &str) -> EngineResult<&RedisCache> {
        self.caches
            .get(region)
            .ok_or_else(|| EngineError::Config(format!("unknown cache region: {}", region)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::traits::CacheStore;

    async fn setup_cache() -> RedisCache {
        let cache = RedisCache::new("redis://127.0.0.1:6379")
            .await
            .expect("Failed to connect to Redis");
        cache.flush_db().await.expect("Failed to flush DB");
        cache
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_ping() {
        let cache = setup_cache().await;
        assert!(cache.ping().await.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_hash_set_and_get_all() {
        let cache = setup_cache().await;

        cache
            .hset_with_ttl(
                "scope",
                &[
                    ("f:messages".to_string(), "{\"a\":1}".to_string()),
                    ("f:seats".to_string(), "{\"a\":2}".to_string()),
                ],
                60,
            )
            .await
            .unwrap();

        let mut fields = cache.hget_all("scope").await.unwrap();
        fields.sort();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].0, "f:messages");
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_absent_hash_is_empty() {
        let cache = setup_cache().await;
        let fields = cache.hget_all("nothing_here").await.unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn test_regional_caches_requires_home() {
        // Constructing the map without the home region must fail loudly at
        // startup rather than at first sync.
        let caches: HashMap<String, RedisCache> = HashMap::new();
        let result = RegionalCaches::new(caches, "us-east".to_string());
        assert!(result.is_err());
    }
}
