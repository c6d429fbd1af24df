//! Cache invalidation
//!
//! Deletes cover both the current and previous schema versions so a version
//! bump cannot leave a stale readable entry behind. Multi-customer
//! invalidation groups keys by org partition: all keys of one org share a
//! hash slot (see `keys`), so each org's deletes go out as one pipeline.

use std::collections::HashMap;

use tally_core::models::AppEnv;
use tally_core::EngineResult;
use tracing::{debug, instrument};

use crate::keys::{self, CACHE_VERSION, PREV_CACHE_VERSION};
use crate::{map_redis_error, RedisCache};

/// A customer scope to invalidate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvalidationTarget {
    pub org_id: String,
    pub env: AppEnv,
    pub customer_id: String,
    pub entity_id: Option<String>,
}

impl InvalidationTarget {
    /// Keys for this scope across all deletable versions
    fn keys(&self) -> Vec<String> {
        [CACHE_VERSION, PREV_CACHE_VERSION]
            .iter()
            .map(|v| {
                keys::scope_key(
                    &self.org_id,
                    self.env,
                    &self.customer_id,
                    self.entity_id.as_deref(),
                    *v,
                )
            })
            .collect()
    }
}

/// Delete the cached balances for one customer scope
///
/// When `entity_id` is `None` the customer-level key is removed; entity keys
/// are separate scopes and must be invalidated individually.
#[instrument(skip(cache))]
pub async fn invalidate_scope(
    cache: &RedisCache,
    org_id: &str,
    env: AppEnv,
    customer_id: &str,
    entity_id: Option<&str>,
) -> EngineResult<u64> {
    let target = InvalidationTarget {
        org_id: org_id.to_string(),
        env,
        customer_id: customer_id.to_string(),
        entity_id: entity_id.map(str::to_string),
    };

    let mut conn = cache.connection();
    let deleted: u64 = redis::cmd("DEL")
        .arg(target.keys())
        .query_async(&mut conn)
        .await
        .map_err(map_redis_error)?;

    debug!(deleted, "Invalidated cache scope");
    Ok(deleted)
}

/// Delete cached balances for many customers in few round trips
///
/// Targets are grouped by org so each pipeline only touches one hash slot.
/// Returns the number of keys actually deleted.
#[instrument(skip(cache, targets), fields(targets = targets.len()))]
pub async fn invalidate_many(
    cache: &RedisCache,
    targets: &[InvalidationTarget],
) -> EngineResult<u64> {
    let mut by_org: HashMap<&str, Vec<String>> = HashMap::new();
    for target in targets {
        by_org
            .entry(target.org_id.as_str())
            .or_default()
            .extend(target.keys());
    }

    let mut conn = cache.connection();
    let mut total: u64 = 0;

    for (org_id, org_keys) in by_org {
        let mut pipe = redis::pipe();
        for key in &org_keys {
            pipe.del(key);
        }
        let counts: Vec<u64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        let deleted: u64 = counts.iter().sum();
        debug!(org_id, deleted, "Invalidated org cache partition");
        total += deleted;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::traits::CacheStore;

    #[test]
    fn test_target_covers_both_versions() {
        let target = InvalidationTarget {
            org_id: "org_1".to_string(),
            env: AppEnv::Live,
            customer_id: "cus_1".to_string(),
            entity_id: None,
        };
        let keys = target.keys();
        assert_eq!(keys.len(), 2);
        assert!(keys[0].ends_with(&format!(":v{}", CACHE_VERSION)));
        assert!(keys[1].ends_with(&format!(":v{}", PREV_CACHE_VERSION)));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_invalidate_scope_removes_both_versions() {
        let cache = RedisCache::new("redis://127.0.0.1:6379").await.unwrap();
        cache.flush_db().await.unwrap();

        let current = keys::customer_key_versioned("o", AppEnv::Live, "c", CACHE_VERSION);
        let previous = keys::customer_key_versioned("o", AppEnv::Live, "c", PREV_CACHE_VERSION);
        cache
            .hset_with_ttl(&current, &[("f:x".to_string(), "{}".to_string())], 60)
            .await
            .unwrap();
        cache
            .hset_with_ttl(&previous, &[("f:x".to_string(), "{}".to_string())], 60)
            .await
            .unwrap();

        let deleted = invalidate_scope(&cache, "o", AppEnv::Live, "c", None)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(!cache.exists(&current).await.unwrap());
        assert!(!cache.exists(&previous).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_invalidate_many_grouped_by_org() {
        let cache = RedisCache::new("redis://127.0.0.1:6379").await.unwrap();
        cache.flush_db().await.unwrap();

        let targets: Vec<InvalidationTarget> = (0..4)
            .map(|i| InvalidationTarget {
                org_id: format!("org_{}", i % 2),
                env: AppEnv::Live,
                customer_id: format!("cus_{}", i),
                entity_id: None,
            })
            .collect();

        for t in &targets {
            let key = keys::customer_key(&t.org_id, t.env, &t.customer_id);
            cache
                .hset_with_ttl(&key, &[("f:x".to_string(), "{}".to_string())], 60)
                .await
                .unwrap();
        }

        let deleted = invalidate_many(&cache, &targets).await.unwrap();
        assert_eq!(deleted, 4);
    }
}
