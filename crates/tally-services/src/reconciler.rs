//! Cache to durable-store reconciliation
//!
//! The batching manager commits deductions to the cache only; this module
//! carries them into PostgreSQL. Each sync item names one
//! (customer, feature, entity?) scope in one region. The reconciler reads
//! the raw per-scope cache state, derives the absolute durable balance it
//! implies, and runs a set-to deduction transaction against it.
//!
//! Set-to is what makes the queue safe to coalesce: ten batched deductions
//! and one sync land on the same final balance as ten syncs, and a repeated
//! sync is a no-op.

use rust_decimal::Decimal;
use std::sync::Arc;
use tally_cache::keys::{feature_field, scope_key};
use tally_cache::RegionalCaches;
use tally_core::models::balance::from_micros;
use tally_core::models::{CachedBalance, FeatureDeduction, OverageBehavior, SyncItem};
use tally_core::traits::{CacheStore, FeatureCatalog};
use tally_core::{EngineError, EngineResult};
use tracing::{debug, info, instrument, warn};

use crate::deduction_tx::{DeductionRequest, DeductionRunner};

/// Outcome of one sync item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncResult {
    /// The durable store now matches the cache snapshot
    Applied,
    /// No cache entry for the scope; nothing to carry over
    NoCacheEntry,
    /// The restriction matched no cached breakdown entry
    NoMatchingBreakdown,
    /// Every targeted entitlement was written after the snapshot
    Stale,
}

/// Flush statistics for one sync batch
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Carries cached balance state into the durable store
pub struct SyncReconciler {
    runner: Arc<DeductionRunner>,
    caches: Arc<RegionalCaches>,
    catalog: Arc<dyn FeatureCatalog>,
}

impl SyncReconciler {
    pub fn new(
        runner: Arc<DeductionRunner>,
        caches: Arc<RegionalCaches>,
        catalog: Arc<dyn FeatureCatalog>,
    ) -> Self {
        Self {
            runner,
            caches,
            catalog,
        }
    }

    /// Reconcile one scope from its region's cache snapshot
    #[instrument(skip(self, item), fields(
        customer_id = %item.customer_id,
        feature_id = %item.feature_id,
        region = %item.region,
    ))]
    pub async fn sync_item(&self, item: SyncItem) -> EngineResult<SyncResult> {
        let cache = self.caches.for_region(&item.region)?;
        let key = scope_key(
            &item.org_id,
            item.env,
            &item.customer_id,
            item.entity_id.as_deref(),
            item.cache_version,
        );

        let fields = cache.hget_all(&key).await?;
        let field = feature_field(&item.feature_id);
        let raw = match fields.iter().find(|(name, _)| *name == field) {
            Some((_, raw)) => raw,
            None => {
                debug!("No cached state for scope; sync skipped");
                return Ok(SyncResult::NoCacheEntry);
            }
        };
        let cached: CachedBalance = serde_json::from_str(raw)?;

        // A restriction that matches nothing must skip; writing zero here
        // would erase balance the cache never tracked
        let restricted = match cached.restricted_breakdown(&item.sort_params.entitlement_ids) {
            Some(entries) => entries,
            None => {
                debug!("Restriction matched no cached breakdown entry; sync skipped");
                return Ok(SyncResult::NoMatchingBreakdown);
            }
        };

        let target = if item.sort_params.is_restricted() {
            restricted
                .iter()
                .map(|b| from_micros(b.balance_micros))
                .sum::<Decimal>()
        } else {
            cached.to_api(&item.feature_id).backend_balance()
        };

        let feature = self.catalog.resolve_feature(&item.feature_id).await?;

        let mut request = DeductionRequest::new(
            item.customer_id.clone(),
            item.org_id.clone(),
            item.env,
            vec![FeatureDeduction::set_to(feature, target)],
        );
        request.entity_id = item.entity_id.clone();
        request.behavior = OverageBehavior::Allow;
        request.sort_params = item.sort_params.clone();
        request.refresh_cache = false;
        request.snapshot_at = Some(item.snapshot_at);
        request.prefetched = item.prefetched;

        match self.runner.run(request).await {
            Ok(outcome) => {
                if outcome.balances.is_empty() {
                    // the staleness guard excluded every entitlement
                    debug!("Durable state newer than the cache snapshot; sync skipped");
                    return Ok(SyncResult::Stale);
                }
                debug!(target = %target, "Scope reconciled");
                Ok(SyncResult::Applied)
            }
            // the restricted entitlement no longer exists on the customer
            Err(EngineError::EntitlementNotFound(id)) => {
                warn!(entitlement_id = %id, "Entitlement gone; sync skipped");
                Ok(SyncResult::NoMatchingBreakdown)
            }
            Err(e) => Err(e),
        }
    }

    /// Reconcile a coalesced batch, one scope at a time
    ///
    /// Failures are logged and counted, never fatal for the batch; a missed
    /// scope converges on the next deduction's sync or on cache expiry.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn sync_batch(&self, items: Vec<SyncItem>) -> SyncStats {
        let mut stats = SyncStats::default();
        for item in items {
            match self.sync_item(item).await {
                Ok(SyncResult::Applied) => stats.applied += 1,
                Ok(_) => stats.skipped += 1,
                Err(e) => {
                    warn!(error = %e, "Sync item failed");
                    stats.failed += 1;
                }
            }
        }
        info!(
            applied = stats.applied,
            skipped = stats.skipped,
            failed = stats.failed,
            "Sync batch flushed"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        db_pool, entitlement_balance, redis_cache, runner, seed_customer, StaticCatalog,
    };
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use tally_core::models::balance::to_micros;
    use tally_core::models::{AppEnv, CachedBreakdown, Feature, SortParams};
    use uuid::Uuid;

    async fn write_cached_balance(
        cache: &tally_cache::RedisCache,
        customer_id: &str,
        current: rust_decimal::Decimal,
        entitlement_id: Uuid,
    ) {
        let cached = CachedBalance {
            current_micros: to_micros(current).unwrap(),
            purchased_micros: 0,
            prepaid_micros: 0,
            granted_micros: to_micros(dec!(100)).unwrap(),
            usage_micros: to_micros(dec!(100) - current).unwrap(),
            min_micros: Some(0),
            requires_durable: false,
            breakdown: vec![CachedBreakdown {
                entitlement_id,
                balance_micros: to_micros(current).unwrap(),
                granted_micros: to_micros(dec!(100)).unwrap(),
            }],
        };
        let key = scope_key("org_test", AppEnv::Sandbox, customer_id, None, 2);
        cache
            .hset_with_ttl(
                &key,
                &[(
                    feature_field("messages"),
                    serde_json::to_string(&cached).unwrap(),
                )],
                60,
            )
            .await
            .unwrap();
    }

    fn sync_item(customer_id: &str, snapshot_at: chrono::DateTime<Utc>) -> SyncItem {
        SyncItem {
            customer_id: customer_id.to_string(),
            feature_id: "messages".to_string(),
            org_id: "org_test".to_string(),
            env: AppEnv::Sandbox,
            entity_id: None,
            region: "test".to_string(),
            cache_version: 2,
            snapshot_at,
            sort_params: SortParams::default(),
            prefetched: None,
        }
    }

    fn reconciler_for(
        runner: DeductionRunner,
        cache: tally_cache::RedisCache,
        feature_internal: Uuid,
    ) -> SyncReconciler {
        let mut feature = Feature::metered("messages");
        feature.internal_id = feature_internal;
        SyncReconciler::new(
            Arc::new(runner),
            Arc::new(RegionalCaches::single("test", cache)),
            Arc::new(StaticCatalog {
                features: vec![feature],
            }),
        )
    }

    #[tokio::test]
    #[ignore] // Requires database and Redis
    async fn test_sync_carries_cache_state_to_durable() {
        let pool = db_pool().await;
        let cache = redis_cache().await;
        let (customer_id, entitlement_id, feature_internal) =
            seed_customer(&pool, dec!(100)).await;

        write_cached_balance(&cache, &customer_id, dec!(40), entitlement_id).await;

        let reconciler = reconciler_for(
            runner(pool.clone(), feature_internal).await,
            cache,
            feature_internal,
        );
        let result = reconciler
            .sync_item(sync_item(&customer_id, Utc::now()))
            .await
            .unwrap();

        assert_eq!(result, SyncResult::Applied);
        assert_eq!(entitlement_balance(&pool, entitlement_id).await, dec!(40));

        // repeating the same sync converges on the same balance
        let repeat = reconciler
            .sync_item(sync_item(&customer_id, Utc::now()))
            .await
            .unwrap();
        assert_eq!(repeat, SyncResult::Applied);
        assert_eq!(entitlement_balance(&pool, entitlement_id).await, dec!(40));
    }

    #[tokio::test]
    #[ignore] // Requires database and Redis
    async fn test_stale_snapshot_does_not_overwrite_newer_write() {
        let pool = db_pool().await;
        let cache = redis_cache().await;
        let (customer_id, entitlement_id, feature_internal) =
            seed_customer(&pool, dec!(100)).await;

        write_cached_balance(&cache, &customer_id, dec!(70), entitlement_id).await;

        // a durable write lands after the cache snapshot was taken
        let stale_instant = Utc::now() - Duration::seconds(30);
        sqlx::query(
            "UPDATE customer_entitlements SET balance = 55, updated_at = NOW() WHERE id = $1",
        )
        .bind(entitlement_id)
        .execute(&pool)
        .await
        .unwrap();

        let reconciler = reconciler_for(
            runner(pool.clone(), feature_internal).await,
            cache,
            feature_internal,
        );
        let result = reconciler
            .sync_item(sync_item(&customer_id, stale_instant))
            .await
            .unwrap();

        assert_eq!(result, SyncResult::Stale);
        assert_eq!(entitlement_balance(&pool, entitlement_id).await, dec!(55));
    }

    #[tokio::test]
    #[ignore] // Requires database and Redis
    async fn test_restriction_matching_nothing_skips() {
        let pool = db_pool().await;
        let cache = redis_cache().await;
        let (customer_id, entitlement_id, feature_internal) =
            seed_customer(&pool, dec!(100)).await;

        write_cached_balance(&cache, &customer_id, dec!(40), entitlement_id).await;

        let reconciler = reconciler_for(
            runner(pool.clone(), feature_internal).await,
            cache,
            feature_internal,
        );
        let mut item = sync_item(&customer_id, Utc::now());
        item.sort_params = SortParams::only(Uuid::new_v4());

        let result = reconciler.sync_item(item).await.unwrap();
        assert_eq!(result, SyncResult::NoMatchingBreakdown);
        assert_eq!(entitlement_balance(&pool, entitlement_id).await, dec!(100));
    }
}
