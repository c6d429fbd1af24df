//! Usage tracking front door
//!
//! `track` tries the batched in-cache deduction first and falls back to the
//! durable transaction when the cache cannot answer. A cache commit leaves
//! the durable store behind, so every applied batch enqueues sync work for
//! the changed scopes and an event for the audit trail; the durable path
//! records its event inside the transaction and invalidates the cache
//! instead.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tally_cache::keys::CACHE_VERSION;
use tally_cache::{BatchDeductManager, BatchDeduction, BatchOutcome, FallbackReason, RegionalCaches};
use tally_core::models::{
    ApiBalance, AppEnv, EventInfo, FeatureDeduction, OverageBehavior, SortParams, SyncItem,
    UsageEvent,
};
use tally_core::traits::FeatureCatalog;
use tally_core::{EngineError, EngineResult};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::deduction_tx::{DeductionRequest, DeductionRunner};
use crate::queues::{EventQueue, SyncQueue};

/// One usage tracking call
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub customer_id: String,
    pub org_id: String,
    pub env: AppEnv,
    pub entity_id: Option<String>,
    pub feature_id: String,

    /// Units consumed; negative values release held usage
    pub value: Decimal,

    /// Overage policy; defaults to capping at the floor
    pub behavior: Option<OverageBehavior>,

    pub event: EventInfo,
}

/// Balances after a tracking call
#[derive(Debug)]
pub struct TrackResponse {
    pub balances: Vec<ApiBalance>,

    /// True when the durable transaction answered instead of the cache
    pub durable_fallback: bool,
}

/// Administrative balance correction
#[derive(Debug, Clone)]
pub struct UpdateBalanceRequest {
    pub customer_id: String,
    pub org_id: String,
    pub env: AppEnv,
    pub entity_id: Option<String>,
    pub feature_id: String,
    pub entitlement_id: Uuid,

    /// Absolute balance to set the entitlement to
    pub target: Decimal,

    /// Reschedule the next refill alongside the correction
    pub next_reset_at: Option<DateTime<Utc>>,
}

/// Entry point for deductions: cache fast path with durable fallback
pub struct TrackService {
    batch: BatchDeductManager,
    runner: Arc<DeductionRunner>,
    catalog: Arc<dyn FeatureCatalog>,
    caches: Arc<RegionalCaches>,
    sync_queue: SyncQueue,
    event_queue: EventQueue,
}

impl TrackService {
    pub fn new(
        batch: BatchDeductManager,
        runner: Arc<DeductionRunner>,
        catalog: Arc<dyn FeatureCatalog>,
        caches: Arc<RegionalCaches>,
        sync_queue: SyncQueue,
        event_queue: EventQueue,
    ) -> Self {
        Self {
            batch,
            runner,
            catalog,
            caches,
            sync_queue,
            event_queue,
        }
    }

    /// Record usage against a feature
    #[instrument(skip(self, request), fields(
        customer_id = %request.customer_id,
        feature_id = %request.feature_id,
        value = %request.value,
    ))]
    pub async fn track(&self, request: TrackRequest) -> EngineResult<TrackResponse> {
        let behavior = request.behavior.unwrap_or_default();
        let related = self.catalog.related_features(&request.feature_id).await?;

        // Credit systems drain several entitlement pools at entitlement
        // granularity; only the durable planner can express that. A keyed
        // call must replay as a balance no-op, and only the durable
        // transaction checks the key before deducting, so it goes there too.
        if related.len() == 1 && request.event.idempotency_key.is_none() {
            let deductions = [BatchDeduction {
                feature_id: request.feature_id.clone(),
                amount: request.value,
            }];
            let outcome = self
                .batch
                .deduct(
                    &request.customer_id,
                    &deductions,
                    &request.org_id,
                    request.env,
                    request.entity_id.as_deref(),
                    behavior,
                )
                .await?;

            match outcome {
                BatchOutcome::Applied {
                    balances,
                    customer_changed,
                    changed_entity_ids,
                } => {
                    self.enqueue_syncs(&request, customer_changed, &changed_entity_ids);
                    self.event_queue.enqueue(UsageEvent::from_info(
                        &request.event,
                        &request.org_id,
                        request.env,
                        None,
                        &request.customer_id,
                        request.entity_id.as_deref(),
                        &request.feature_id,
                    ));
                    return Ok(TrackResponse {
                        balances,
                        durable_fallback: false,
                    });
                }
                BatchOutcome::Insufficient {
                    feature_id,
                    requested,
                    available,
                } => {
                    return Err(EngineError::InsufficientBalance {
                        feature_id,
                        requested: requested.to_string(),
                        available: available.to_string(),
                    });
                }
                BatchOutcome::Fallback(reason) => {
                    debug!(reason = ?reason, "Cache batch fell back to the durable path");
                    if let FallbackReason::CacheFault(fault) = &reason {
                        tracing::warn!(fault = %fault, "Cache tier fault on track");
                    }
                }
            }
        }

        self.track_durable(request, behavior, related).await
    }

    async fn track_durable(
        &self,
        request: TrackRequest,
        behavior: OverageBehavior,
        related: Vec<(tally_core::models::Feature, Decimal)>,
    ) -> EngineResult<TrackResponse> {
        let (feature, _) = related
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::FeatureNotFound(request.feature_id.clone()))?;

        let event = UsageEvent::from_info(
            &request.event,
            &request.org_id,
            request.env,
            None,
            &request.customer_id,
            request.entity_id.as_deref(),
            &request.feature_id,
        );

        let mut durable = DeductionRequest::new(
            request.customer_id,
            request.org_id,
            request.env,
            vec![FeatureDeduction::decrement(feature, request.value)],
        );
        durable.entity_id = request.entity_id;
        durable.behavior = behavior;
        durable.refresh_cache = true;
        durable.event = Some(event);

        let outcome = self.runner.run(durable).await?;
        Ok(TrackResponse {
            balances: outcome.balances,
            durable_fallback: true,
        })
    }

    /// Set an entitlement's balance absolutely (admin correction)
    ///
    /// Runs on the durable path under the allow policy, restricted to the
    /// named entitlement, and invalidates the scope's cache.
    #[instrument(skip(self, request), fields(
        customer_id = %request.customer_id,
        entitlement_id = %request.entitlement_id,
    ))]
    pub async fn update_balance(
        &self,
        request: UpdateBalanceRequest,
    ) -> EngineResult<Vec<ApiBalance>> {
        let feature = self.catalog.resolve_feature(&request.feature_id).await?;

        let mut durable = DeductionRequest::new(
            request.customer_id,
            request.org_id,
            request.env,
            vec![FeatureDeduction::set_to(feature, request.target)],
        );
        durable.entity_id = request.entity_id;
        durable.behavior = OverageBehavior::Allow;
        durable.sort_params = SortParams::only(request.entitlement_id);
        durable.refresh_cache = true;
        durable.set_next_reset = request.next_reset_at;

        let outcome = self.runner.run(durable).await?;
        Ok(outcome.balances)
    }

    fn enqueue_syncs(
        &self,
        request: &TrackRequest,
        customer_changed: bool,
        changed_entity_ids: &[String],
    ) {
        let region = self.caches.home_region().to_string();
        let snapshot_at = Utc::now();
        let base = |entity_id: Option<String>| SyncItem {
            customer_id: request.customer_id.clone(),
            feature_id: request.feature_id.clone(),
            org_id: request.org_id.clone(),
            env: request.env,
            entity_id,
            region: region.clone(),
            cache_version: CACHE_VERSION,
            snapshot_at,
            sort_params: SortParams::default(),
            prefetched: None,
        };

        if customer_changed {
            self.sync_queue.enqueue(base(None));
        }
        for entity_id in changed_entity_ids {
            self.sync_queue.enqueue(base(Some(entity_id.clone())));
        }
    }

    /// Close both queues and drain their pending work
    pub async fn shutdown(self) {
        self.sync_queue.shutdown().await;
        self.event_queue.shutdown().await;
    }
}
