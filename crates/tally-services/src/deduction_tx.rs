//! Durable deduction transaction
//!
//! The authoritative deduction path. Everything happens inside one
//! PostgreSQL transaction under an exclusive per-scope advisory lock:
//! load the customer, plan every feature deduction, record the usage event,
//! apply the writes, fire threshold notifications, commit. Any failure rolls
//! the whole thing back, so concurrent calls for one scope serialize and
//! each sees the previous call's writes.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use tally_cache::{invalidate_scope, RegionalCaches};
use tally_core::config::DeductionConfig;
use tally_core::models::{
    ApiBalance, ApiBalanceBreakdown, AppEnv, DeductionAmount, Feature, FeatureDeduction,
    FullCustomer, OverageBehavior, ProductStatus, SortParams, UsageEvent,
};
use tally_core::traits::{FeatureCatalog, NotificationHook, OveragePriceResolver};
use tally_core::{EngineError, EngineResult};
use tally_db::{customer_repo, event_repo, lock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::planner::{plan_feature_deduction, FeaturePlan, PlanEntry};

/// One durable deduction request
#[derive(Debug)]
pub struct DeductionRequest {
    pub customer_id: String,
    pub org_id: String,
    pub env: AppEnv,
    pub entity_id: Option<String>,

    /// Deductions to apply atomically; all succeed or none do
    pub deductions: Vec<FeatureDeduction>,

    pub behavior: OverageBehavior,

    /// Restrict to specific entitlements (partial-scope syncs, corrections)
    pub sort_params: SortParams,

    /// Invalidate the scope's cache entries after commit
    pub refresh_cache: bool,

    /// Usage event to record in the same transaction; a duplicate
    /// idempotency key rolls the whole deduction back
    pub event: Option<UsageEvent>,

    /// Skip set-to writes for entitlements updated after this instant
    pub snapshot_at: Option<DateTime<Utc>>,

    /// Schedule the next balance refill for the restricted entitlements
    pub set_next_reset: Option<DateTime<Utc>>,

    /// Customer loaded by the caller; skips the in-transaction fetch
    pub prefetched: Option<Box<FullCustomer>>,
}

impl DeductionRequest {
    pub fn new(
        customer_id: impl Into<String>,
        org_id: impl Into<String>,
        env: AppEnv,
        deductions: Vec<FeatureDeduction>,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            org_id: org_id.into(),
            env,
            entity_id: None,
            deductions,
            behavior: OverageBehavior::default(),
            sort_params: SortParams::default(),
            refresh_cache: true,
            event: None,
            snapshot_at: None,
            set_next_reset: None,
            prefetched: None,
        }
    }
}

/// Result of a committed durable deduction
#[derive(Debug)]
pub struct DurableOutcome {
    /// Post-commit balance projection per requested feature
    ///
    /// Durable projections carry no purchased-pack split; purchased and
    /// prepaid components are zero here.
    pub balances: Vec<ApiBalance>,

    /// True when the idempotency key was already recorded and nothing was
    /// written
    pub deduplicated: bool,
}

struct PlannedFeature {
    feature: Feature,
    entries: Vec<PlanEntry>,
    plan: FeaturePlan,
}

/// Runs durable deduction transactions
pub struct DeductionRunner {
    pool: PgPool,
    caches: Arc<RegionalCaches>,
    catalog: Arc<dyn FeatureCatalog>,
    hook: Option<Arc<dyn NotificationHook>>,
    price_resolver: Option<Arc<dyn OveragePriceResolver>>,
    config: DeductionConfig,
}

impl DeductionRunner {
    pub fn new(
        pool: PgPool,
        caches: Arc<RegionalCaches>,
        catalog: Arc<dyn FeatureCatalog>,
        hook: Option<Arc<dyn NotificationHook>>,
        config: DeductionConfig,
    ) -> Self {
        Self {
            pool,
            caches,
            catalog,
            hook,
            price_resolver: None,
            config,
        }
    }

    /// Attach a pricing collaborator; committed overage beyond the allowance
    /// is then resolved and reported as billable usage
    pub fn with_price_resolver(mut self, resolver: Arc<dyn OveragePriceResolver>) -> Self {
        self.price_resolver = Some(resolver);
        self
    }

    /// Execute one deduction request end to end
    #[instrument(skip(self, request), fields(
        customer_id = %request.customer_id,
        org_id = %request.org_id,
        features = request.deductions.len(),
    ))]
    pub async fn run(&self, request: DeductionRequest) -> EngineResult<DurableOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| EngineError::Transaction(format!("Failed to begin: {}", e)))?;

        let lock_key = lock::scope_lock_key(
            &request.org_id,
            request.env,
            &request.customer_id,
            request.entity_id.as_deref(),
        );
        lock::acquire_scope_lock(&mut tx, lock_key, self.config.lock_timeout_ms).await?;

        let mut full = match request.prefetched {
            Some(prefetched) => *prefetched,
            None => {
                customer_repo::get_full_customer(
                    &mut tx,
                    &request.customer_id,
                    &request.org_id,
                    request.env,
                    request.entity_id.as_deref(),
                    &[ProductStatus::Active, ProductStatus::PastDue],
                )
                .await?
            }
        };

        let entity_id = request.entity_id.as_deref();
        let mut planned = Vec::with_capacity(request.deductions.len());

        for deduction in &request.deductions {
            // set-to targets one feature's own entitlements; decrements
            // also drain the credit systems covering the feature
            let related = match deduction.amount {
                DeductionAmount::SetTo(_) => vec![(deduction.feature.clone(), Decimal::ONE)],
                DeductionAmount::Decrement(_) => {
                    self.catalog.related_features(&deduction.feature.id).await?
                }
            };
            let internal_ids: Vec<_> = related.iter().map(|(f, _)| f.internal_id).collect();

            let mut ents = full
                .entitlements_for_features(&internal_ids, self.config.reverse_deduction_order);
            ents.retain(|e| request.sort_params.permits(e.id));

            // the set-to target was computed against a cache snapshot of the
            // whole feature; applying it to a subset would misattribute the
            // newer entitlements' share, so one newer write stales all of it
            if let (DeductionAmount::SetTo(_), Some(snapshot_at)) =
                (deduction.amount, request.snapshot_at)
            {
                if set_to_is_stale(&ents, snapshot_at) {
                    debug!(
                        feature_id = %deduction.feature.id,
                        "Entitlement written after the snapshot; set-to skipped as stale"
                    );
                    continue;
                }
            }

            let entries: Vec<PlanEntry> = ents
                .iter()
                .map(|e| {
                    let multiplier = related
                        .iter()
                        .find(|(f, _)| f.internal_id == e.internal_feature_id)
                        .map(|(_, cost)| *cost)
                        .unwrap_or(Decimal::ONE);
                    PlanEntry {
                        snapshot: e.snapshot(),
                        multiplier,
                    }
                })
                .collect();

            let plan = plan_feature_deduction(
                &deduction.feature.id,
                &entries,
                deduction.amount,
                request.behavior,
                entity_id,
            )?;
            // later deductions in the batch must see this one's drains, so
            // the same entitlement cannot hand out the same balance twice
            fold_plan(&mut full, &plan);

            planned.push(PlannedFeature {
                feature: deduction.feature.clone(),
                entries,
                plan,
            });
        }

        // Record the event first: a repeated idempotency key means this
        // exact call already happened, so nothing else may be written
        if let Some(event) = &request.event {
            let mut event = event.clone();
            event.internal_customer_id = Some(full.customer.internal_id);
            let inserted = event_repo::insert_in_tx(&mut tx, &event).await?;
            if !inserted {
                tx.rollback()
                    .await
                    .map_err(|e| EngineError::Transaction(format!("Rollback failed: {}", e)))?;
                info!(
                    idempotency_key = ?event.idempotency_key,
                    "Duplicate idempotency key; deduction skipped"
                );
                let balances = planned
                    .iter()
                    .map(|p| project_balance(&p.feature.id, &p.entries, None, entity_id))
                    .collect();
                return Ok(DurableOutcome {
                    balances,
                    deduplicated: true,
                });
            }
        }

        for feature in &planned {
            for update in &feature.plan.updates {
                customer_repo::update_entitlement_balance(
                    &mut tx,
                    update.entitlement_id,
                    update.balance,
                    update.entity_balances.as_ref(),
                )
                .await?;
                for rollover in &update.rollover_updates {
                    customer_repo::update_rollover_balance(
                        &mut tx,
                        rollover.rollover_id,
                        rollover.balance,
                    )
                    .await?;
                }
            }
        }

        if let Some(reset) = request.set_next_reset {
            for entitlement_id in &request.sort_params.entitlement_ids {
                customer_repo::set_next_reset(&mut tx, *entitlement_id, reset).await?;
            }
        }

        // Hook failures roll the transaction back; the notification and the
        // balance change land together or not at all
        if let Some(hook) = &self.hook {
            for feature in &planned {
                for crossing in &feature.plan.threshold_crossings {
                    hook.on_threshold_reached(
                        &feature.feature.id,
                        &crossing.before,
                        crossing.after_balance,
                    )
                    .await?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| EngineError::Transaction(format!("Commit failed: {}", e)))?;

        if request.refresh_cache {
            self.invalidate(&request.org_id, request.env, &request.customer_id, entity_id)
                .await;
        }

        self.report_billable_overage(&full, &planned).await;

        let balances = planned
            .iter()
            .map(|p| project_balance(&p.feature.id, &p.entries, Some(&p.plan), entity_id))
            .collect();
        Ok(DurableOutcome {
            balances,
            deduplicated: false,
        })
    }

    /// Resolve and report overage incurred by this call on usage-allowed
    /// entitlements
    ///
    /// Runs after commit and never fails the deduction; invoicing consumes
    /// the report downstream.
    async fn report_billable_overage(&self, full: &FullCustomer, planned: &[PlannedFeature]) {
        let resolver = match &self.price_resolver {
            Some(resolver) => resolver,
            None => return,
        };

        for feature in planned {
            for (product_uuid, overage) in billable_overage(&feature.entries, &feature.plan) {
                let product = full
                    .customer_products
                    .iter()
                    .find(|p| p.id == product_uuid);
                let product = match product {
                    Some(product) => product,
                    None => continue,
                };
                match resolver
                    .price_for_feature(&feature.feature, &product.product_id)
                    .await
                {
                    Ok(Some(price)) => {
                        info!(
                            feature_id = %feature.feature.id,
                            product_id = %product.product_id,
                            overage = %overage,
                            overage_rate = %price.overage_rate,
                            billing_units = %price.billing_units,
                            "Billable overage incurred"
                        );
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            feature_id = %feature.feature.id,
                            error = %e,
                            "Overage price resolution failed after commit"
                        );
                    }
                }
            }
        }
    }

    /// Drop the scope's cache entries; the next read repopulates them
    ///
    /// Best effort: the deduction is already committed, a cache fault here
    /// only delays convergence until the next sync or expiry.
    async fn invalidate(
        &self,
        org_id: &str,
        env: AppEnv,
        customer_id: &str,
        entity_id: Option<&str>,
    ) {
        let cache = self.caches.home();
        if let Err(e) = invalidate_scope(cache, org_id, env, customer_id, None).await {
            warn!(error = %e, "Customer cache invalidation failed after commit");
        }
        if entity_id.is_some() {
            if let Err(e) = invalidate_scope(cache, org_id, env, customer_id, entity_id).await {
                warn!(error = %e, "Entity cache invalidation failed after commit");
            }
        }
    }
}

/// Whether a snapshot-derived set-to may no longer be applied
///
/// True when any targeted entitlement was written after the snapshot was
/// taken, or when nothing remains to target.
fn set_to_is_stale(
    ents: &[&tally_core::models::CustomerEntitlement],
    snapshot_at: DateTime<Utc>,
) -> bool {
    ents.is_empty() || ents.iter().any(|e| e.updated_at > snapshot_at)
}

/// Apply a feature plan's staged writes to the in-memory customer
///
/// The next deduction in the batch plans against the folded state, matching
/// what the database will hold once every plan in the batch is applied.
fn fold_plan(full: &mut FullCustomer, plan: &FeaturePlan) {
    for update in &plan.updates {
        if let Some(ent) = full.find_entitlement_mut(update.entitlement_id) {
            ent.balance = update.balance;
            if update.entity_balances.is_some() {
                ent.entity_balances = update.entity_balances.clone();
            }
            for rollover in &update.rollover_updates {
                if let Some(r) = ent.rollovers.iter_mut().find(|r| r.id == rollover.rollover_id)
                {
                    r.balance = rollover.balance;
                }
            }
        }
    }
}

/// Overage newly incurred by a plan, grouped by owning product
///
/// Only the growth of a negative balance counts; overage carried from
/// before this call was billed when it was incurred.
fn billable_overage(entries: &[PlanEntry], plan: &FeaturePlan) -> Vec<(Uuid, Decimal)> {
    let mut by_product: Vec<(Uuid, Decimal)> = Vec::new();

    for entry in entries {
        let snap = &entry.snapshot;
        let update = plan.updates.iter().find(|u| u.entitlement_id == snap.id);
        let after = match update {
            Some(u) => u.balance,
            None => continue,
        };

        let before_overage = (-snap.balance).max(Decimal::ZERO);
        let after_overage = (-after).max(Decimal::ZERO);
        let incurred = after_overage - before_overage;
        if incurred <= Decimal::ZERO {
            continue;
        }

        match by_product
            .iter_mut()
            .find(|(id, _)| *id == snap.customer_product_id)
        {
            Some((_, total)) => *total += incurred,
            None => by_product.push((snap.customer_product_id, incurred)),
        }
    }

    by_product
}

/// Project a feature's durable balance after (or without) a plan
fn project_balance(
    feature_id: &str,
    entries: &[PlanEntry],
    plan: Option<&FeaturePlan>,
    entity_id: Option<&str>,
) -> ApiBalance {
    let mut current = Decimal::ZERO;
    let mut granted = Decimal::ZERO;
    let mut breakdown = Vec::with_capacity(entries.len());

    for entry in entries {
        let snap = &entry.snapshot;
        let update = plan.and_then(|p| {
            p.updates
                .iter()
                .find(|u| u.entitlement_id == snap.id)
        });

        let balance = match update {
            Some(u) => {
                let scope = match (entity_id, &u.entity_balances) {
                    (Some(id), Some(slices)) => {
                        slices.get(id).copied().unwrap_or(Decimal::ZERO)
                    }
                    _ => u.balance,
                };
                let rollovers: Decimal = snap
                    .rollovers
                    .iter()
                    .map(|r| {
                        u.rollover_updates
                            .iter()
                            .find(|ru| ru.rollover_id == r.id)
                            .map(|ru| ru.balance)
                            .unwrap_or(r.balance)
                    })
                    .sum();
                scope + rollovers
            }
            None => snap.available(entity_id),
        };

        current += balance;
        granted += snap.allowance;
        breakdown.push(ApiBalanceBreakdown {
            entitlement_id: snap.id,
            balance,
            granted: snap.allowance,
        });
    }

    ApiBalance {
        feature_id: feature_id.to_string(),
        current_balance: current,
        purchased_balance: Decimal::ZERO,
        prepaid_quantity: Decimal::ZERO,
        granted_balance: granted,
        usage: granted - current,
        breakdown,
    }
}
