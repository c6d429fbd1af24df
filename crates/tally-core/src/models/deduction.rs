//! Deduction instructions, usage events, and sync work items

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::customer::{AppEnv, FullCustomer};
use super::feature::Feature;

/// The two deduction modes
///
/// `Decrement` is the track path's relative deduction. `SetTo` is the
/// absolute form used by reconciliation and admin corrections: the delta is
/// computed against the current scope balance inside the durable transaction,
/// then follows the identical drain order, so both modes share one code path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "amount", rename_all = "snake_case")]
pub enum DeductionAmount {
    Decrement(Decimal),
    SetTo(Decimal),
}

/// An in-flight deduction instruction for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDeduction {
    pub feature: Feature,
    pub amount: DeductionAmount,
}

impl FeatureDeduction {
    pub fn decrement(feature: Feature, amount: Decimal) -> Self {
        Self {
            feature,
            amount: DeductionAmount::Decrement(amount),
        }
    }

    pub fn set_to(feature: Feature, target: Decimal) -> Self {
        Self {
            feature,
            amount: DeductionAmount::SetTo(target),
        }
    }
}

/// Restriction of a deduction to specific entitlements
///
/// Used by partial-scope syncs and admin corrections. Empty means no
/// restriction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortParams {
    pub entitlement_ids: Vec<Uuid>,
}

impl SortParams {
    pub fn only(entitlement_id: Uuid) -> Self {
        Self {
            entitlement_ids: vec![entitlement_id],
        }
    }

    pub fn is_restricted(&self) -> bool {
        !self.entitlement_ids.is_empty()
    }

    pub fn permits(&self, entitlement_id: Uuid) -> bool {
        self.entitlement_ids.is_empty() || self.entitlement_ids.contains(&entitlement_id)
    }
}

/// Caller-supplied usage event metadata for a track call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    pub event_name: String,

    pub value: Decimal,

    /// Deduplication key; a repeated key records exactly one event
    pub idempotency_key: Option<String>,

    pub timestamp: DateTime<Utc>,
}

/// A recorded usage event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub org_id: String,
    pub env: AppEnv,

    /// Filled on the durable path; the cache fast path records events
    /// without a durable read, so only the external id is known there
    pub internal_customer_id: Option<Uuid>,

    pub customer_id: String,
    pub entity_id: Option<String>,
    pub feature_id: String,
    pub event_name: String,
    pub value: Decimal,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    /// Build an event row from track-call metadata
    pub fn from_info(
        info: &EventInfo,
        org_id: &str,
        env: AppEnv,
        internal_customer_id: Option<Uuid>,
        customer_id: &str,
        entity_id: Option<&str>,
        feature_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: org_id.to_string(),
            env,
            internal_customer_id,
            customer_id: customer_id.to_string(),
            entity_id: entity_id.map(str::to_string),
            feature_id: feature_id.to_string(),
            event_name: info.event_name.clone(),
            value: info.value,
            idempotency_key: info.idempotency_key.clone(),
            created_at: info.timestamp,
        }
    }
}

/// Queued reconciliation work for one (customer, feature, entity) scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItem {
    pub customer_id: String,
    pub feature_id: String,
    pub org_id: String,
    pub env: AppEnv,
    pub entity_id: Option<String>,

    /// Region whose cache snapshot must be read; regional caches may diverge
    pub region: String,

    /// Cache schema version the snapshot was written under
    pub cache_version: u32,

    /// When the cache state this item describes was observed; the durable
    /// transaction skips entitlements written after this instant
    pub snapshot_at: DateTime<Utc>,

    /// Restrict to specific entitlements (partial-scope sync)
    #[serde(default)]
    pub sort_params: SortParams,

    /// Pre-fetched customer to avoid a refetch, when the enqueuer has one
    #[serde(skip)]
    pub prefetched: Option<Box<FullCustomer>>,
}

impl SyncItem {
    /// Identity of the scope this item reconciles; used for in-window
    /// deduplication
    pub fn dedup_key(&self) -> (String, String, String, AppEnv, Option<String>, String) {
        (
            self.org_id.clone(),
            self.customer_id.clone(),
            self.feature_id.clone(),
            self.env,
            self.entity_id.clone(),
            self.region.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_deduction_modes_are_distinct() {
        let f = Feature::metered("messages");
        let dec = FeatureDeduction::decrement(f.clone(), dec!(5));
        let set = FeatureDeduction::set_to(f, dec!(5));
        assert_ne!(dec.amount, set.amount);

        match dec.amount {
            DeductionAmount::Decrement(v) => assert_eq!(v, dec!(5)),
            DeductionAmount::SetTo(_) => panic!("wrong mode"),
        }
    }

    #[test]
    fn test_sort_params() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();

        let unrestricted = SortParams::default();
        assert!(!unrestricted.is_restricted());
        assert!(unrestricted.permits(id));

        let restricted = SortParams::only(id);
        assert!(restricted.is_restricted());
        assert!(restricted.permits(id));
        assert!(!restricted.permits(other));
    }

    #[test]
    fn test_sync_item_dedup_key_ignores_snapshot_time() {
        let mk = |at: DateTime<Utc>| SyncItem {
            customer_id: "cus_1".to_string(),
            feature_id: "messages".to_string(),
            org_id: "org_1".to_string(),
            env: AppEnv::Live,
            entity_id: None,
            region: "us-east".to_string(),
            cache_version: 2,
            snapshot_at: at,
            sort_params: SortParams::default(),
            prefetched: None,
        };

        let a = mk(Utc::now());
        let b = mk(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
