//! Collaborator and storage seams
//!
//! The engine consumes catalog, pricing, and notification concerns through
//! narrow traits; the cache tier is consumed through `CacheStore` so tests
//! can substitute an in-memory implementation.

use crate::error::EngineError;
use crate::models::{EntitlementSnapshot, Feature, UsagePriceConfig};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Feature/entitlement catalog lookup (external collaborator)
#[async_trait]
pub trait FeatureCatalog: Send + Sync {
    /// Resolve a feature by its external id
    async fn resolve_feature(&self, feature_id: &str) -> Result<Feature, EngineError>;

    /// The feature itself plus every credit system that draws from it, each
    /// with the credit cost per unit of the original feature
    ///
    /// The original feature is always first with cost 1.
    async fn related_features(
        &self,
        feature_id: &str,
    ) -> Result<Vec<(Feature, Decimal)>, EngineError>;
}

/// Notification hook fired when an entitlement balance crosses its
/// configured threshold downward (external collaborator)
#[async_trait]
pub trait NotificationHook: Send + Sync {
    async fn on_threshold_reached(
        &self,
        feature_id: &str,
        before: &EntitlementSnapshot,
        after_balance: Decimal,
    ) -> Result<(), EngineError>;
}

/// Usage-based overage pricing resolution (external collaborator)
#[async_trait]
pub trait OveragePriceResolver: Send + Sync {
    /// The overage price for a feature on an attached product, if usage
    /// beyond the allowance is billable
    async fn price_for_feature(
        &self,
        feature: &Feature,
        product_id: &str,
    ) -> Result<Option<UsagePriceConfig>, EngineError>;
}

/// Cache tier operations consumed by invalidation and reconciliation
///
/// Every operation is fallible and fast-failing: callers on the hot path
/// treat any error as a cache-tier fault and fall back to the durable store,
/// never retrying in a loop.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Delete a key; true if it existed
    async fn delete(&self, key: &str) -> Result<bool, EngineError>;

    /// Check existence
    async fn exists(&self, key: &str) -> Result<bool, EngineError>;

    /// All fields of a hash key; empty when the key is absent
    async fn hget_all(&self, key: &str) -> Result<Vec<(String, String)>, EngineError>;

    /// Set hash fields and refresh the key TTL in one pipeline
    async fn hset_with_ttl(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_secs: u64,
    ) -> Result<(), EngineError>;
}
