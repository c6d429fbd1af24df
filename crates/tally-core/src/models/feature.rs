//! Feature and pricing models
//!
//! Features are catalog-owned; the engine only consumes them through the
//! `FeatureCatalog` collaborator. A feature is either single-use (metered
//! events, e.g. messages) or continuous-use (held allocations, e.g. seats).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// How consumption of a feature behaves over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureUsageType {
    /// Consumed per event; usage only ever grows within a period
    #[default]
    Single,
    /// Held while in use (seats, workspaces); can be released
    Continuous,
}

impl fmt::Display for FeatureUsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureUsageType::Single => write!(f, "single"),
            FeatureUsageType::Continuous => write!(f, "continuous"),
        }
    }
}

/// Cost of one unit of a metered feature in a credit system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditCost {
    /// The metered feature this cost applies to
    pub metered_feature_id: String,

    /// Credits charged per unit of the metered feature
    pub credits_per_unit: Decimal,
}

/// A feature as resolved from the catalog collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    /// External feature identifier (e.g. "messages")
    pub id: String,

    /// Internal surrogate identifier
    pub internal_id: Uuid,

    /// Usage behavior
    pub usage_type: FeatureUsageType,

    /// Non-empty when this feature is a credit system that other metered
    /// features draw from
    pub credit_schema: Vec<CreditCost>,
}

impl Feature {
    /// Create a plain metered feature with no credit schema
    pub fn metered(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            internal_id: Uuid::new_v4(),
            usage_type: FeatureUsageType::Single,
            credit_schema: Vec::new(),
        }
    }

    /// Whether this feature is a credit system
    pub fn is_credit_system(&self) -> bool {
        !self.credit_schema.is_empty()
    }

    /// Credits charged per unit of `metered_feature_id`, if this credit
    /// system covers it
    pub fn credit_cost_for(&self, metered_feature_id: &str) -> Option<Decimal> {
        self.credit_schema
            .iter()
            .find(|c| c.metered_feature_id == metered_feature_id)
            .map(|c| c.credits_per_unit)
    }
}

/// Usage-based overage pricing resolved for one (feature, product) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsagePriceConfig {
    /// Price per billing unit of overage
    pub overage_rate: Decimal,

    /// Units billed together (e.g. per 1000 messages)
    pub billing_units: Decimal,
}
