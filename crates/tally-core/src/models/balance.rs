//! Balance projections and cache-resident balance encoding
//!
//! Cache entries store balances as micro-unit integers (six fractional
//! digits) so the atomic batch script only ever does integer arithmetic and
//! reconciliation converts back to `Decimal` losslessly. Six digits covers
//! every balance the durable store holds; amounts with finer precision are
//! rejected rather than rounded.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::EngineResult;

/// Scale factor between `Decimal` balances and cached micro-units
pub const MICRO_PER_UNIT: i64 = 1_000_000;

/// Convert a decimal balance to cached micro-units
///
/// Errors on more than six fractional digits or magnitudes that do not fit
/// an i64.
pub fn to_micros(value: Decimal) -> EngineResult<i64> {
    let scaled = value * Decimal::from(MICRO_PER_UNIT);
    if scaled != scaled.trunc() {
        return Err(EngineError::InvalidDeduction(format!(
            "amount {} exceeds 6 decimal places",
            value
        )));
    }
    scaled.trunc().to_i64().ok_or_else(|| {
        EngineError::InvalidDeduction(format!("amount {} out of cacheable range", value))
    })
}

/// Convert cached micro-units back to a decimal balance
pub fn from_micros(micros: i64) -> Decimal {
    Decimal::new(micros, 6).normalize()
}

/// Contribution of one entitlement to a merged balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiBalanceBreakdown {
    pub entitlement_id: Uuid,
    pub balance: Decimal,
    pub granted: Decimal,
}

/// Externally visible balance projection for one feature and scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiBalance {
    pub feature_id: String,

    /// Remaining balance across contributing entitlements
    pub current_balance: Decimal,

    /// Balance purchased beyond the granted allowance (prepaid packs)
    pub purchased_balance: Decimal,

    /// Prepaid quantity included with the product
    pub prepaid_quantity: Decimal,

    /// Granted allowance across contributing entitlements
    pub granted_balance: Decimal,

    /// Usage recorded this period
    pub usage: Decimal,

    /// Per-entitlement contributions; empty when the caller asked for the
    /// merged view only
    pub breakdown: Vec<ApiBalanceBreakdown>,
}

impl ApiBalance {
    /// The absolute durable-store balance this projection corresponds to
    ///
    /// This is the reconciliation formula: the durable balance excludes
    /// purchased packs and includes the prepaid quantity.
    pub fn backend_balance(&self) -> Decimal {
        self.prepaid_quantity + self.current_balance - self.purchased_balance
    }
}

/// Breakdown entry as stored in a cache hash field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBreakdown {
    pub entitlement_id: Uuid,
    pub balance_micros: i64,
    pub granted_micros: i64,
}

/// Cache-resident balance state for one feature within one scope key
///
/// This is the *raw, unmerged* per-scope state: the reconciler reads exactly
/// this, never the merged projection served to API callers, so a sync can
/// never double-apply balance that was merged in from another scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBalance {
    pub current_micros: i64,
    pub purchased_micros: i64,
    pub prepaid_micros: i64,
    pub granted_micros: i64,
    pub usage_micros: i64,

    /// Balance floor enforced by the batch script, in micro-units; `None`
    /// means unbounded (usage-priced with no overage cap)
    pub min_micros: Option<i64>,

    /// Features whose pricing requires ledger-exact accounting bypass the
    /// cache path entirely
    pub requires_durable: bool,

    pub breakdown: Vec<CachedBreakdown>,
}

impl CachedBalance {
    /// Project to the API balance shape in decimals
    pub fn to_api(&self, feature_id: &str) -> ApiBalance {
        ApiBalance {
            feature_id: feature_id.to_string(),
            current_balance: from_micros(self.current_micros),
            purchased_balance: from_micros(self.purchased_micros),
            prepaid_quantity: from_micros(self.prepaid_micros),
            granted_balance: from_micros(self.granted_micros),
            usage: from_micros(self.usage_micros),
            breakdown: self
                .breakdown
                .iter()
                .map(|b| ApiBalanceBreakdown {
                    entitlement_id: b.entitlement_id,
                    balance: from_micros(b.balance_micros),
                    granted: from_micros(b.granted_micros),
                })
                .collect(),
        }
    }

    /// Breakdown entries restricted to `entitlement_ids`; `None` when no
    /// entry matches (partial-scope sync must skip, not zero)
    pub fn restricted_breakdown(&self, entitlement_ids: &[Uuid]) -> Option<Vec<&CachedBreakdown>> {
        if entitlement_ids.is_empty() {
            return Some(self.breakdown.iter().collect());
        }
        let matched: Vec<&CachedBreakdown> = self
            .breakdown
            .iter()
            .filter(|b| entitlement_ids.contains(&b.entitlement_id))
            .collect();
        if matched.is_empty() {
            None
        } else {
            Some(matched)
        }
    }
}
