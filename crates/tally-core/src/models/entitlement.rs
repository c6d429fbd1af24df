//! Customer entitlement models
//!
//! A `CustomerEntitlement` is the mutable unit of balance for one
//! (product, feature) pair. Its balance is only ever mutated by the durable
//! deduction transaction or the batching manager's atomic cache commit;
//! every other consumer works on an [`EntitlementSnapshot`].

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Policy for deductions that exceed the available balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverageBehavior {
    /// Abort the whole batch with insufficient_balance
    Reject,
    /// Floor at the minimum balance; excess is dropped
    #[default]
    Cap,
    /// Permit any resulting balance; reconciliation and admin corrections only
    Allow,
}

impl fmt::Display for OverageBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverageBehavior::Reject => write!(f, "reject"),
            OverageBehavior::Cap => write!(f, "cap"),
            OverageBehavior::Allow => write!(f, "allow"),
        }
    }
}

impl OverageBehavior {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "reject" => Some(OverageBehavior::Reject),
            "cap" => Some(OverageBehavior::Cap),
            "allow" => Some(OverageBehavior::Allow),
            _ => None,
        }
    }
}

/// Unused balance carried over from a prior period
///
/// Rollovers drain before the base allowance and typically expire before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverBalance {
    pub id: Uuid,

    /// Remaining rolled-over amount
    pub balance: Decimal,

    /// Expiry; `None` never expires and drains last among rollovers
    pub expires_at: Option<DateTime<Utc>>,
}

/// The mutable balance record for one (product, feature) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerEntitlement {
    pub id: Uuid,

    /// Owning product instance
    pub customer_product_id: Uuid,

    /// Feature this entitlement grants (internal id)
    pub internal_feature_id: Uuid,

    /// Feature this entitlement grants (external id)
    pub feature_id: String,

    /// Current balance
    pub balance: Decimal,

    /// Granted allowance for the current period
    pub allowance: Decimal,

    /// Unlimited grants never deduct
    pub unlimited: bool,

    /// Whether consumption beyond the allowance is permitted (usage-based)
    pub usage_allowed: bool,

    /// Cap on overage when usage is allowed; balance floor is `-max_overage`
    pub max_overage: Option<Decimal>,

    /// Per-entity balance slices for continuous-use features
    ///
    /// When present, the slice values must sum to `balance` at rest.
    pub entity_balances: Option<BTreeMap<String, Decimal>>,

    /// Rollover balances, in no particular order; drain order is decided at
    /// plan time (oldest expiry first)
    pub rollovers: Vec<RolloverBalance>,

    /// Next scheduled balance refill
    pub next_reset_at: Option<DateTime<Utc>>,

    /// Deduction priority; lower drains first unless the org reverses it
    pub priority: i32,

    /// Balance threshold for the notification hook, crossed downward
    pub threshold: Option<Decimal>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CustomerEntitlement {
    /// Balance for the requested scope: the entity slice when this
    /// entitlement tracks per-entity balances and an entity is given,
    /// otherwise the aggregate
    pub fn scope_balance(&self, entity_id: Option<&str>) -> Decimal {
        match (entity_id, &self.entity_balances) {
            (Some(id), Some(slices)) => slices.get(id).copied().unwrap_or(Decimal::ZERO),
            _ => self.balance,
        }
    }

    /// Total rollover balance still available
    pub fn rollover_total(&self) -> Decimal {
        self.rollovers.iter().map(|r| r.balance).sum()
    }

    /// Whether per-entity slices sum to the aggregate balance
    ///
    /// Holds at rest for every entitlement with per-entity tracking; a
    /// violation means a slice was mutated outside the deduction paths.
    pub fn entity_balances_consistent(&self) -> bool {
        match &self.entity_balances {
            Some(slices) => slices.values().copied().sum::<Decimal>() == self.balance,
            None => true,
        }
    }

    /// Immutable snapshot for planning and threshold comparison
    pub fn snapshot(&self) -> EntitlementSnapshot {
        let mut rollovers = self.rollovers.clone();
        rollovers.sort_by(|a, b| match (a.expires_at, b.expires_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        EntitlementSnapshot {
            id: self.id,
            customer_product_id: self.customer_product_id,
            internal_feature_id: self.internal_feature_id,
            feature_id: self.feature_id.clone(),
            balance: self.balance,
            allowance: self.allowance,
            unlimited: self.unlimited,
            usage_allowed: self.usage_allowed,
            max_overage: self.max_overage,
            entity_balances: self.entity_balances.clone(),
            rollovers,
            priority: self.priority,
            threshold: self.threshold,
            updated_at: self.updated_at,
        }
    }

    #[cfg(any(test, feature = "test-fixtures"))]
    pub fn test_fixture(internal_feature_id: Uuid, balance: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_product_id: Uuid::new_v4(),
            internal_feature_id,
            feature_id: "feature".to_string(),
            balance,
            allowance: balance,
            unlimited: false,
            usage_allowed: false,
            max_overage: None,
            entity_balances: None,
            rollovers: Vec::new(),
            next_reset_at: None,
            priority: 0,
            threshold: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

/// Immutable pre-mutation view of an entitlement
///
/// Taken once at the top of a deduction plan; the planner never touches the
/// live record, so a failed plan leaves nothing half-applied. Rollovers are
/// pre-sorted oldest expiry first, which is the drain order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub id: Uuid,
    pub customer_product_id: Uuid,
    pub internal_feature_id: Uuid,
    pub feature_id: String,
    pub balance: Decimal,
    pub allowance: Decimal,
    pub unlimited: bool,
    pub usage_allowed: bool,
    pub max_overage: Option<Decimal>,
    pub entity_balances: Option<BTreeMap<String, Decimal>>,
    pub rollovers: Vec<RolloverBalance>,
    pub priority: i32,
    pub threshold: Option<Decimal>,
    pub updated_at: DateTime<Utc>,
}

impl EntitlementSnapshot {
    /// Balance for the requested scope (see
    /// [`CustomerEntitlement::scope_balance`])
    pub fn scope_balance(&self, entity_id: Option<&str>) -> Decimal {
        match (entity_id, &self.entity_balances) {
            (Some(id), Some(slices)) => slices.get(id).copied().unwrap_or(Decimal::ZERO),
            _ => self.balance,
        }
    }

    /// Total rollover balance still available
    pub fn rollover_total(&self) -> Decimal {
        self.rollovers.iter().map(|r| r.balance).sum()
    }

    /// Everything drainable before overage: rollovers plus current balance
    pub fn available(&self, entity_id: Option<&str>) -> Decimal {
        self.rollover_total() + self.scope_balance(entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_sorts_rollovers_oldest_expiry_first() {
        let now = Utc::now();
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(10));
        ent.rollovers = vec![
            RolloverBalance {
                id: Uuid::new_v4(),
                balance: dec!(1),
                expires_at: None,
            },
            RolloverBalance {
                id: Uuid::new_v4(),
                balance: dec!(2),
                expires_at: Some(now + Duration::days(30)),
            },
            RolloverBalance {
                id: Uuid::new_v4(),
                balance: dec!(3),
                expires_at: Some(now + Duration::days(7)),
            },
        ];

        let snap = ent.snapshot();
        let balances: Vec<Decimal> = snap.rollovers.iter().map(|r| r.balance).collect();
        assert_eq!(balances, vec![dec!(3), dec!(2), dec!(1)]);
    }

    #[test]
    fn test_scope_balance() {
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(10));
        assert_eq!(ent.scope_balance(Some("seat_1")), dec!(10));

        let mut slices = BTreeMap::new();
        slices.insert("seat_1".to_string(), dec!(4));
        slices.insert("seat_2".to_string(), dec!(6));
        ent.entity_balances = Some(slices);

        assert_eq!(ent.scope_balance(Some("seat_1")), dec!(4));
        assert_eq!(ent.scope_balance(Some("seat_3")), dec!(0));
        assert_eq!(ent.scope_balance(None), dec!(10));
        assert!(ent.entity_balances_consistent());

        ent.balance = dec!(11);
        assert!(!ent.entity_balances_consistent());
    }

    #[test]
    fn test_overage_behavior_roundtrip() {
        for b in [
            OverageBehavior::Reject,
            OverageBehavior::Cap,
            OverageBehavior::Allow,
        ] {
            assert_eq!(OverageBehavior::from_str(&b.to_string()), Some(b));
        }
    }
}
