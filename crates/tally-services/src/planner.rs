//! Pure deduction planner
//!
//! Given immutable entitlement snapshots in drain order, the planner turns
//! one feature deduction into a set of balance writes. It never touches
//! storage, so the durable transaction can validate a whole plan and apply
//! it only once every feature in the batch planned cleanly.
//!
//! Drain order within one entitlement: rollovers (oldest expiry first), then
//! the period balance down to the policy floor. Across entitlements the
//! caller's snapshot order decides, which is priority ascending unless the
//! org reverses it.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tally_core::models::{DeductionAmount, EntitlementSnapshot, OverageBehavior};
use tally_core::{EngineError, EngineResult};
use uuid::Uuid;

/// One entitlement eligible for a deduction, with its unit cost
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub snapshot: EntitlementSnapshot,

    /// Balance units charged per unit of the requested feature: 1 for the
    /// feature's own entitlements, the credit cost for credit systems
    pub multiplier: Decimal,
}

impl PlanEntry {
    pub fn direct(snapshot: EntitlementSnapshot) -> Self {
        Self {
            snapshot,
            multiplier: Decimal::ONE,
        }
    }
}

/// New balance for one rollover record
#[derive(Debug, Clone, PartialEq)]
pub struct RolloverUpdate {
    pub rollover_id: Uuid,
    pub balance: Decimal,
}

/// Planned write for one entitlement
#[derive(Debug, Clone)]
pub struct EntitlementUpdate {
    pub entitlement_id: Uuid,

    /// New aggregate balance
    pub balance: Decimal,

    /// New per-entity slices, when the entitlement tracks them
    pub entity_balances: Option<BTreeMap<String, Decimal>>,

    pub rollover_updates: Vec<RolloverUpdate>,

    /// Amount drained from this entitlement in its own balance units,
    /// rollovers included; negative for credits
    pub deducted: Decimal,
}

/// A balance threshold crossed downward by a planned write
#[derive(Debug, Clone)]
pub struct ThresholdCrossing {
    pub entitlement_id: Uuid,
    pub before: EntitlementSnapshot,
    pub after_balance: Decimal,
}

/// The full plan for one feature deduction
#[derive(Debug, Clone)]
pub struct FeaturePlan {
    pub updates: Vec<EntitlementUpdate>,

    /// Amount asked for, in feature units; the delta for set-to requests
    pub requested: Decimal,

    /// Amount actually drained, in feature units; less than `requested`
    /// when the cap policy dropped the excess
    pub deducted: Decimal,

    pub threshold_crossings: Vec<ThresholdCrossing>,
}

impl FeaturePlan {
    fn noop(requested: Decimal) -> Self {
        Self {
            updates: Vec::new(),
            requested,
            deducted: Decimal::ZERO,
            threshold_crossings: Vec::new(),
        }
    }
}

/// Lowest balance an entitlement may reach under the policy; `None` is
/// unbounded
fn floor_of(snapshot: &EntitlementSnapshot, behavior: OverageBehavior) -> Option<Decimal> {
    match behavior {
        OverageBehavior::Allow => None,
        _ if snapshot.usage_allowed => snapshot.max_overage.map(|m| -m),
        _ => Some(Decimal::ZERO),
    }
}

/// Plan one feature deduction across the given entries
///
/// `entries` must already be filtered to permitted entitlements and sorted
/// in drain order. Set-to requests require every multiplier to be 1 because
/// the target is expressed in the feature's own balance units.
pub fn plan_feature_deduction(
    feature_id: &str,
    entries: &[PlanEntry],
    amount: DeductionAmount,
    behavior: OverageBehavior,
    entity_id: Option<&str>,
) -> EngineResult<FeaturePlan> {
    if entries.is_empty() {
        return Err(EngineError::EntitlementNotFound(feature_id.to_string()));
    }
    if entries.iter().any(|e| e.multiplier <= Decimal::ZERO) {
        return Err(EngineError::InvalidDeduction(format!(
            "non-positive credit cost for feature {}",
            feature_id
        )));
    }

    // Unlimited grants never deduct; the whole request is satisfied as-is
    if entries.iter().any(|e| e.snapshot.unlimited) {
        let requested = match amount {
            DeductionAmount::Decrement(v) => v,
            DeductionAmount::SetTo(_) => Decimal::ZERO,
        };
        return Ok(FeaturePlan::noop(requested));
    }

    // entity slices must keep summing to the aggregate; a customer-scope
    // write has no slice to charge, so it cannot touch a sliced entitlement
    if entity_id.is_none() {
        if let Some(entry) = entries
            .iter()
            .find(|e| e.snapshot.entity_balances.is_some())
        {
            return Err(EngineError::InvalidDeduction(format!(
                "entitlement {} of feature {} tracks per-entity balances and \
                 requires an entity-scoped deduction",
                entry.snapshot.id, feature_id
            )));
        }
    }

    let delta = match amount {
        DeductionAmount::Decrement(v) => v,
        DeductionAmount::SetTo(target) => {
            if entries.iter().any(|e| e.multiplier != Decimal::ONE) {
                return Err(EngineError::InvalidDeduction(format!(
                    "set-to for feature {} cannot span credit systems",
                    feature_id
                )));
            }
            let current: Decimal = entries
                .iter()
                .map(|e| e.snapshot.available(entity_id))
                .sum();
            current - target
        }
    };

    if delta.is_zero() {
        return Ok(FeaturePlan::noop(Decimal::ZERO));
    }

    if delta < Decimal::ZERO {
        return Ok(plan_credit(entries, -delta, entity_id));
    }

    // Reject must see the whole batch fail before anything is staged
    if behavior == OverageBehavior::Reject {
        let mut capacity = Decimal::ZERO;
        let mut unbounded = false;
        for entry in entries {
            match floor_of(&entry.snapshot, behavior) {
                None => unbounded = true,
                Some(floor) => {
                    let headroom = entry.snapshot.rollover_total()
                        + entry.snapshot.scope_balance(entity_id)
                        - floor;
                    if headroom > Decimal::ZERO {
                        capacity += headroom / entry.multiplier;
                    }
                }
            }
        }
        if !unbounded && delta > capacity {
            return Err(EngineError::InsufficientBalance {
                feature_id: feature_id.to_string(),
                requested: delta.to_string(),
                available: capacity.to_string(),
            });
        }
    }

    let mut plan = FeaturePlan {
        updates: Vec::new(),
        requested: delta,
        deducted: Decimal::ZERO,
        threshold_crossings: Vec::new(),
    };

    let last = entries.len() - 1;
    let mut remaining = delta;

    for (idx, entry) in entries.iter().enumerate() {
        if remaining <= Decimal::ZERO {
            break;
        }
        let snap = &entry.snapshot;
        let mult = entry.multiplier;

        let mut rollover_updates = Vec::new();
        let mut drained_balance_units = Decimal::ZERO;

        // Rollovers arrive pre-sorted oldest expiry first
        for rollover in &snap.rollovers {
            if remaining <= Decimal::ZERO || rollover.balance <= Decimal::ZERO {
                continue;
            }
            let cost = remaining * mult;
            let (taken_units, taken_balance) = if cost <= rollover.balance {
                (remaining, cost)
            } else {
                (rollover.balance / mult, rollover.balance)
            };
            rollover_updates.push(RolloverUpdate {
                rollover_id: rollover.id,
                balance: rollover.balance - taken_balance,
            });
            drained_balance_units += taken_balance;
            remaining -= taken_units;
        }

        // Period balance down to the policy floor; the last entitlement
        // absorbs the remainder when the policy is unbounded
        let mut balance_delta = Decimal::ZERO;
        if remaining > Decimal::ZERO {
            let scope = snap.scope_balance(entity_id);
            let cost = remaining * mult;
            match floor_of(snap, behavior) {
                None => {
                    balance_delta = cost;
                    remaining = Decimal::ZERO;
                }
                Some(floor) => {
                    let headroom = (scope - floor).max(Decimal::ZERO);
                    if cost <= headroom {
                        balance_delta = cost;
                        remaining = Decimal::ZERO;
                    } else if idx == last && behavior == OverageBehavior::Allow {
                        balance_delta = cost;
                        remaining = Decimal::ZERO;
                    } else {
                        balance_delta = headroom;
                        remaining -= headroom / mult;
                    }
                }
            }
        }

        if drained_balance_units.is_zero() && balance_delta.is_zero() {
            continue;
        }

        let new_aggregate = snap.balance - balance_delta;
        let entity_balances = match (entity_id, &snap.entity_balances) {
            (Some(id), Some(slices)) => {
                let mut slices = slices.clone();
                let slice = slices.entry(id.to_string()).or_insert(Decimal::ZERO);
                *slice -= balance_delta;
                Some(slices)
            }
            _ => snap.entity_balances.clone(),
        };

        if let Some(threshold) = snap.threshold {
            if snap.balance > threshold && new_aggregate <= threshold {
                plan.threshold_crossings.push(ThresholdCrossing {
                    entitlement_id: snap.id,
                    before: snap.clone(),
                    after_balance: new_aggregate,
                });
            }
        }

        plan.updates.push(EntitlementUpdate {
            entitlement_id: snap.id,
            balance: new_aggregate,
            entity_balances,
            rollover_updates,
            deducted: drained_balance_units + balance_delta,
        });
    }

    // Cap drops whatever did not fit
    plan.deducted = delta - remaining.max(Decimal::ZERO);
    Ok(plan)
}

/// Credit the first entry (highest drain priority) with the excess
fn plan_credit(entries: &[PlanEntry], credit: Decimal, entity_id: Option<&str>) -> FeaturePlan {
    let snap = &entries[0].snapshot;
    let balance_delta = credit * entries[0].multiplier;
    let new_aggregate = snap.balance + balance_delta;

    let entity_balances = match (entity_id, &snap.entity_balances) {
        (Some(id), Some(slices)) => {
            let mut slices = slices.clone();
            let slice = slices.entry(id.to_string()).or_insert(Decimal::ZERO);
            *slice += balance_delta;
            Some(slices)
        }
        _ => snap.entity_balances.clone(),
    };

    FeaturePlan {
        updates: vec![EntitlementUpdate {
            entitlement_id: snap.id,
            balance: new_aggregate,
            entity_balances,
            rollover_updates: Vec::new(),
            deducted: -balance_delta,
        }],
        requested: -credit,
        deducted: -credit,
        threshold_crossings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use tally_core::models::{CustomerEntitlement, RolloverBalance};

    fn entry(balance: Decimal) -> PlanEntry {
        PlanEntry::direct(CustomerEntitlement::test_fixture(Uuid::new_v4(), balance).snapshot())
    }

    #[test]
    fn test_simple_decrement() {
        let plan = plan_feature_deduction(
            "messages",
            &[entry(dec!(100))],
            DeductionAmount::Decrement(dec!(60)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap();

        assert_eq!(plan.deducted, dec!(60));
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].balance, dec!(40));
    }

    #[test]
    fn test_rollovers_drain_before_allowance() {
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(10));
        let old = Uuid::new_v4();
        let new = Uuid::new_v4();
        ent.rollovers = vec![
            RolloverBalance {
                id: new,
                balance: dec!(5),
                expires_at: Some(Utc::now() + Duration::days(30)),
            },
            RolloverBalance {
                id: old,
                balance: dec!(3),
                expires_at: Some(Utc::now() + Duration::days(7)),
            },
        ];

        let plan = plan_feature_deduction(
            "messages",
            &[PlanEntry::direct(ent.snapshot())],
            DeductionAmount::Decrement(dec!(6)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap();

        let update = &plan.updates[0];
        // oldest expiry empties first, newer takes the rest, balance untouched
        assert_eq!(update.rollover_updates[0], RolloverUpdate { rollover_id: old, balance: dec!(0) });
        assert_eq!(update.rollover_updates[1], RolloverUpdate { rollover_id: new, balance: dec!(2) });
        assert_eq!(update.balance, dec!(10));
        assert_eq!(update.deducted, dec!(6));
    }

    #[test]
    fn test_drains_across_entitlements_in_order() {
        let first = entry(dec!(10));
        let second = entry(dec!(10));
        let first_id = first.snapshot.id;
        let second_id = second.snapshot.id;

        let plan = plan_feature_deduction(
            "messages",
            &[first, second],
            DeductionAmount::Decrement(dec!(15)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap();

        assert_eq!(plan.updates.len(), 2);
        assert_eq!(plan.updates[0].entitlement_id, first_id);
        assert_eq!(plan.updates[0].balance, dec!(0));
        assert_eq!(plan.updates[1].entitlement_id, second_id);
        assert_eq!(plan.updates[1].balance, dec!(5));
    }

    #[test]
    fn test_reject_refuses_overdraw_before_staging() {
        let err = plan_feature_deduction(
            "messages",
            &[entry(dec!(50))],
            DeductionAmount::Decrement(dec!(60)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap_err();

        match err {
            EngineError::InsufficientBalance {
                feature_id,
                requested,
                available,
            } => {
                assert_eq!(feature_id, "messages");
                assert_eq!(requested, "60");
                assert_eq!(available, "50");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_sequential_reject_contention() {
        // 60 then 60 from 100: the second planner run sees the first's
        // write and refuses
        let plan = plan_feature_deduction(
            "messages",
            &[entry(dec!(100))],
            DeductionAmount::Decrement(dec!(60)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap();
        let after_first = entry(plan.updates[0].balance);
        assert_eq!(after_first.snapshot.balance, dec!(40));

        let second = plan_feature_deduction(
            "messages",
            &[after_first],
            DeductionAmount::Decrement(dec!(60)),
            OverageBehavior::Reject,
            None,
        );
        assert!(second.is_err());
    }

    #[test]
    fn test_cap_floors_and_drops_excess() {
        let plan = plan_feature_deduction(
            "messages",
            &[entry(dec!(50))],
            DeductionAmount::Decrement(dec!(60)),
            OverageBehavior::Cap,
            None,
        )
        .unwrap();

        assert_eq!(plan.requested, dec!(60));
        assert_eq!(plan.deducted, dec!(50));
        assert_eq!(plan.updates[0].balance, dec!(0));
    }

    #[test]
    fn test_cap_respects_max_overage_floor() {
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(10));
        ent.usage_allowed = true;
        ent.max_overage = Some(dec!(5));

        let plan = plan_feature_deduction(
            "messages",
            &[PlanEntry::direct(ent.snapshot())],
            DeductionAmount::Decrement(dec!(20)),
            OverageBehavior::Cap,
            None,
        )
        .unwrap();

        assert_eq!(plan.updates[0].balance, dec!(-5));
        assert_eq!(plan.deducted, dec!(15));
    }

    #[test]
    fn test_allow_absorbs_remainder_into_last() {
        let first = entry(dec!(10));
        let second = entry(dec!(5));

        let plan = plan_feature_deduction(
            "messages",
            &[first, second],
            DeductionAmount::Decrement(dec!(25)),
            OverageBehavior::Allow,
            None,
        )
        .unwrap();

        assert_eq!(plan.deducted, dec!(25));
        assert_eq!(plan.updates[0].balance, dec!(0));
        assert_eq!(plan.updates[1].balance, dec!(-10));
    }

    #[test]
    fn test_set_to_deducts_down_to_target() {
        let plan = plan_feature_deduction(
            "messages",
            &[entry(dec!(100))],
            DeductionAmount::SetTo(dec!(30)),
            OverageBehavior::Allow,
            None,
        )
        .unwrap();

        assert_eq!(plan.requested, dec!(70));
        assert_eq!(plan.updates[0].balance, dec!(30));
    }

    #[test]
    fn test_set_to_above_current_credits_first_entitlement() {
        let first = entry(dec!(10));
        let second = entry(dec!(10));
        let first_id = first.snapshot.id;

        let plan = plan_feature_deduction(
            "messages",
            &[first, second],
            DeductionAmount::SetTo(dec!(35)),
            OverageBehavior::Allow,
            None,
        )
        .unwrap();

        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].entitlement_id, first_id);
        assert_eq!(plan.updates[0].balance, dec!(25));
        assert_eq!(plan.updates[0].deducted, dec!(-15));
    }

    #[test]
    fn test_unlimited_short_circuits() {
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(0));
        ent.unlimited = true;

        let plan = plan_feature_deduction(
            "messages",
            &[PlanEntry::direct(ent.snapshot())],
            DeductionAmount::Decrement(dec!(1000)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap();

        assert!(plan.updates.is_empty());
        assert_eq!(plan.deducted, dec!(0));
    }

    #[test]
    fn test_credit_system_multiplier_scales_cost() {
        let credits = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(100)).snapshot();
        let plan = plan_feature_deduction(
            "messages",
            &[PlanEntry {
                snapshot: credits,
                multiplier: dec!(8),
            }],
            DeductionAmount::Decrement(dec!(3)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap();

        // 3 message units cost 24 credits
        assert_eq!(plan.updates[0].balance, dec!(76));
        assert_eq!(plan.updates[0].deducted, dec!(24));
        assert_eq!(plan.deducted, dec!(3));
    }

    #[test]
    fn test_set_to_rejects_credit_multipliers() {
        let credits = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(100)).snapshot();
        let err = plan_feature_deduction(
            "messages",
            &[PlanEntry {
                snapshot: credits,
                multiplier: dec!(8),
            }],
            DeductionAmount::SetTo(dec!(10)),
            OverageBehavior::Allow,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeduction(_)));
    }

    #[test]
    fn test_entity_scope_updates_slice_and_aggregate() {
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(10));
        let mut slices = BTreeMap::new();
        slices.insert("seat_1".to_string(), dec!(4));
        slices.insert("seat_2".to_string(), dec!(6));
        ent.entity_balances = Some(slices);

        let plan = plan_feature_deduction(
            "seats",
            &[PlanEntry::direct(ent.snapshot())],
            DeductionAmount::Decrement(dec!(3)),
            OverageBehavior::Reject,
            Some("seat_1"),
        )
        .unwrap();

        let update = &plan.updates[0];
        assert_eq!(update.balance, dec!(7));
        let slices = update.entity_balances.as_ref().unwrap();
        assert_eq!(slices["seat_1"], dec!(1));
        assert_eq!(slices["seat_2"], dec!(6));
        // slices still sum to the aggregate
        assert_eq!(slices.values().copied().sum::<Decimal>(), update.balance);
    }

    #[test]
    fn test_entity_scope_limits_to_slice_balance() {
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(10));
        let mut slices = BTreeMap::new();
        slices.insert("seat_1".to_string(), dec!(4));
        slices.insert("seat_2".to_string(), dec!(6));
        ent.entity_balances = Some(slices);

        let err = plan_feature_deduction(
            "seats",
            &[PlanEntry::direct(ent.snapshot())],
            DeductionAmount::Decrement(dec!(5)),
            OverageBehavior::Reject,
            Some("seat_1"),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientBalance { .. }));
    }

    #[test]
    fn test_customer_scope_refused_on_sliced_entitlement() {
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(10));
        let mut slices = BTreeMap::new();
        slices.insert("seat_1".to_string(), dec!(4));
        slices.insert("seat_2".to_string(), dec!(6));
        ent.entity_balances = Some(slices);

        // draining the aggregate with no slice to charge would desync the
        // slice sum from the aggregate
        let err = plan_feature_deduction(
            "seats",
            &[PlanEntry::direct(ent.snapshot())],
            DeductionAmount::Decrement(dec!(3)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDeduction(_)));
    }

    #[test]
    fn test_threshold_crossing_detected_once() {
        let mut ent = CustomerEntitlement::test_fixture(Uuid::new_v4(), dec!(100));
        ent.threshold = Some(dec!(20));

        let plan = plan_feature_deduction(
            "messages",
            &[PlanEntry::direct(ent.snapshot())],
            DeductionAmount::Decrement(dec!(85)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap();
        assert_eq!(plan.threshold_crossings.len(), 1);
        assert_eq!(plan.threshold_crossings[0].after_balance, dec!(15));

        // already below the threshold: no repeat notification
        let below = plan.updates[0].balance;
        let mut ent2 = CustomerEntitlement::test_fixture(Uuid::new_v4(), below);
        ent2.threshold = Some(dec!(20));
        let plan2 = plan_feature_deduction(
            "messages",
            &[PlanEntry::direct(ent2.snapshot())],
            DeductionAmount::Decrement(dec!(5)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap();
        assert!(plan2.threshold_crossings.is_empty());
    }

    #[test]
    fn test_zero_delta_is_noop() {
        let plan = plan_feature_deduction(
            "messages",
            &[entry(dec!(10))],
            DeductionAmount::SetTo(dec!(10)),
            OverageBehavior::Allow,
            None,
        )
        .unwrap();
        assert!(plan.updates.is_empty());
        assert_eq!(plan.deducted, dec!(0));
    }

    #[test]
    fn test_no_entitlements_is_an_error() {
        let err = plan_feature_deduction(
            "messages",
            &[],
            DeductionAmount::Decrement(dec!(1)),
            OverageBehavior::Reject,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::EntitlementNotFound(_)));
    }
}
