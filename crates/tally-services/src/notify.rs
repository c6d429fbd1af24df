//! Default threshold notification hook

use async_trait::async_trait;
use rust_decimal::Decimal;
use tally_core::models::EntitlementSnapshot;
use tally_core::traits::NotificationHook;
use tally_core::EngineResult;
use tracing::info;

/// Hook that records threshold crossings in the log stream
///
/// Deployments with a delivery channel substitute their own
/// `NotificationHook`; this one never fails, so it cannot roll a deduction
/// back.
pub struct LoggingNotificationHook;

#[async_trait]
impl NotificationHook for LoggingNotificationHook {
    async fn on_threshold_reached(
        &self,
        feature_id: &str,
        before: &EntitlementSnapshot,
        after_balance: Decimal,
    ) -> EngineResult<()> {
        info!(
            feature_id,
            entitlement_id = %before.id,
            threshold = %before.threshold.unwrap_or(Decimal::ZERO),
            balance_before = %before.balance,
            balance_after = %after_balance,
            "Balance threshold crossed"
        );
        Ok(())
    }
}
