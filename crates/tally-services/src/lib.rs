//! Engine services: deduction planning and execution, reconciliation, and
//! the batching queues
//!
//! The service layer ties the cache tier and the durable store together.
//! `TrackService` is the front door; `DeductionRunner` is the authoritative
//! path it falls back to; `SyncReconciler` drains the gap the cache fast
//! path leaves behind.

pub mod deduction_tx;
pub mod notify;
pub mod planner;
pub mod queues;
pub mod reconciler;
pub mod track;

#[cfg(test)]
mod test_support;

pub use deduction_tx::{DeductionRequest, DeductionRunner, DurableOutcome};
pub use notify::LoggingNotificationHook;
pub use queues::{EventQueue, SyncQueue};
pub use reconciler::{SyncReconciler, SyncResult, SyncStats};
pub use track::{TrackRequest, TrackResponse, TrackService, UpdateBalanceRequest};
