//! Durable store access for the tally engine
//!
//! PostgreSQL is the sole source of truth; the cache tier is advisory and
//! reconstructable from the rows managed here. This crate provides the
//! connection pool, the per-scope session lock primitive, and repositories
//! for customers/entitlements and usage events.

pub mod lock;
pub mod pool;
pub mod repositories;

pub use pool::{create_pool, run_migrations};
pub use repositories::feature_repo::PgFeatureCatalog;
pub use repositories::{customer_repo, event_repo, feature_repo};
