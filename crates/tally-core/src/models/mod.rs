//! Domain models for the tally engine

pub mod balance;
pub mod customer;
pub mod deduction;
pub mod entitlement;
pub mod feature;

pub use balance::{ApiBalance, ApiBalanceBreakdown, CachedBalance, CachedBreakdown};
pub use customer::{
    AppEnv, Customer, CustomerPrice, CustomerProduct, Entity, FullCustomer, ProductStatus,
};
pub use deduction::{
    DeductionAmount, EventInfo, FeatureDeduction, SortParams, SyncItem, UsageEvent,
};
pub use entitlement::{
    CustomerEntitlement, EntitlementSnapshot, OverageBehavior, RolloverBalance,
};
pub use feature::{CreditCost, Feature, FeatureUsageType, UsagePriceConfig};
