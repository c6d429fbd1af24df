//! Customer, entity, and attached-product models
//!
//! A customer is tenant-scoped (org + env) and owns zero or more entities
//! (sub-scopes such as seats) plus one or more attached products. Products
//! carry a lifecycle status; only active and past-due products participate in
//! deduction scans.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::entitlement::CustomerEntitlement;

/// Deployment environment a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    #[default]
    Sandbox,
    Live,
}

impl fmt::Display for AppEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppEnv::Sandbox => write!(f, "sandbox"),
            AppEnv::Live => write!(f, "live"),
        }
    }
}

impl AppEnv {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sandbox" => Some(AppEnv::Sandbox),
            "live" => Some(AppEnv::Live),
            _ => None,
        }
    }
}

/// Attached-product lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    #[default]
    Active,
    PastDue,
    Scheduled,
    Expired,
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProductStatus::Active => write!(f, "active"),
            ProductStatus::PastDue => write!(f, "past_due"),
            ProductStatus::Scheduled => write!(f, "scheduled"),
            ProductStatus::Expired => write!(f, "expired"),
        }
    }
}

impl ProductStatus {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(ProductStatus::Active),
            "past_due" => Some(ProductStatus::PastDue),
            "scheduled" => Some(ProductStatus::Scheduled),
            "expired" => Some(ProductStatus::Expired),
            _ => None,
        }
    }

    /// Whether entitlements of this product participate in deductions
    ///
    /// Scheduled products have not started; expired products are kept for
    /// audit only.
    pub fn is_deductible(&self) -> bool {
        matches!(self, ProductStatus::Active | ProductStatus::PastDue)
    }
}

/// Customer account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    /// Internal surrogate identifier
    pub internal_id: Uuid,

    /// External customer identifier (caller-supplied)
    pub id: String,

    /// Owning organization
    pub org_id: String,

    /// Environment
    pub env: AppEnv,

    /// Display name
    pub name: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Sub-scope of a customer (e.g. a seat or sub-account)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Internal surrogate identifier
    pub internal_id: Uuid,

    /// External entity identifier
    pub id: String,

    /// Owning customer (internal id)
    pub internal_customer_id: Uuid,

    /// Display name
    pub name: Option<String>,
}

/// Usage price attached to a product for one feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerPrice {
    pub id: Uuid,

    /// Feature this price covers (internal id), if feature-scoped
    pub internal_feature_id: Option<Uuid>,

    /// Per-unit overage rate; present means usage beyond the allowance is
    /// billed rather than free
    pub overage_rate: Option<Decimal>,
}

/// An attached product instance with its entitlements and prices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerProduct {
    pub id: Uuid,

    /// Catalog product identifier
    pub product_id: String,

    /// Lifecycle status
    pub status: ProductStatus,

    /// Purchased quantity (prepaid seats/packs)
    pub quantity: i64,

    /// Entitlements granted by this product
    pub entitlements: Vec<CustomerEntitlement>,

    /// Usage prices attached to this product
    pub prices: Vec<CustomerPrice>,

    pub created_at: DateTime<Utc>,
}

impl CustomerProduct {
    /// Usage price for a feature on this product, if any
    pub fn price_for(&self, internal_feature_id: Uuid) -> Option<&CustomerPrice> {
        self.prices
            .iter()
            .find(|p| p.internal_feature_id == Some(internal_feature_id))
    }
}

/// A customer with entities and attached products fully loaded
///
/// This is the unit the deduction paths operate on; it is assembled in one
/// repository call so no path ever works from a partially loaded customer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullCustomer {
    pub customer: Customer,

    /// Entity scope, when the operation is entity-scoped
    pub entity: Option<Entity>,

    pub customer_products: Vec<CustomerProduct>,
}

impl FullCustomer {
    /// Entitlements granting any of `internal_feature_ids`, drawn from
    /// deductible products only, ordered by deduction priority
    ///
    /// Priority ascending is the default drain order; orgs may configure the
    /// reverse. The ordering is a tie-break contract: when several
    /// entitlements grant the same feature, the first in this order drains
    /// first.
    pub fn entitlements_for_features(
        &self,
        internal_feature_ids: &[Uuid],
        reverse_order: bool,
    ) -> Vec<&CustomerEntitlement> {
        let mut ents: Vec<&CustomerEntitlement> = self
            .customer_products
            .iter()
            .filter(|p| p.status.is_deductible())
            .flat_map(|p| p.entitlements.iter())
            .filter(|e| internal_feature_ids.contains(&e.internal_feature_id))
            .collect();

        ents.sort_by_key(|e| (e.priority, e.created_at));
        if reverse_order {
            ents.reverse();
        }
        ents
    }

    /// Look up an entitlement anywhere on the customer by id
    pub fn find_entitlement(&self, entitlement_id: Uuid) -> Option<&CustomerEntitlement> {
        self.customer_products
            .iter()
            .flat_map(|p| p.entitlements.iter())
            .find(|e| e.id == entitlement_id)
    }

    /// Mutable lookup, for folding staged balance writes back into the
    /// in-memory customer between batch items
    pub fn find_entitlement_mut(
        &mut self,
        entitlement_id: Uuid,
    ) -> Option<&mut CustomerEntitlement> {
        self.customer_products
            .iter_mut()
            .flat_map(|p| p.entitlements.iter_mut())
            .find(|e| e.id == entitlement_id)
    }

    /// The product owning an entitlement
    pub fn product_of(&self, entitlement_id: Uuid) -> Option<&CustomerProduct> {
        self.customer_products
            .iter()
            .find(|p| p.entitlements.iter().any(|e| e.id == entitlement_id))
    }
}
