//! Cache key namespace for customer balance state
//!
//! Keys are versioned: bumping [`CACHE_VERSION`] orphans every existing entry
//! without an explicit migration. Orphaned versions are never read and age
//! out by TTL. The org segment is wrapped in braces so Redis Cluster hashes
//! every key of one org to the same slot, which lets batch invalidation
//! pipeline all of an org's deletes in one round trip.
//!
//! # Key Patterns
//!
//! - `{org}:{env}:customer:{customer_id}:v{N}` - customer-level balances
//! - `{org}:{env}:customer:{customer_id}:entity:{entity_id}:v{N}` - entity-level balances
//!
//! Each key is a hash; one field per feature (`f:{feature_id}`) holding the
//! cached balance JSON.

use tally_core::models::AppEnv;

/// Current cache schema version
pub const CACHE_VERSION: u32 = 2;

/// Previous schema version; still deletable, never read
pub const PREV_CACHE_VERSION: u32 = 1;

/// Hash field prefix for per-feature balance state
pub const FEATURE_FIELD_PREFIX: &str = "f";

/// Build the customer-level balance key for a given schema version
pub fn customer_key_versioned(
    org_id: &str,
    env: AppEnv,
    customer_id: &str,
    version: u32,
) -> String {
    format!("{{{}}}:{}:customer:{}:v{}", org_id, env, customer_id, version)
}

/// Build the customer-level balance key at the current version
pub fn customer_key(org_id: &str, env: AppEnv, customer_id: &str) -> String {
    customer_key_versioned(org_id, env, customer_id, CACHE_VERSION)
}

/// Build the entity-level balance key for a given schema version
pub fn entity_key_versioned(
    org_id: &str,
    env: AppEnv,
    customer_id: &str,
    entity_id: &str,
    version: u32,
) -> String {
    format!(
        "{{{}}}:{}:customer:{}:entity:{}:v{}",
        org_id, env, customer_id, entity_id, version
    )
}

/// Build the entity-level balance key at the current version
pub fn entity_key(org_id: &str, env: AppEnv, customer_id: &str, entity_id: &str) -> String {
    entity_key_versioned(org_id, env, customer_id, entity_id, CACHE_VERSION)
}

/// Build the scope key (customer- or entity-level) at a given version
pub fn scope_key(
    org_id: &str,
    env: AppEnv,
    customer_id: &str,
    entity_id: Option<&str>,
    version: u32,
) -> String {
    match entity_id {
        Some(entity) => entity_key_versioned(org_id, env, customer_id, entity, version),
        None => customer_key_versioned(org_id, env, customer_id, version),
    }
}

/// Hash field name for a feature's balance state
pub fn feature_field(feature_id: &str) -> String {
    format!("{}:{}", FEATURE_FIELD_PREFIX, feature_id)
}

/// Feature id encoded in a hash field name, if it is a feature field
pub fn feature_from_field(field: &str) -> Option<&str> {
    field.strip_prefix("f:")
}
