//! Unified error handling for the tally engine
//!
//! Every failure in the engine is expressed as an [`EngineError`]. The
//! taxonomy distinguishes infrastructure faults on the cache path (which the
//! track flow recovers from locally by falling back to the durable store)
//! from feasibility and configuration errors (which always propagate to the
//! caller).

use thiserror::Error;

/// Main engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    // ==================== Database Errors ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Lock acquisition timed out for scope: {0}")]
    LockTimeout(String),

    // ==================== Cache Errors ====================
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Cache write failed: {0}")]
    CacheWriteFailed(String),

    // ==================== Balance Errors ====================
    #[error("Insufficient balance for feature {feature_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        feature_id: String,
        requested: String,
        available: String,
    },

    #[error("Feature {0} requires the durable deduction path")]
    RequiresDurablePath(String),

    // ==================== Configuration Errors ====================
    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entitlement not found: {0}")]
    EntitlementNotFound(String),

    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    // ==================== Validation Errors ====================
    #[error("Invalid deduction: {0}")]
    InvalidDeduction(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ==================== Internal Errors ====================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Stable error code for API responses and log fields
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Database(_) => "database_error",
            EngineError::Pool(_) => "pool_error",
            EngineError::Transaction(_) => "transaction_error",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::CacheUnavailable(_) => "cache_unavailable",
            EngineError::CacheWriteFailed(_) => "cache_write_failed",
            EngineError::InsufficientBalance { .. } => "insufficient_balance",
            EngineError::RequiresDurablePath(_) => "requires_durable_path",
            EngineError::CustomerNotFound(_) => "customer_not_found",
            EngineError::EntityNotFound(_) => "entity_not_found",
            EngineError::EntitlementNotFound(_) => "entitlement_not_found",
            EngineError::FeatureNotFound(_) => "feature_not_found",
            EngineError::InvalidDeduction(_) => "invalid_deduction",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Internal(_) => "internal_error",
            EngineError::Config(_) => "config_error",
            EngineError::Serialization(_) => "serialization_error",
        }
    }

    /// Whether the caller may retry the operation as-is
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockTimeout(_)
                | EngineError::Pool(_)
                | EngineError::CacheUnavailable(_)
        )
    }

    /// Whether this is a cache-tier infrastructure fault
    ///
    /// Faults of this kind never surface to the caller from the track path:
    /// they route the request to the durable deduction transaction instead.
    pub fn is_cache_fault(&self) -> bool {
        matches!(
            self,
            EngineError::CacheUnavailable(_) | EngineError::CacheWriteFailed(_)
        )
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}
