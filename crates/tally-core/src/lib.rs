//! Tally Core Library
//!
//! Foundational types, traits, and error handling for the tally metered
//! entitlement engine. It includes:
//!
//! - Domain models (Customer, CustomerEntitlement, FeatureDeduction, etc.)
//! - Collaborator traits (feature catalog, notification hook, pricing)
//! - Unified error handling with stable error codes
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;

pub use config::EngineConfig;
pub use error::EngineError;

/// Result type alias using EngineError
pub type EngineResult<T> = Result<T, EngineError>;
