//! Application configuration
//!
//! Centralized configuration via the `config` crate, layered from defaults,
//! optional `config/{default,RUN_MODE}` files, and `TALLY__`-prefixed
//! environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

/// Main engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub deduction: DeductionConfig,
    pub queues: QueueConfig,
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    /// Config for a URL with default pool sizing (tests, one-off tools)
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

fn default_max_connections() -> u32 {
    20
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    600
}

/// One regional Redis instance
#[derive(Debug, Deserialize, Clone)]
pub struct CacheRegion {
    /// Region name carried on sync items (e.g. "us-east")
    pub name: String,

    /// Redis connection URL
    pub url: String,
}

/// Cache tier configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Regional Redis instances; must include the home region
    pub regions: Vec<CacheRegion>,

    /// Region this process writes to
    pub home_region: String,

    /// TTL for customer balance entries in seconds
    #[serde(default = "default_balance_ttl")]
    pub balance_ttl_secs: u64,
}

fn default_balance_ttl() -> u64 {
    86400
}

/// Deduction path configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeductionConfig {
    /// Per-scope lock acquisition timeout in milliseconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,

    /// Drain entitlements in descending priority order instead of ascending
    #[serde(default)]
    pub reverse_deduction_order: bool,
}

fn default_lock_timeout() -> u64 {
    5000
}

/// Batching window configuration for the sync and event queues
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Sync window length in milliseconds
    #[serde(default = "default_sync_window")]
    pub sync_window_ms: u64,

    /// Flush the sync window early at this many pending pairs
    #[serde(default = "default_sync_batch")]
    pub sync_max_batch: usize,

    /// Event window length in milliseconds
    #[serde(default = "default_event_window")]
    pub event_window_ms: u64,

    /// Flush the event window early at this many pending events
    #[serde(default = "default_event_batch")]
    pub event_max_batch: usize,
}

fn default_sync_window() -> u64 {
    1000
}

fn default_sync_batch() -> usize {
    200
}

fn default_event_window() -> u64 {
    500
}

fn default_event_batch() -> usize {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            sync_window_ms: default_sync_window(),
            sync_max_batch: default_sync_batch(),
            event_window_ms: default_event_window(),
            event_max_batch: default_event_batch(),
        }
    }
}

impl Default for DeductionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout(),
            reverse_deduction_order: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment and optional config files
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .set_default("database.max_connections", 20)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("cache.balance_ttl_secs", 86400)?
            .set_default("cache.home_region", "local")?
            .set_default("deduction.lock_timeout_ms", 5000)?
            .set_default("deduction.reverse_deduction_order", false)?
            .set_default("queues.sync_window_ms", 1000)?
            .set_default("queues.sync_max_batch", 200)?
            .set_default("queues.event_window_ms", 500)?
            .set_default("queues.event_max_batch", 500)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("TALLY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_url_uses_default_pool_sizing() {
        let config = DatabaseConfig::with_url("postgresql://localhost/tally");
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.acquire_timeout_secs, 30);
        assert_eq!(config.idle_timeout_secs, 600);
    }

    #[test]
    fn test_default_queue_config() {
        let config = QueueConfig::default();
        assert_eq!(config.sync_window_ms, 1000);
        assert_eq!(config.sync_max_batch, 200);
        assert_eq!(config.event_window_ms, 500);
        assert_eq!(config.event_max_batch, 500);
    }

    #[test]
    fn test_default_deduction_config() {
        let config = DeductionConfig::default();
        assert_eq!(config.lock_timeout_ms, 5000);
        assert!(!config.reverse_deduction_order);
    }
}
