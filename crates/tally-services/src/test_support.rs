//! Shared fixtures for service tests

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::sync::Arc;
use tally_cache::{RedisCache, RegionalCaches};
use tally_core::config::DeductionConfig;
use tally_core::models::Feature;
use tally_core::traits::FeatureCatalog;
use tally_core::{EngineError, EngineResult};
use uuid::Uuid;

use crate::deduction_tx::DeductionRunner;

/// Fixed-content catalog
pub(crate) struct StaticCatalog {
    pub features: Vec<Feature>,
}

#[async_trait]
impl FeatureCatalog for StaticCatalog {
    async fn resolve_feature(&self, feature_id: &str) -> EngineResult<Feature> {
        self.features
            .iter()
            .find(|f| f.id == feature_id)
            .cloned()
            .ok_or_else(|| EngineError::FeatureNotFound(feature_id.to_string()))
    }

    async fn related_features(&self, feature_id: &str) -> EngineResult<Vec<(Feature, Decimal)>> {
        let feature = self.resolve_feature(feature_id).await?;
        let mut related = vec![(feature, Decimal::ONE)];
        for system in &self.features {
            if let Some(cost) = system.credit_cost_for(feature_id) {
                related.push((system.clone(), cost));
            }
        }
        Ok(related)
    }
}

pub(crate) async fn db_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/tally".to_string());
    let mut config = tally_core::config::DatabaseConfig::with_url(url);
    config.max_connections = 8;
    tally_db::create_pool(&config).await.unwrap()
}

pub(crate) async fn redis_cache() -> RedisCache {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisCache::new(&url).await.unwrap()
}

/// Insert a customer with one active product and one messages entitlement
pub(crate) async fn seed_customer(pool: &PgPool, balance: Decimal) -> (String, Uuid, Uuid) {
    let customer_internal = Uuid::new_v4();
    let customer_id = format!("cus_{}", customer_internal.simple());
    let product_id = Uuid::new_v4();
    let entitlement_id = Uuid::new_v4();
    let feature_internal = Uuid::new_v4();

    sqlx::query(
        "INSERT INTO customers (internal_id, id, org_id, env) VALUES ($1, $2, 'org_test', 'sandbox')",
    )
    .bind(customer_internal)
    .bind(&customer_id)
    .execute(pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO customer_products (id, internal_customer_id, product_id, status) \
         VALUES ($1, $2, 'pro', 'active')",
    )
    .bind(product_id)
    .bind(customer_internal)
    .execute(pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO customer_entitlements \
         (id, customer_product_id, internal_feature_id, feature_id, balance, allowance) \
         VALUES ($1, $2, $3, 'messages', $4, $4)",
    )
    .bind(entitlement_id)
    .bind(product_id)
    .bind(feature_internal)
    .bind(balance)
    .execute(pool)
    .await
    .unwrap();

    (customer_id, entitlement_id, feature_internal)
}

pub(crate) async fn entitlement_balance(pool: &PgPool, id: Uuid) -> Decimal {
    sqlx::query_scalar("SELECT balance FROM customer_entitlements WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .unwrap()
}

pub(crate) async fn runner(pool: PgPool, feature_internal: Uuid) -> DeductionRunner {
    let caches = Arc::new(RegionalCaches::single("test", redis_cache().await));
    let mut feature = Feature::metered("messages");
    feature.internal_id = feature_internal;
    DeductionRunner::new(
        pool,
        caches,
        Arc::new(StaticCatalog {
            features: vec![feature],
        }),
        None,
        DeductionConfig::default(),
    )
}
