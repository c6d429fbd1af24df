//! Feature catalog backed by the durable store
//!
//! Features are mostly static configuration; this repository serves the
//! `FeatureCatalog` seam for deployments that keep the catalog in the same
//! database as the balances.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tally_core::models::{CreditCost, Feature, FeatureUsageType};
use tally_core::traits::FeatureCatalog;
use tally_core::{EngineError, EngineResult};
use tracing::error;
use uuid::Uuid;

#[derive(sqlx::FromRow)]
struct FeatureRow {
    internal_id: Uuid,
    id: String,
    usage_type: String,
    credit_schema: serde_json::Value,
}

impl FeatureRow {
    fn into_model(self) -> EngineResult<Feature> {
        let usage_type = match self.usage_type.as_str() {
            "continuous" => FeatureUsageType::Continuous,
            _ => FeatureUsageType::Single,
        };
        let credit_schema: Vec<CreditCost> = if self.credit_schema.is_null() {
            Vec::new()
        } else {
            serde_json::from_value(self.credit_schema).map_err(|e| {
                EngineError::Serialization(format!(
                    "Invalid credit schema for feature {}: {}",
                    self.id, e
                ))
            })?
        };
        Ok(Feature {
            id: self.id,
            internal_id: self.internal_id,
            usage_type,
            credit_schema,
        })
    }
}

/// `FeatureCatalog` implementation reading the features table
#[derive(Clone)]
pub struct PgFeatureCatalog {
    pool: PgPool,
}

impl PgFeatureCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeatureCatalog for PgFeatureCatalog {
    async fn resolve_feature(&self, feature_id: &str) -> EngineResult<Feature> {
        let row = sqlx::query_as::<sqlx::Postgres, FeatureRow>(
            "SELECT internal_id, id, usage_type, credit_schema FROM features WHERE id = $1",
        )
        .bind(feature_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Database error resolving feature {}: {}", feature_id, e);
            EngineError::Database(format!("Failed to resolve feature: {}", e))
        })?
        .ok_or_else(|| EngineError::FeatureNotFound(feature_id.to_string()))?;

        row.into_model()
    }

    async fn related_features(&self, feature_id: &str) -> EngineResult<Vec<(Feature, Decimal)>> {
        let feature = self.resolve_feature(feature_id).await?;

        // credit systems whose schema draws from this feature
        let rows = sqlx::query_as::<sqlx::Postgres, FeatureRow>(
            r#"
            SELECT internal_id, id, usage_type, credit_schema
            FROM features
            WHERE credit_schema @> jsonb_build_array(
                jsonb_build_object('metered_feature_id', $1::text)
            )
            "#,
        )
        .bind(feature_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to load credit systems: {}", e)))?;

        let mut related = vec![(feature, Decimal::ONE)];
        for row in rows {
            let system = row.into_model()?;
            if let Some(cost) = system.credit_cost_for(feature_id) {
                related.push((system, cost));
            }
        }
        Ok(related)
    }
}
