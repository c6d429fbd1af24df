//! Customer repository
//!
//! Assembles the full customer aggregate (customer, entity scope, products,
//! entitlements, rollovers, prices) and applies entitlement mutations. All
//! functions take a `PgConnection` so they compose inside a caller-owned
//! transaction; entitlement balances are only ever written through
//! [`update_entitlement_balance`] and [`update_rollover_balance`] from the
//! durable deduction transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use tally_core::models::{
    AppEnv, Customer, CustomerEntitlement, CustomerPrice, CustomerProduct, Entity, FullCustomer,
    ProductStatus, RolloverBalance,
};
use tally_core::{EngineError, EngineResult};
use tracing::{debug, error, instrument};
use uuid::Uuid;

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    internal_id: Uuid,
    id: String,
    org_id: String,
    env: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Self {
            internal_id: row.internal_id,
            id: row.id,
            org_id: row.org_id,
            env: AppEnv::from_str(&row.env).unwrap_or_default(),
            name: row.name,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    internal_id: Uuid,
    id: String,
    internal_customer_id: Uuid,
    name: Option<String>,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        Self {
            internal_id: row.internal_id,
            id: row.id,
            internal_customer_id: row.internal_customer_id,
            name: row.name,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    product_id: String,
    status: String,
    quantity: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    id: Uuid,
    customer_product_id: Uuid,
    internal_feature_id: Uuid,
    feature_id: String,
    balance: Decimal,
    allowance: Decimal,
    unlimited: bool,
    usage_allowed: bool,
    max_overage: Option<Decimal>,
    entity_balances: Option<serde_json::Value>,
    next_reset_at: Option<DateTime<Utc>>,
    priority: i32,
    threshold: Option<Decimal>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EntitlementRow {
    fn into_model(self, rollovers: Vec<RolloverBalance>) -> EngineResult<CustomerEntitlement> {
        let entity_balances: Option<BTreeMap<String, Decimal>> = match self.entity_balances {
            Some(json) => Some(serde_json::from_value(json).map_err(|e| {
                EngineError::Serialization(format!(
                    "Invalid entity_balances for entitlement {}: {}",
                    self.id, e
                ))
            })?),
            None => None,
        };

        Ok(CustomerEntitlement {
            id: self.id,
            customer_product_id: self.customer_product_id,
            internal_feature_id: self.internal_feature_id,
            feature_id: self.feature_id,
            balance: self.balance,
            allowance: self.allowance,
            unlimited: self.unlimited,
            usage_allowed: self.usage_allowed,
            max_overage: self.max_overage,
            entity_balances,
            rollovers,
            next_reset_at: self.next_reset_at,
            priority: self.priority,
            threshold: self.threshold,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RolloverRow {
    id: Uuid,
    customer_entitlement_id: Uuid,
    balance: Decimal,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct PriceRow {
    id: Uuid,
    customer_product_id: Uuid,
    internal_feature_id: Option<Uuid>,
    overage_rate: Option<Decimal>,
}

/// Load a customer with products, entitlements, rollovers, and prices
///
/// `id_or_internal` matches the external id first, then the internal
/// surrogate id. Only products in `statuses` are attached; deduction paths
/// pass active + past_due. When `entity_id` is given the entity must exist
/// or the call fails with `EntityNotFound`.
#[instrument(skip(conn))]
pub async fn get_full_customer(
    conn: &mut PgConnection,
    id_or_internal: &str,
    org_id: &str,
    env: AppEnv,
    entity_id: Option<&str>,
    statuses: &[ProductStatus],
) -> EngineResult<FullCustomer> {
    debug!("Loading full customer {}", id_or_internal);

    let customer: Customer = sqlx::query_as::<sqlx::Postgres, CustomerRow>(
        r#"
        SELECT internal_id, id, org_id, env, name, created_at
        FROM customers
        WHERE (id = $1 OR internal_id::text = $1)
          AND org_id = $2
          AND env = $3
        "#,
    )
    .bind(id_or_internal)
    .bind(org_id)
    .bind(env.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| {
        error!("Database error loading customer {}: {}", id_or_internal, e);
        EngineError::Database(format!("Failed to load customer: {}", e))
    })?
    .ok_or_else(|| EngineError::CustomerNotFound(id_or_internal.to_string()))?
    .into();

    let entity: Option<Entity> = match entity_id {
        Some(eid) => Some(
            sqlx::query_as::<sqlx::Postgres, EntityRow>(
                r#"
                SELECT internal_id, id, internal_customer_id, name
                FROM entities
                WHERE id = $1 AND internal_customer_id = $2
                "#,
            )
            .bind(eid)
            .bind(customer.internal_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| EngineError::Database(format!("Failed to load entity: {}", e)))?
            .ok_or_else(|| EngineError::EntityNotFound(eid.to_string()))?
            .into(),
        ),
        None => None,
    };

    let status_strings: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
    let product_rows = sqlx::query_as::<sqlx::Postgres, ProductRow>(
        r#"
        SELECT id, product_id, status, quantity, created_at
        FROM customer_products
        WHERE internal_customer_id = $1 AND status = ANY($2)
        ORDER BY created_at
        "#,
    )
    .bind(customer.internal_id)
    .bind(&status_strings)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| EngineError::Database(format!("Failed to load products: {}", e)))?;

    let product_ids: Vec<Uuid> = product_rows.iter().map(|p| p.id).collect();

    let entitlement_rows = sqlx::query_as::<sqlx::Postgres, EntitlementRow>(
        r#"
        SELECT id, customer_product_id, internal_feature_id, feature_id,
               balance, allowance, unlimited, usage_allowed, max_overage,
               entity_balances, next_reset_at, priority, threshold,
               created_at, updated_at
        FROM customer_entitlements
        WHERE customer_product_id = ANY($1)
        "#,
    )
    .bind(&product_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| EngineError::Database(format!("Failed to load entitlements: {}", e)))?;

    let entitlement_ids: Vec<Uuid> = entitlement_rows.iter().map(|e| e.id).collect();

    let rollover_rows = sqlx::query_as::<sqlx::Postgres, RolloverRow>(
        r#"
        SELECT id, customer_entitlement_id, balance, expires_at
        FROM rollovers
        WHERE customer_entitlement_id = ANY($1) AND balance <> 0
        "#,
    )
    .bind(&entitlement_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| EngineError::Database(format!("Failed to load rollovers: {}", e)))?;

    let price_rows = sqlx::query_as::<sqlx::Postgres, PriceRow>(
        r#"
        SELECT id, customer_product_id, internal_feature_id, overage_rate
        FROM customer_prices
        WHERE customer_product_id = ANY($1)
        "#,
    )
    .bind(&product_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| EngineError::Database(format!("Failed to load prices: {}", e)))?;

    let mut rollovers_by_ent: BTreeMap<Uuid, Vec<RolloverBalance>> = BTreeMap::new();
    for row in rollover_rows {
        rollovers_by_ent
            .entry(row.customer_entitlement_id)
            .or_default()
            .push(RolloverBalance {
                id: row.id,
                balance: row.balance,
                expires_at: row.expires_at,
            });
    }

    let mut ents_by_product: BTreeMap<Uuid, Vec<CustomerEntitlement>> = BTreeMap::new();
    for row in entitlement_rows {
        let rollovers = rollovers_by_ent.remove(&row.id).unwrap_or_default();
        let product_id = row.customer_product_id;
        ents_by_product
            .entry(product_id)
            .or_default()
            .push(row.into_model(rollovers)?);
    }

    let mut prices_by_product: BTreeMap<Uuid, Vec<CustomerPrice>> = BTreeMap::new();
    for row in price_rows {
        prices_by_product
            .entry(row.customer_product_id)
            .or_default()
            .push(CustomerPrice {
                id: row.id,
                internal_feature_id: row.internal_feature_id,
                overage_rate: row.overage_rate,
            });
    }

    let customer_products = product_rows
        .into_iter()
        .map(|row| CustomerProduct {
            entitlements: ents_by_product.remove(&row.id).unwrap_or_default(),
            prices: prices_by_product.remove(&row.id).unwrap_or_default(),
            id: row.id,
            product_id: row.product_id,
            status: ProductStatus::from_str(&row.status).unwrap_or_default(),
            quantity: row.quantity,
            created_at: row.created_at,
        })
        .collect();

    Ok(FullCustomer {
        customer,
        entity,
        customer_products,
    })
}

/// Write an entitlement's new aggregate balance and entity slices
pub async fn update_entitlement_balance(
    conn: &mut PgConnection,
    entitlement_id: Uuid,
    balance: Decimal,
    entity_balances: Option<&BTreeMap<String, Decimal>>,
) -> EngineResult<()> {
    let entity_json = match entity_balances {
        Some(slices) => Some(serde_json::to_value(slices).map_err(|e| {
            EngineError::Serialization(format!("Failed to encode entity balances: {}", e))
        })?),
        None => None,
    };

    let result = sqlx::query(
        r#"
        UPDATE customer_entitlements
        SET balance = $2,
            entity_balances = COALESCE($3, entity_balances),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(entitlement_id)
    .bind(balance)
    .bind(entity_json)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to update entitlement {}: {}", entitlement_id, e);
        EngineError::Database(format!("Failed to update entitlement: {}", e))
    })?;

    if result.rows_affected() == 0 {
        return Err(EngineError::EntitlementNotFound(entitlement_id.to_string()));
    }
    Ok(())
}

/// Write a rollover's remaining balance
pub async fn update_rollover_balance(
    conn: &mut PgConnection,
    rollover_id: Uuid,
    balance: Decimal,
) -> EngineResult<()> {
    sqlx::query("UPDATE rollovers SET balance = $2, updated_at = NOW() WHERE id = $1")
        .bind(rollover_id)
        .bind(balance)
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to update rollover: {}", e)))?;
    Ok(())
}

/// Set an entitlement's next scheduled reset
pub async fn set_next_reset(
    conn: &mut PgConnection,
    entitlement_id: Uuid,
    next_reset_at: DateTime<Utc>,
) -> EngineResult<()> {
    sqlx::query(
        "UPDATE customer_entitlements SET next_reset_at = $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(entitlement_id)
    .bind(next_reset_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| EngineError::Database(format!("Failed to set next reset: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    async fn setup_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgresql://localhost/tally".to_string());
        let mut config = tally_core::config::DatabaseConfig::with_url(url);
        config.max_connections = 2;
        crate::pool::create_pool(&config).await.unwrap()
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_missing_customer_is_not_found() {
        let pool = setup_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let result = get_full_customer(
            &mut conn,
            "cus_does_not_exist",
            "org_1",
            AppEnv::Sandbox,
            None,
            &[ProductStatus::Active],
        )
        .await;

        assert!(matches!(result, Err(EngineError::CustomerNotFound(_))));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_update_missing_entitlement_is_not_found() {
        let pool = setup_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let result =
            update_entitlement_balance(&mut conn, Uuid::new_v4(), Decimal::ZERO, None).await;
        assert!(matches!(result, Err(EngineError::EntitlementNotFound(_))));
    }
}
