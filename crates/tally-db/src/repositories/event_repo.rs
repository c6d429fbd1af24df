//! Usage event repository
//!
//! Events are the audit record of every deduction. Idempotency is enforced
//! by a unique (org_id, idempotency_key) index: a repeated key inserts
//! nothing and reports so, letting callers guarantee exactly one recorded
//! event and one balance change per key.

use sqlx::{PgConnection, PgPool, QueryBuilder};
use tally_core::models::UsageEvent;
use tally_core::{EngineError, EngineResult};
use tracing::{debug, error, instrument};

/// Insert one usage event inside the caller's transaction
///
/// Returns `false` when the idempotency key was already recorded.
pub async fn insert_in_tx(conn: &mut PgConnection, event: &UsageEvent) -> EngineResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO usage_events (
            id, org_id, env, internal_customer_id, customer_id, entity_id,
            feature_id, event_name, value, idempotency_key, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(event.id)
    .bind(&event.org_id)
    .bind(event.env.to_string())
    .bind(event.internal_customer_id)
    .bind(&event.customer_id)
    .bind(&event.entity_id)
    .bind(&event.feature_id)
    .bind(&event.event_name)
    .bind(event.value)
    .bind(&event.idempotency_key)
    .bind(event.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        error!("Failed to insert usage event: {}", e);
        EngineError::Database(format!("Failed to insert usage event: {}", e))
    })?;

    let inserted = result.rows_affected() > 0;
    if !inserted {
        debug!(
            idempotency_key = ?event.idempotency_key,
            "Usage event already recorded, skipping"
        );
    }
    Ok(inserted)
}

/// Insert a coalesced batch of usage events in one statement
///
/// Used by the event queue's flush; duplicate idempotency keys within or
/// across batches are dropped, so a repeated flush is a no-op for rows
/// already written.
#[instrument(skip(pool, events), fields(events = events.len()))]
pub async fn insert_batch(pool: &PgPool, events: &[UsageEvent]) -> EngineResult<u64> {
    if events.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::new(
        "INSERT INTO usage_events (id, org_id, env, internal_customer_id, customer_id, \
         entity_id, feature_id, event_name, value, idempotency_key, created_at) ",
    );

    builder.push_values(events, |mut b, event| {
        b.push_bind(event.id)
            .push_bind(&event.org_id)
            .push_bind(event.env.to_string())
            .push_bind(event.internal_customer_id)
            .push_bind(&event.customer_id)
            .push_bind(&event.entity_id)
            .push_bind(&event.feature_id)
            .push_bind(&event.event_name)
            .push_bind(event.value)
            .push_bind(&event.idempotency_key)
            .push_bind(event.created_at);
    });
    builder.push(" ON CONFLICT DO NOTHING");

    let result = builder.build().execute(pool).await.map_err(|e| {
        error!("Failed to insert event batch: {}", e);
        EngineError::Database(format!("Failed to insert event batch: {}", e))
    })?;

    debug!(inserted = result.rows_affected(), "Event batch flushed");
    Ok(result.rows_affected())
}
