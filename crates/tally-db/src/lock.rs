//! Per-scope session locks
//!
//! Concurrent deductions for one (customer, entity?) scope serialize on a
//! transaction-scoped advisory lock; deductions for different entities of
//! the same customer take different locks and proceed concurrently. The lock
//! key is a stable FNV-1a hash of the scope string, so every process derives
//! the same key without coordination.
//!
//! The lock is held only for the owning transaction's lifetime and is never
//! used as a semaphore beyond one logical operation. Acquisition is bounded
//! by `lock_timeout`; exceeding it surfaces as a retryable `LockTimeout`
//! rather than blocking indefinitely.

use sqlx::{PgConnection, Postgres, Transaction};
use tally_core::models::AppEnv;
use tally_core::{EngineError, EngineResult};
use tracing::{debug, error};

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// SQLSTATE raised by Postgres when lock_timeout elapses
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Stable 64-bit FNV-1a hash
fn fnv1a64(input: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// The scope string a deduction serializes on
pub fn scope_string(
    org_id: &str,
    env: AppEnv,
    customer_id: &str,
    entity_id: Option<&str>,
) -> String {
    match entity_id {
        Some(entity) => format!("{}:{}:customer:{}:entity:{}", org_id, env, customer_id, entity),
        None => format!("{}:{}:customer:{}", org_id, env, customer_id),
    }
}

/// Advisory lock key for a deduction scope
pub fn scope_lock_key(
    org_id: &str,
    env: AppEnv,
    customer_id: &str,
    entity_id: Option<&str>,
) -> i64 {
    fnv1a64(&scope_string(org_id, env, customer_id, entity_id)) as i64
}

/// Acquire the exclusive per-scope lock inside the given transaction
///
/// The lock releases automatically at commit or rollback.
pub async fn acquire_scope_lock(
    tx: &mut Transaction<'_, Postgres>,
    lock_key: i64,
    timeout_ms: u64,
) -> EngineResult<()> {
    // SET LOCAL does not accept bind parameters; timeout_ms is numeric so
    // the interpolation is safe
    sqlx::query(&format!("SET LOCAL lock_timeout = '{}ms'", timeout_ms))
        .execute(&mut **tx as &mut PgConnection)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to set lock timeout: {}", e)))?;

    debug!(lock_key, "Acquiring scope lock");

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(lock_key)
        .execute(&mut **tx as &mut PgConnection)
        .await
        .map_err(|e| {
            let timed_out = e
                .as_database_error()
                .and_then(|d| d.code())
                .map(|c| c == LOCK_NOT_AVAILABLE)
                .unwrap_or(false);
            if timed_out {
                EngineError::LockTimeout(format!("lock key {}", lock_key))
            } else {
                error!("Failed to acquire scope lock: {}", e);
                EngineError::Database(format!("Lock acquisition failed: {}", e))
            }
        })?;

    Ok(())
}
