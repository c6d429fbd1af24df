//! Batching manager: atomic in-cache deduction
//!
//! A batch of feature deductions for one (customer, entity?) scope commits
//! in a single Lua script invocation, so the cache tier's lack of cross-key
//! transactionality never produces a partially applied batch. The script
//! validates every deduction against the overage policy first and only then
//! writes, all within one atomic round trip.
//!
//! Balances live as micro-unit integers inside the hash fields, so the
//! script's arithmetic is exact. Any miss, policy rejection, or fault is
//! reported as a signal; this module never fabricates state and never
//! retries.

use redis::Script;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_core::models::balance::{from_micros, to_micros};
use tally_core::models::{ApiBalance, CachedBalance, OverageBehavior};
use tally_core::{EngineError, EngineResult};
use tracing::{debug, instrument, warn};

use crate::keys::{self, feature_field};
use crate::{map_redis_error, RedisCache};
use tally_core::models::AppEnv;

/// One prepared relative deduction, already expanded through credit systems
#[derive(Debug, Clone, PartialEq)]
pub struct BatchDeduction {
    pub feature_id: String,
    pub amount: Decimal,
}

/// Why the batching manager handed the request to the durable path
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    /// No cached state for the scope (or the feature within it)
    CacheMiss,
    /// The feature's pricing requires ledger-exact accounting
    RequiresDurablePath(String),
    /// Cache-tier infrastructure fault (read or write)
    CacheFault(String),
    /// The amount cannot be represented in cache micro-units
    ExcessPrecision(String),
}

/// Outcome of one batched deduction call
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// Every deduction applied atomically
    Applied {
        balances: Vec<ApiBalance>,
        customer_changed: bool,
        changed_entity_ids: Vec<String>,
    },
    /// Rejected under the overage policy; nothing was written
    Insufficient {
        feature_id: String,
        requested: Decimal,
        available: Decimal,
    },
    /// Not applied; caller must run the durable deduction transaction
    Fallback(FallbackReason),
}

/// Script input: one deduction against one hash field
#[derive(Serialize)]
struct ScriptDeduction {
    field: String,
    amount: i64,
}

/// One updated field as reported by the script
#[derive(Deserialize)]
struct ScriptUpdate {
    field: String,
    scope: String,
    balance: CachedBalance,
}

#[derive(Deserialize)]
struct ScriptResponse {
    status: String,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    available: Option<i64>,
    #[serde(default)]
    updates: Vec<ScriptUpdate>,
}

/// Atomic batch deduction script.
///
/// KEYS[1] = customer scope hash, KEYS[2] = entity scope hash or "".
/// ARGV[1] = overage behavior, ARGV[2] = TTL secs, ARGV[3] = deductions JSON.
///
/// Resolution per deduction: the entity hash wins when it carries the field,
/// otherwise the customer hash. Two passes: validate and stage everything,
/// then write everything. A single failed validation aborts with no writes.
const BATCH_DEDUCT_SCRIPT: &str = r#"
local behavior = ARGV[1]
local ttl = tonumber(ARGV[2])
local deductions = cjson.decode(ARGV[3])

local staged = {}
local touched = {}

local function load_field(field)
    local cached = staged[field]
    if cached then
        return cached.key, cached.scope, cached.balance
    end
    if KEYS[2] ~= '' then
        local raw = redis.call('HGET', KEYS[2], field)
        if raw then
            return KEYS[2], 'entity', cjson.decode(raw)
        end
    end
    local raw = redis.call('HGET', KEYS[1], field)
    if raw then
        return KEYS[1], 'customer', cjson.decode(raw)
    end
    return nil, nil, nil
end

for i, d in ipairs(deductions) do
    local key, scope, bal = load_field(d.field)
    if not key then
        return cjson.encode({status = 'miss', field = d.field})
    end
    if bal.requires_durable then
        return cjson.encode({status = 'durable', field = d.field})
    end

    local new_current = bal.current_micros - d.amount
    local floor = bal.min_micros
    local has_floor = floor ~= nil and floor ~= cjson.null

    if behavior == 'reject' and has_floor and new_current < floor then
        return cjson.encode({
            status = 'insufficient',
            field = d.field,
            available = bal.current_micros - floor,
        })
    end
    if behavior == 'cap' and has_floor and new_current < floor then
        new_current = floor
    end

    local deducted = bal.current_micros - new_current
    bal.current_micros = new_current
    bal.usage_micros = bal.usage_micros + deducted

    -- drain the breakdown in stored (priority) order; the last entry
    -- absorbs any remainder so contributions stay consistent with the total
    local remaining = deducted
    local n = #bal.breakdown
    for j, b in ipairs(bal.breakdown) do
        if remaining == 0 then break end
        local take
        if j == n then
            take = remaining
        else
            take = math.min(b.balance_micros, remaining)
            if take < 0 then take = 0 end
        end
        b.balance_micros = b.balance_micros - take
        remaining = remaining - take
    end

    staged[d.field] = {key = key, scope = scope, balance = bal}
    touched[d.field] = true
end

local updates = {}
for field, s in pairs(staged) do
    redis.call('HSET', s.key, field, cjson.encode(s.balance))
    updates[#updates + 1] = {field = field, scope = s.scope, balance = s.balance}
end

redis.call('EXPIRE', KEYS[1], ttl)
if KEYS[2] ~= '' then
    redis.call('EXPIRE', KEYS[2], ttl)
end

return cjson.encode({status = 'ok', updates = updates})
"#;

/// Batching manager for one regional cache
///
/// Explicitly constructed and injected; owns its adapter handle.
pub struct BatchDeductManager {
    cache: RedisCache,
    ttl_secs: u64,
    script: Script,
}

impl BatchDeductManager {
    pub fn new(cache: RedisCache, ttl_secs: u64) -> Self {
        Self {
            cache,
            ttl_secs,
            script: Script::new(BATCH_DEDUCT_SCRIPT),
        }
    }

    /// Apply a batch of deductions to the cached scope, all or nothing
    ///
    /// Infrastructure faults are returned as `Fallback`, never as errors:
    /// the batching manager recovers every cache failure by routing the
    /// caller to the durable path.
    #[instrument(skip(self, deductions), fields(customer_id = %customer_id, org_id = %org_id))]
    pub async fn deduct(
        &self,
        customer_id: &str,
        deductions: &[BatchDeduction],
        org_id: &str,
        env: AppEnv,
        entity_id: Option<&str>,
        behavior: OverageBehavior,
    ) -> EngineResult<BatchOutcome> {
        let mut script_input = Vec::with_capacity(deductions.len());
        for d in deductions {
            let amount = match to_micros(d.amount) {
                Ok(m) => m,
                Err(e) => {
                    return Ok(BatchOutcome::Fallback(FallbackReason::ExcessPrecision(
                        e.to_string(),
                    )))
                }
            };
            script_input.push(ScriptDeduction {
                field: feature_field(&d.feature_id),
                amount,
            });
        }

        let customer_key = keys::customer_key(org_id, env, customer_id);
        let entity_key = entity_id
            .map(|e| keys::entity_key(org_id, env, customer_id, e))
            .unwrap_or_default();

        let payload = serde_json::to_string(&script_input)?;
        let mut conn = self.cache.connection();

        let raw: String = match self
            .script
            .key(&customer_key)
            .key(&entity_key)
            .arg(behavior.to_string())
            .arg(self.ttl_secs)
            .arg(payload)
            .invoke_async(&mut conn)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                let err = map_redis_error(e);
                warn!(error = %err, "Batch deduct script failed; falling back to durable path");
                return Ok(BatchOutcome::Fallback(FallbackReason::CacheFault(
                    err.to_string(),
                )));
            }
        };

        let response: ScriptResponse = serde_json::from_str(&raw)?;
        self.interpret(response, deductions, entity_id)
    }

    fn interpret(
        &self,
        response: ScriptResponse,
        deductions: &[BatchDeduction],
        entity_id: Option<&str>,
    ) -> EngineResult<BatchOutcome> {
        let field_feature = |field: Option<&String>| -> String {
            field
                .and_then(|f| keys::feature_from_field(f))
                .unwrap_or("unknown")
                .to_string()
        };

        match response.status.as_str() {
            "ok" => {
                let mut balances = Vec::with_capacity(response.updates.len());
                let mut customer_changed = false;
                let mut changed_entity_ids = Vec::new();

                for update in &response.updates {
                    let feature_id = field_feature(Some(&update.field));
                    balances.push(update.balance.to_api(&feature_id));
                    if update.scope == "entity" {
                        if let Some(entity) = entity_id {
                            if !changed_entity_ids.iter().any(|e| e == entity) {
                                changed_entity_ids.push(entity.to_string());
                            }
                        }
                    } else {
                        customer_changed = true;
                    }
                }

                debug!(
                    updated = response.updates.len(),
                    customer_changed, "Batch deduction applied in cache"
                );

                Ok(BatchOutcome::Applied {
                    balances,
                    customer_changed,
                    changed_entity_ids,
                })
            }
            "miss" => Ok(BatchOutcome::Fallback(FallbackReason::CacheMiss)),
            "durable" => Ok(BatchOutcome::Fallback(FallbackReason::RequiresDurablePath(
                field_feature(response.field.as_ref()),
            ))),
            "insufficient" => {
                let feature_id = field_feature(response.field.as_ref());
                let requested = deductions
                    .iter()
                    .find(|d| d.feature_id == feature_id)
                    .map(|d| d.amount)
                    .unwrap_or_default();
                Ok(BatchOutcome::Insufficient {
                    feature_id,
                    requested,
                    available: from_micros(response.available.unwrap_or(0)),
                })
            }
            other => Err(EngineError::Internal(format!(
                "unexpected batch script status: {}",
                other
            ))),
        }
    }
}
