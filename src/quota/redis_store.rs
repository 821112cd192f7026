//! Redis-backed quota store.
//!
//! Same layout as the bucket store: one hash per owner with `tokens` and
//! `last_refill`, updated by a Lua script against Redis server time. Quota
//! keys never expire.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;

use super::store::{PersistentQuota, QuotaLimits, QuotaSnapshot, QuotaStore, Reservation};
use crate::error::StoreError;

/// ARGV: max_tokens, regen_per_minute, mode, amount, observed_at_ms (-1 = now)
/// mode: "peek" | "reserve" | "reconcile"
/// Returns: {status, tokens, last_refill_ms, now_ms}
const QUOTA_SCRIPT: &str = r#"
local time_array = redis.call("TIME")
local now_ms = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

local key = KEYS[1]
local max_tokens = tonumber(ARGV[1])
local regen = tonumber(ARGV[2])
local mode = ARGV[3]
local amount = tonumber(ARGV[4])
local observed_at = tonumber(ARGV[5])

local state = redis.call("HMGET", key, "tokens", "last_refill")
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])

if tokens == nil or last_refill == nil then
    tokens = max_tokens
    last_refill = now_ms
end
tokens = math.max(0, math.min(tokens, max_tokens))

if now_ms > last_refill then
    tokens = math.min(max_tokens, tokens + (now_ms - last_refill) / 60000 * regen)
    last_refill = now_ms
end

local status = "ok"
if mode == "peek" then
    return {status, tostring(tokens), string.format("%d", last_refill), now_ms}
elseif mode == "reserve" then
    if tokens + 1e-9 >= amount then
        tokens = math.max(0, tokens - amount)
        status = "granted"
    else
        status = "insufficient"
    end
elseif mode == "reconcile" then
    tokens = math.max(0, math.min(amount, max_tokens))
    if observed_at >= 0 then
        last_refill = math.min(observed_at, now_ms)
    else
        last_refill = now_ms
    end
end

redis.call("HSET", key, "tokens", tostring(tokens), "last_refill", string.format("%d", last_refill))
return {status, tostring(tokens), string.format("%d", last_refill), now_ms}
"#;

/// Shared quota store on Redis
#[derive(Clone)]
pub struct RedisQuotaStore {
    connection: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl fmt::Debug for RedisQuotaStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQuotaStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

type ScriptReply = (String, String, String, i64);

impl RedisQuotaStore {
    /// Connect with the default prefix "ratekeeper:quota:"
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_prefix(url, "ratekeeper:quota:").await
    }

    pub async fn connect_with_prefix(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            script: Script::new(QUOTA_SCRIPT),
            key_prefix: key_prefix.to_string(),
        })
    }

    async fn invoke(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        mode: &str,
        amount: f64,
        observed_at_ms: Option<u64>,
    ) -> Result<(String, PersistentQuota, u64), StoreError> {
        let mut connection = self.connection.clone();
        let (status, tokens, last_refill, now_ms): ScriptReply = self
            .script
            .key(format!("{}{}", self.key_prefix, owner))
            .arg(limits.max_tokens)
            .arg(limits.regen_per_minute)
            .arg(mode)
            .arg(amount)
            .arg(observed_at_ms.map(|ms| ms as i64).unwrap_or(-1))
            .invoke_async(&mut connection)
            .await?;

        let quota = PersistentQuota {
            available_tokens: parse_number(&tokens)?,
            last_refill_at_ms: parse_number(&last_refill)? as u64,
            regen_rate_per_minute: limits.regen_per_minute,
            max_tokens: limits.max_tokens,
        };
        Ok((status, quota, now_ms.max(0) as u64))
    }
}

fn parse_number(raw: &str) -> Result<f64, StoreError> {
    raw.parse::<f64>()
        .map_err(|_| StoreError::Corrupt(format!("quota field '{}' is not a number", raw)))
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn reserve(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        tokens: f64,
    ) -> Result<Reservation, StoreError> {
        let (status, quota, _) = self.invoke(owner, limits, "reserve", tokens, None).await?;
        match status.as_str() {
            "granted" => Ok(Reservation::Granted {
                remaining: quota.available_tokens,
            }),
            "insufficient" => Ok(Reservation::Insufficient {
                available: quota.available_tokens,
                wait: quota.wait_time_for(tokens),
            }),
            other => Err(StoreError::Corrupt(format!(
                "unexpected quota script status '{}'",
                other
            ))),
        }
    }

    async fn snapshot(&self, owner: &str, limits: &QuotaLimits) -> Result<QuotaSnapshot, StoreError> {
        let (_, quota, now_ms) = self.invoke(owner, limits, "peek", 0.0, None).await?;
        Ok(QuotaSnapshot {
            quota,
            observed_at_ms: now_ms,
        })
    }

    async fn reconcile(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        authoritative: f64,
        observed_at_ms: Option<u64>,
    ) -> Result<PersistentQuota, StoreError> {
        let (_, quota, _) = self
            .invoke(owner, limits, "reconcile", authoritative, observed_at_ms)
            .await?;
        Ok(quota)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
