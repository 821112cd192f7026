//! Redis-backed token bucket store.
//!
//! Shares bucket state between processes. Refill and the conditional
//! decrement run inside one Lua script, so two workers can never both observe
//! "enough tokens" and both deduct. The script reads Redis server `TIME`,
//! which keeps every worker on a single clock regardless of local skew.
//!
//! Each bucket is a hash `{prefix}{operation}` with the fields `tokens`,
//! `last_refill`, `last_request` and `last_paced`. Keys expire once a bucket has been idle
//! long enough to be full again.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::bucket::{ConsumeOutcome, ConsumeRequest, TokenBucket};
use super::config::RateLimitConfig;
use super::store::{BucketSnapshot, BucketStore};
use crate::error::StoreError;

/// Refill, then conditionally deduct. Mirrors `TokenBucket::try_consume`.
///
/// ARGV: rate/s, burst, requested, enforce_min_delay, min_delay_ms, ttl_ms, consume
/// Returns: {status, tokens, retry_after_ms, now_ms, last_request_ms or -1, last_paced_ms or -1}
const CONSUME_SCRIPT: &str = r#"
local time_array = redis.call("TIME")
local now_ms = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

local key = KEYS[1]
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local enforce_delay = tonumber(ARGV[4]) == 1
local min_delay_ms = tonumber(ARGV[5])
local ttl_ms = tonumber(ARGV[6])
local consume = tonumber(ARGV[7]) == 1

local state = redis.call("HMGET", key, "tokens", "last_refill", "last_request", "last_paced")
local tokens = tonumber(state[1])
local last_refill = tonumber(state[2])
local last_request = tonumber(state[3])
local last_paced = tonumber(state[4])

if tokens == nil or last_refill == nil then
    tokens = burst
    last_refill = now_ms
end

if now_ms > last_refill then
    tokens = math.min(burst, tokens + (now_ms - last_refill) / 1000 * rate)
    last_refill = now_ms
end

if not consume then
    return {"snapshot", tostring(tokens), 0, now_ms, last_request or -1, last_paced or -1}
end

-- Paced requests keep away from any grant, burst requests from paced ones
local spacing_from = last_paced
if enforce_delay then
    spacing_from = last_request
end
local delay_left = 0
if spacing_from and min_delay_ms > 0 then
    delay_left = math.max(0, min_delay_ms - (now_ms - spacing_from))
end

local status = "denied"
local retry_after = 0
if tokens + 1e-9 >= requested and delay_left == 0 then
    tokens = math.max(0, tokens - requested)
    last_request = now_ms
    if enforce_delay then
        last_paced = now_ms
    end
    status = "granted"
else
    local missing = requested - tokens
    if missing > 1e-9 then
        retry_after = math.ceil(missing / rate * 1000)
    end
    retry_after = math.max(retry_after, delay_left)
end

redis.call("HSET", key, "tokens", tostring(tokens), "last_refill", string.format("%d", last_refill))
if last_request then
    redis.call("HSET", key, "last_request", string.format("%d", last_request))
end
if last_paced then
    redis.call("HSET", key, "last_paced", string.format("%d", last_paced))
end
redis.call("PEXPIRE", key, ttl_ms)

return {status, tostring(tokens), retry_after, now_ms, last_request or -1, last_paced or -1}
"#;

/// Configuration for [`RedisBucketStore`]
#[derive(Debug, Clone)]
pub struct RedisBucketStoreConfig {
    /// Prefix for bucket keys (default: "ratekeeper:bucket:")
    pub key_prefix: String,

    /// Extra lifetime added to an idle bucket beyond its full-refill time
    pub idle_grace: Duration,
}

impl Default for RedisBucketStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratekeeper:bucket:".to_string(),
            idle_grace: Duration::from_secs(60),
        }
    }
}

/// Shared token bucket store on Redis
#[derive(Clone)]
pub struct RedisBucketStore {
    connection: ConnectionManager,
    script: Script,
    config: RedisBucketStoreConfig,
}

impl fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("config", &self.config)
            .finish()
    }
}

type ScriptReply = (String, String, i64, i64, i64, i64);

impl RedisBucketStore {
    /// Connect with the default key prefix
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisBucketStoreConfig::default()).await
    }

    /// Connect with a custom configuration
    pub async fn connect_with_config(
        url: &str,
        config: RedisBucketStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        debug!(prefix = %config.key_prefix, "Connected Redis bucket store");
        Ok(Self::with_connection(connection, config))
    }

    /// Build from an existing connection manager
    pub fn with_connection(connection: ConnectionManager, config: RedisBucketStoreConfig) -> Self {
        Self {
            connection,
            script: Script::new(CONSUME_SCRIPT),
            config,
        }
    }

    fn key(&self, operation: &str) -> String {
        format!("{}{}", self.config.key_prefix, operation)
    }

    fn ttl_ms(&self, limit: &RateLimitConfig) -> u64 {
        let refill = limit.refill_time(limit.burst_capacity as f64);
        let idle = refill.max(limit.min_delay()) + self.config.idle_grace;
        idle.as_millis() as u64
    }

    async fn invoke(
        &self,
        limit: &RateLimitConfig,
        request: ConsumeRequest,
        consume: bool,
    ) -> Result<ScriptReply, StoreError> {
        let mut connection = self.connection.clone();
        let reply: ScriptReply = self
            .script
            .key(self.key(&limit.operation))
            .arg(limit.rate_per_second)
            .arg(limit.burst_capacity)
            .arg(request.tokens)
            .arg(u8::from(request.enforce_min_delay))
            .arg(limit.min_delay_ms)
            .arg(self.ttl_ms(limit))
            .arg(u8::from(consume))
            .invoke_async(&mut connection)
            .await?;
        Ok(reply)
    }
}

fn parse_tokens(raw: &str) -> Result<f64, StoreError> {
    raw.parse::<f64>()
        .map_err(|_| StoreError::Corrupt(format!("token count '{}' is not a number", raw)))
}

fn stored_timestamp(raw: i64) -> Option<u64> {
    (raw >= 0).then_some(raw as u64)
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn try_consume(
        &self,
        limit: &RateLimitConfig,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome, StoreError> {
        let (status, tokens, retry_after_ms, _, _, _) = self.invoke(limit, request, true).await?;
        let tokens = parse_tokens(&tokens)?;

        match status.as_str() {
            "granted" => Ok(ConsumeOutcome::Granted { remaining: tokens }),
            "denied" => Ok(ConsumeOutcome::Denied {
                retry_after: Duration::from_millis(retry_after_ms.max(0) as u64),
                available: tokens,
            }),
            other => Err(StoreError::Corrupt(format!(
                "unexpected script status '{}'",
                other
            ))),
        }
    }

    async fn snapshot(&self, limit: &RateLimitConfig) -> Result<BucketSnapshot, StoreError> {
        let (_, tokens, _, now_ms, last, paced) = self
            .invoke(limit, ConsumeRequest::burst(0), false)
            .await?;
        let now_ms = now_ms.max(0) as u64;

        Ok(BucketSnapshot {
            bucket: TokenBucket {
                tokens: parse_tokens(&tokens)?,
                last_refill_at_ms: now_ms,
                last_request_at_ms: stored_timestamp(last),
                last_paced_at_ms: stored_timestamp(paced),
            },
            observed_at_ms: now_ms,
        })
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
