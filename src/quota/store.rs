//! Quota Store
//!
//! Regenerating per-owner budgets and the backends that hold them. As with
//! token buckets, every mutation goes through one atomic store call that
//! refills and then reserves or overwrites.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;

const TOKEN_EPSILON: f64 = 1e-9;

/// Budget parameters shared by every owner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_tokens: f64,
    pub regen_per_minute: f64,
}

impl QuotaLimits {
    pub fn new(max_tokens: f64, regen_per_minute: f64) -> Self {
        Self {
            max_tokens,
            regen_per_minute,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.max_tokens.is_finite() || self.max_tokens <= 0.0 {
            anyhow::bail!("Quota max_tokens must be > 0, got {}", self.max_tokens);
        }
        if !self.regen_per_minute.is_finite() || self.regen_per_minute <= 0.0 {
            anyhow::bail!(
                "Quota regen_per_minute must be > 0, got {}",
                self.regen_per_minute
            );
        }
        Ok(())
    }
}

/// Stored budget for one owner
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistentQuota {
    pub available_tokens: f64,
    pub last_refill_at_ms: u64,
    pub regen_rate_per_minute: f64,
    pub max_tokens: f64,
}

/// Outcome of a reservation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Reservation {
    Granted {
        remaining: f64,
    },
    Insufficient {
        available: f64,
        #[serde(with = "duration_ms")]
        wait: Duration,
    },
}

impl Reservation {
    pub fn is_granted(&self) -> bool {
        matches!(self, Reservation::Granted { .. })
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl PersistentQuota {
    /// A full budget as of `now_ms`
    pub fn full(limits: &QuotaLimits, now_ms: u64) -> Self {
        Self {
            available_tokens: limits.max_tokens,
            last_refill_at_ms: now_ms,
            regen_rate_per_minute: limits.regen_per_minute,
            max_tokens: limits.max_tokens,
        }
    }

    /// Adopt the configured limits, clamping the stored balance to the new cap
    pub fn apply_limits(&mut self, limits: &QuotaLimits) {
        self.regen_rate_per_minute = limits.regen_per_minute;
        self.max_tokens = limits.max_tokens;
        self.available_tokens = self.available_tokens.clamp(0.0, self.max_tokens);
    }

    /// `min(max_tokens, stored + elapsed_minutes * regen)`; elapsed clamps at zero
    pub fn refill(&mut self, now_ms: u64) {
        if now_ms <= self.last_refill_at_ms {
            return;
        }
        let elapsed_minutes = (now_ms - self.last_refill_at_ms) as f64 / 60_000.0;
        self.available_tokens = (self.available_tokens
            + elapsed_minutes * self.regen_rate_per_minute)
            .min(self.max_tokens);
        self.last_refill_at_ms = now_ms;
    }

    pub fn refilled(&self, now_ms: u64) -> Self {
        let mut copy = *self;
        copy.refill(now_ms);
        copy
    }

    /// `ceil((tokens - available) / regen * 60)` seconds, zero when already covered
    pub fn wait_time_for(&self, tokens: f64) -> Duration {
        let missing = tokens - self.available_tokens;
        if missing <= TOKEN_EPSILON {
            return Duration::ZERO;
        }
        let secs = (missing / self.regen_rate_per_minute * 60.0).ceil();
        Duration::from_secs(secs as u64)
    }

    /// Refill, then deduct `tokens` if available
    pub fn try_reserve(&mut self, tokens: f64, now_ms: u64) -> Reservation {
        self.refill(now_ms);
        if self.available_tokens + TOKEN_EPSILON >= tokens {
            self.available_tokens = (self.available_tokens - tokens).max(0.0);
            Reservation::Granted {
                remaining: self.available_tokens,
            }
        } else {
            Reservation::Insufficient {
                available: self.available_tokens,
                wait: self.wait_time_for(tokens),
            }
        }
    }

    /// Replace the local estimate with an authoritative count observed at `observed_at_ms`.
    ///
    /// An observation stamped ahead of the store clock is taken as `now_ms`,
    /// otherwise regeneration would stall until the clock caught up.
    pub fn reconcile(&mut self, authoritative: f64, observed_at_ms: u64, now_ms: u64) {
        self.available_tokens = authoritative.clamp(0.0, self.max_tokens);
        self.last_refill_at_ms = observed_at_ms.min(now_ms);
    }
}

/// Quota state refilled to the store's current time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub quota: PersistentQuota,
    pub observed_at_ms: u64,
}

/// Backend holding persistent quotas
#[async_trait]
pub trait QuotaStore: Send + Sync + Debug {
    /// Atomically refill and reserve `tokens` for `owner`
    async fn reserve(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        tokens: f64,
    ) -> Result<Reservation, StoreError>;

    /// Current state without mutating the store
    async fn snapshot(&self, owner: &str, limits: &QuotaLimits) -> Result<QuotaSnapshot, StoreError>;

    /// Overwrite the balance with an authoritative count.
    /// `observed_at_ms = None` means "now" on the store's clock.
    async fn reconcile(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        authoritative: f64,
        observed_at_ms: Option<u64>,
    ) -> Result<PersistentQuota, StoreError>;

    fn backend(&self) -> &'static str;
}

/// Run `f` against the owner's quota, creating a full one on first use
pub(crate) fn with_quota<R>(
    quotas: &mut HashMap<String, PersistentQuota>,
    owner: &str,
    limits: &QuotaLimits,
    now_ms: u64,
    f: impl FnOnce(&mut PersistentQuota) -> R,
) -> R {
    let quota = quotas
        .entry(owner.to_string())
        .or_insert_with(|| PersistentQuota::full(limits, now_ms));
    quota.apply_limits(limits);
    f(quota)
}

/// In-process quota store; state is lost on restart
#[derive(Debug, Clone)]
pub struct MemoryQuotaStore {
    quotas: Arc<Mutex<HashMap<String, PersistentQuota>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            quotas: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn update<R>(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        f: impl FnOnce(&mut PersistentQuota, u64) -> R,
    ) -> Result<R, StoreError> {
        let mut quotas = self
            .quotas
            .lock()
            .map_err(|_| StoreError::Corrupt("quota map lock poisoned".to_string()))?;
        let now_ms = self.clock.now_ms();
        Ok(with_quota(&mut quotas, owner, limits, now_ms, |quota| {
            f(quota, now_ms)
        }))
    }
}

impl Default for MemoryQuotaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn reserve(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        tokens: f64,
    ) -> Result<Reservation, StoreError> {
        self.update(owner, limits, |quota, now_ms| quota.try_reserve(tokens, now_ms))
    }

    async fn snapshot(&self, owner: &str, limits: &QuotaLimits) -> Result<QuotaSnapshot, StoreError> {
        self.update(owner, limits, |quota, now_ms| QuotaSnapshot {
            quota: quota.refilled(now_ms),
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
        self.update(owner, limits, |quota, now_ms| {
            quota.reconcile(authoritative, observed_at_ms.unwrap_or(now_ms), now_ms);
            *quota
        })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
