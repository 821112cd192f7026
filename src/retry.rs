//! Retry Coordinator
//!
//! Wraps an upstream call with the rate limiter and the operation's circuit
//! breaker, and retries it with exponential backoff when the upstream
//! reports throttling.
//!
//! Only rate-limit failures (HTTP 429, explicit quota-exceeded signals) are
//! retried here. Every other failure propagates on the first attempt; whether
//! a generic failure is worth retrying is the caller's decision.
//!
//! # Example
//!
//! ```ignore
//! let coordinator = RetryCoordinator::new(limiter, breakers, RetryPolicy::default());
//!
//! let offers = coordinator
//!     .with_retry("pricing.item_offers", || async {
//!         client.item_offers(&asin).await.map_err(CallError::classify)
//!     }, 3)
//!     .await?;
//! ```

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerRegistry, CircuitError};
use crate::error::CoordinatorError;
use crate::metrics;
use crate::quota::QuotaTracker;
use crate::rate_limit::RateLimiter;

/// Failure reported by a wrapped upstream call
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Upstream throttled the call
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,

        /// Upstream's own retry hint, if it sent one
        retry_after: Option<Duration>,

        /// Upstream's authoritative remaining quota, if it sent one
        remaining_quota: Option<f64>,
    },

    /// Any other failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    /// Throttling error with no hints
    pub fn rate_limited(message: impl Into<String>) -> Self {
        CallError::RateLimited {
            message: message.into(),
            retry_after: None,
            remaining_quota: None,
        }
    }

    /// Attach the upstream retry hint
    pub fn with_retry_after(mut self, hint: Duration) -> Self {
        if let CallError::RateLimited { retry_after, .. } = &mut self {
            *retry_after = Some(hint);
        }
        self
    }

    /// Attach the upstream's remaining quota
    pub fn with_remaining_quota(mut self, remaining: f64) -> Self {
        if let CallError::RateLimited {
            remaining_quota, ..
        } = &mut self
        {
            *remaining_quota = Some(remaining);
        }
        self
    }

    /// Build from an HTTP status and response message
    pub fn from_status(status: u16, message: &str) -> Self {
        if is_rate_limit_status(status) {
            CallError::rate_limited(format!("HTTP {}: {}", status, message))
        } else {
            CallError::Other(anyhow::anyhow!("HTTP {}: {}", status, message))
        }
    }

    /// Classify an arbitrary error by its message.
    ///
    /// Rate-limit signals:
    /// - HTTP 429 / "too many requests"
    /// - "rate limit" / "rate exceeded" / "throttl..."
    /// - "quota exceeded" / "quota exhausted"
    pub fn classify(error: anyhow::Error) -> Self {
        let message = error.to_string();
        let lower = message.to_lowercase();

        let throttled = lower.contains("429")
            || lower.contains("too many requests")
            || lower.contains("rate limit")
            || lower.contains("rate exceeded")
            || lower.contains("throttl")
            || lower.contains("quota exceeded")
            || lower.contains("quota exhausted");

        if throttled {
            CallError::rate_limited(message)
        } else {
            CallError::Other(error)
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, CallError::RateLimited { .. })
    }

    fn into_coordinator(self, operation: &str) -> CoordinatorError {
        match self {
            CallError::RateLimited {
                message,
                retry_after,
                ..
            } => CoordinatorError::RateLimited {
                operation: operation.to_string(),
                retry_after,
                message,
            },
            CallError::Other(source) => CoordinatorError::Upstream {
                operation: operation.to_string(),
                source,
            },
        }
    }
}

/// Whether an HTTP status code signals throttling
pub fn is_rate_limit_status(status: u16) -> bool {
    status == 429
}

/// Backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt when no explicit bound is given
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Cap on the exponential part of the delay
    pub max_delay: Duration,

    /// Upper bound of the uniform jitter added to every delay
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Delay before retry number `attempt + 1`:
    /// `min(max_delay, base_delay * 2^attempt) + uniform(0..=max_jitter)`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay);

        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };

        exponential + jitter
    }
}

/// Reconciliation target for upstream-reported remaining quota
#[derive(Debug, Clone)]
struct QuotaLink {
    tracker: Arc<QuotaTracker>,
    owner: String,
}

/// Limiter + breaker + backoff around upstream calls
#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    policy: RetryPolicy,
    quota: Option<QuotaLink>,
}

impl RetryCoordinator {
    pub fn new(limiter: RateLimiter, breakers: BreakerRegistry, policy: RetryPolicy) -> Self {
        Self {
            limiter,
            breakers,
            policy,
            quota: None,
        }
    }

    /// Reconcile `owner` in `tracker` whenever a throttled call reports its remaining quota
    pub fn with_quota(mut self, tracker: Arc<QuotaTracker>, owner: &str) -> Self {
        self.quota = Some(QuotaLink {
            tracker,
            owner: owner.to_string(),
        });
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// [`with_retry`](Self::with_retry) using the policy's `max_retries`
    pub async fn call<F, Fut, T>(&self, operation: &str, call: F) -> Result<T, CoordinatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.with_retry(operation, call, self.policy.max_retries)
            .await
    }

    /// Run `call` for `operation`, retrying throttled attempts up to `max_retries` times.
    ///
    /// Each attempt fails fast if the operation's circuit is open, then
    /// acquires one token, then runs the call through the breaker. Limiter
    /// and breaker errors are returned as-is; an exhausted retry budget
    /// returns [`CoordinatorError::RetryExhausted`] wrapping the last error.
    pub async fn with_retry<F, Fut, T>(
        &self,
        operation: &str,
        mut call: F,
        max_retries: u32,
    ) -> Result<T, CoordinatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let breaker = self.breakers.get(operation)?;
        let mut attempt: u32 = 0;

        loop {
            // Do not spend a token on a call the breaker would refuse
            if let Some(retry_after) = breaker.rejection() {
                return Err(CoordinatorError::CircuitOpen {
                    name: breaker.name().to_string(),
                    retry_after,
                });
            }

            self.limiter.acquire(operation, 1).await?;

            let err = match breaker.execute(&mut call).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempt = attempt + 1, "Call succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(CircuitError::Open { name, retry_after }) => {
                    return Err(CoordinatorError::CircuitOpen { name, retry_after });
                }
                Err(CircuitError::Call(err)) => err,
            };

            if let CallError::RateLimited {
                remaining_quota: Some(remaining),
                ..
            } = &err
            {
                self.reconcile_quota(operation, *remaining).await;
            }

            if !err.is_rate_limit() {
                debug!(operation, error = %err, "Call failed, not retrying");
                return Err(err.into_coordinator(operation));
            }

            let err = err.into_coordinator(operation);
            if attempt >= max_retries {
                warn!(operation, attempts = attempt + 1, "Retries exhausted");
                return Err(CoordinatorError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let mut delay = self.policy.calculate_delay(attempt);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }

            metrics::RETRIES_TOTAL.with_label_values(&[operation]).inc();
            warn!(
                operation,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Upstream throttled, backing off"
            );
            sleep(delay).await;
            attempt += 1;
        }
    }

    async fn reconcile_quota(&self, operation: &str, remaining: f64) {
        let Some(link) = &self.quota else {
            return;
        };
        if let Err(err) = link.tracker.reconcile_now(&link.owner, remaining).await {
            warn!(operation, owner = %link.owner, error = %err, "Failed to reconcile quota");
        }
    }
}
