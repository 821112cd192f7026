//! Token Bucket Arithmetic
//!
//! Continuous-refill token bucket used by every [`BucketStore`](super::store::BucketStore)
//! backend. The Redis script in `redis_store` mirrors these rules exactly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::config::RateLimitConfig;

/// Slack for floating point drift when comparing token counts
const TOKEN_EPSILON: f64 = 1e-9;

/// Mutable bucket state for one operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Tokens currently available, `0 <= tokens <= burst_capacity`
    pub tokens: f64,

    /// Epoch ms up to which refill has been applied
    pub last_refill_at_ms: u64,

    /// Epoch ms of the most recent grant
    pub last_request_at_ms: Option<u64>,

    /// Epoch ms of the most recent paced grant. Burst requests must also
    /// keep `min_delay_ms` away from it, so spacing survives a drained queue.
    #[serde(default)]
    pub last_paced_at_ms: Option<u64>,
}

/// A request to take tokens from a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeRequest {
    /// Tokens to deduct
    pub tokens: u32,

    /// Also require `min_delay_ms` since the previous grant
    pub enforce_min_delay: bool,
}

impl ConsumeRequest {
    /// Uncontended request: burst capacity may be spent back to back, but
    /// not within `min_delay_ms` of a paced grant
    pub fn burst(tokens: u32) -> Self {
        Self {
            tokens,
            enforce_min_delay: false,
        }
    }

    /// Queued request: grants are spaced by the operation's minimum delay
    pub fn paced(tokens: u32) -> Self {
        Self {
            tokens,
            enforce_min_delay: true,
        }
    }
}

/// Result of an atomic refill-and-consume
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsumeOutcome {
    /// Tokens were deducted
    Granted { remaining: f64 },

    /// Nothing was deducted; try again after `retry_after`
    Denied { retry_after: Duration, available: f64 },
}

impl ConsumeOutcome {
    /// Whether tokens were granted
    pub fn is_granted(&self) -> bool {
        matches!(self, ConsumeOutcome::Granted { .. })
    }
}

impl TokenBucket {
    /// A full bucket as of `now_ms`
    pub fn full(limit: &RateLimitConfig, now_ms: u64) -> Self {
        Self {
            tokens: limit.burst_capacity as f64,
            last_refill_at_ms: now_ms,
            last_request_at_ms: None,
            last_paced_at_ms: None,
        }
    }

    /// Apply refill for the time elapsed since the last refill.
    ///
    /// Elapsed time is clamped at zero, and `last_refill_at_ms` only moves
    /// forward, so an interval is never credited twice.
    pub fn refill(&mut self, limit: &RateLimitConfig, now_ms: u64) {
        if now_ms <= self.last_refill_at_ms {
            return;
        }
        let elapsed_secs = (now_ms - self.last_refill_at_ms) as f64 / 1000.0;
        let capacity = limit.burst_capacity as f64;
        self.tokens = (self.tokens + elapsed_secs * limit.rate_per_second).min(capacity);
        self.last_refill_at_ms = now_ms;
    }

    /// Copy of this bucket refilled to `now_ms`, without mutating it
    pub fn refilled(&self, limit: &RateLimitConfig, now_ms: u64) -> Self {
        let mut copy = *self;
        copy.refill(limit, now_ms);
        copy
    }

    /// Whether at least `tokens` tokens are available
    pub fn covers(&self, tokens: f64) -> bool {
        self.tokens + TOKEN_EPSILON >= tokens
    }

    /// Remaining part of the minimum delay since the last grant
    pub fn min_delay_remaining(&self, limit: &RateLimitConfig, now_ms: u64) -> Duration {
        delay_left(limit, self.last_request_at_ms, now_ms)
    }

    /// Remaining part of the minimum delay since the last paced grant
    pub fn paced_delay_remaining(&self, limit: &RateLimitConfig, now_ms: u64) -> Duration {
        delay_left(limit, self.last_paced_at_ms, now_ms)
    }

    /// Time until `tokens` tokens are available, assuming no other consumer
    pub fn time_until_available(&self, limit: &RateLimitConfig, tokens: f64) -> Duration {
        let missing = tokens - self.tokens;
        if missing <= TOKEN_EPSILON {
            return Duration::ZERO;
        }
        let millis = (missing / limit.rate_per_second * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }

    /// Refill, then deduct the requested tokens if the bucket allows it
    pub fn try_consume(
        &mut self,
        limit: &RateLimitConfig,
        request: ConsumeRequest,
        now_ms: u64,
    ) -> ConsumeOutcome {
        self.refill(limit, now_ms);

        let needed = request.tokens as f64;
        let delay_left = if request.enforce_min_delay {
            self.min_delay_remaining(limit, now_ms)
        } else {
            self.paced_delay_remaining(limit, now_ms)
        };

        if self.covers(needed) && delay_left.is_zero() {
            self.tokens = (self.tokens - needed).max(0.0);
            self.last_request_at_ms = Some(now_ms);
            if request.enforce_min_delay {
                self.last_paced_at_ms = Some(now_ms);
            }
            return ConsumeOutcome::Granted {
                remaining: self.tokens,
            };
        }

        let token_wait = self.time_until_available(limit, needed);
        ConsumeOutcome::Denied {
            retry_after: token_wait.max(delay_left),
            available: self.tokens,
        }
    }
}

fn delay_left(limit: &RateLimitConfig, last_ms: Option<u64>, now_ms: u64) -> Duration {
    match last_ms {
        Some(last) if limit.min_delay_ms > 0 => {
            let since = now_ms.saturating_sub(last);
            Duration::from_millis(limit.min_delay_ms.saturating_sub(since))
        }
        _ => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit() -> RateLimitConfig {
        RateLimitConfig::new("test.op", 2.0, 4)
    }

    #[test]
    fn test_full_bucket() {
        let bucket = TokenBucket::full(&limit(), 1_000);
        assert_eq!(bucket.tokens, 4.0);
        assert_eq!(bucket.last_request_at_ms, None);
    }

    #[test]
    fn test_refill_is_continuous_and_capped() {
        let limit = limit();
        let mut bucket = TokenBucket {
            tokens: 0.0,
            last_refill_at_ms: 0,
            last_request_at_ms: None,
            last_paced_at_ms: None,
        };

        bucket.refill(&limit, 250);
        assert!((bucket.tokens - 0.5).abs() < 1e-9);

        bucket.refill(&limit, 10_000);
        assert_eq!(bucket.tokens, 4.0);
    }

    #[test]
    fn test_refill_not_applied_twice() {
        let limit = limit();
        let mut bucket = TokenBucket {
            tokens: 0.0,
            last_refill_at_ms: 0,
            last_request_at_ms: None,
            last_paced_at_ms: None,
        };

        bucket.refill(&limit, 500);
        bucket.refill(&limit, 500);
        assert!((bucket.tokens - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_backwards_time_does_not_drain() {
        let limit = limit();
        let mut bucket = TokenBucket {
            tokens: 1.0,
            last_refill_at_ms: 5_000,
            last_request_at_ms: None,
            last_paced_at_ms: None,
        };

        bucket.refill(&limit, 1_000);
        assert_eq!(bucket.tokens, 1.0);
        assert_eq!(bucket.last_refill_at_ms, 5_000);
    }

    #[test]
    fn test_consume_and_deny() {
        let limit = limit();
        let mut bucket = TokenBucket::full(&limit, 0);

        assert!(bucket.try_consume(&limit, ConsumeRequest::burst(3), 0).is_granted());
        match bucket.try_consume(&limit, ConsumeRequest::burst(2), 0) {
            ConsumeOutcome::Denied {
                retry_after,
                available,
            } => {
                assert_eq!(retry_after, Duration::from_millis(500));
                assert!((available - 1.0).abs() < 1e-9);
            }
            other => panic!("expected denial, got {:?}", other),
        }
        // Denial leaves tokens untouched
        assert!((bucket.tokens - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_paced_request_waits_for_min_delay() {
        let limit = RateLimitConfig::new("paced", 10.0, 5).min_delay_ms(500);
        let mut bucket = TokenBucket::full(&limit, 0);

        assert!(bucket.try_consume(&limit, ConsumeRequest::burst(1), 0).is_granted());

        // Tokens are there, but the spacing is not
        match bucket.try_consume(&limit, ConsumeRequest::paced(1), 100) {
            ConsumeOutcome::Denied { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_millis(400))
            }
            other => panic!("expected denial, got {:?}", other),
        }

        // Burst requests ignore spacing
        assert!(bucket.try_consume(&limit, ConsumeRequest::burst(1), 100).is_granted());

        assert!(bucket.try_consume(&limit, ConsumeRequest::paced(1), 600).is_granted());
    }

    #[test]
    fn test_burst_keeps_spacing_after_paced_grant() {
        let limit = RateLimitConfig::new("paced", 10.0, 5).min_delay_ms(300);
        let mut bucket = TokenBucket::full(&limit, 0);

        assert!(bucket.try_consume(&limit, ConsumeRequest::paced(1), 0).is_granted());
        assert_eq!(bucket.last_paced_at_ms, Some(0));

        match bucket.try_consume(&limit, ConsumeRequest::burst(1), 0) {
            ConsumeOutcome::Denied { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_millis(300))
            }
            other => panic!("expected denial, got {:?}", other),
        }
        match bucket.try_consume(&limit, ConsumeRequest::burst(1), 200) {
            ConsumeOutcome::Denied { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_millis(100))
            }
            other => panic!("expected denial, got {:?}", other),
        }

        let granted = bucket.try_consume(&limit, ConsumeRequest::burst(1), 300);
        assert!(granted.is_granted());
        // A burst grant does not restart the paced clock
        assert_eq!(bucket.last_paced_at_ms, Some(0));
    }

    #[test]
    fn test_time_until_available_rounds_up() {
        let limit = RateLimitConfig::new("thirds", 3.0, 1);
        let bucket = TokenBucket {
            tokens: 0.0,
            last_refill_at_ms: 0,
            last_request_at_ms: None,
            last_paced_at_ms: None,
        };
        let wait = bucket.time_until_available(&limit, 1.0);
        assert_eq!(wait, Duration::from_millis(334));

        let after = bucket.refilled(&limit, 334);
        assert!(after.tokens >= 1.0);
    }
}
