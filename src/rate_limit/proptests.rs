//! Property-Based Tests for Token Accounting
//!
//! Invariants checked over random inputs:
//!
//! - **Refill**: after `t` idle seconds, `tokens == min(burst, tokens0 + t * rate)`
//! - **Bounds**: `0 <= tokens <= burst` after any sequence of consumes and clock moves
//! - **Conservation**: tokens granted never exceed burst plus tokens refilled
//! - **Quota wait time**: waiting the reported time always covers the request
//! - **Backoff**: retry delays stay within `[exponential, exponential + jitter]`
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib rate_limit::proptests
//! ```

use proptest::prelude::*;
use std::time::Duration;

use super::bucket::{ConsumeRequest, TokenBucket};
use super::config::RateLimitConfig;
use crate::quota::{PersistentQuota, QuotaLimits, Reservation};
use crate::retry::RetryPolicy;

// Helper: Generate a valid operation limit
fn arb_limit() -> impl Strategy<Value = RateLimitConfig> {
    (0.1f64..50.0, 1u32..50, 0u64..1_000).prop_map(|(rate, burst, min_delay)| {
        RateLimitConfig::new("prop.op", rate, burst).min_delay_ms(min_delay)
    })
}

// Helper: Clock moves, including backwards jumps
fn arb_steps() -> impl Strategy<Value = Vec<(i64, u32, bool)>> {
    prop::collection::vec((-2_000i64..5_000, 1u32..5, any::<bool>()), 1..60)
}

proptest! {
    /// Idle refill matches the closed form
    #[test]
    fn prop_refill_matches_closed_form(
        limit in arb_limit(),
        start_fraction in 0.0f64..=1.0,
        idle_ms in 0u64..120_000,
    ) {
        let burst = limit.burst_capacity as f64;
        let mut bucket = TokenBucket {
            tokens: burst * start_fraction,
            last_refill_at_ms: 1_000,
            last_request_at_ms: None,
            last_paced_at_ms: None,
        };
        let expected = (bucket.tokens + idle_ms as f64 / 1000.0 * limit.rate_per_second).min(burst);

        bucket.refill(&limit, 1_000 + idle_ms);
        prop_assert!((bucket.tokens - expected).abs() < 1e-6);
    }

    /// Refilling in pieces equals refilling once
    #[test]
    fn prop_split_refill_is_not_double_counted(
        limit in arb_limit(),
        cuts in prop::collection::vec(0u64..10_000, 1..20),
    ) {
        let mut once = TokenBucket {
            tokens: 0.0,
            last_refill_at_ms: 0,
            last_request_at_ms: None,
            last_paced_at_ms: None,
        };
        let mut pieces = once;

        let mut sorted = cuts.clone();
        sorted.sort_unstable();
        for at in &sorted {
            pieces.refill(&limit, *at);
            // Re-applying the same instant adds nothing
            pieces.refill(&limit, *at);
        }
        let end = *sorted.last().unwrap_or(&0);
        once.refill(&limit, end);

        prop_assert!((once.tokens - pieces.tokens).abs() < 1e-6);
    }

    /// Tokens stay within bounds and grants never outrun burst + refill
    #[test]
    fn prop_bounds_and_conservation(limit in arb_limit(), steps in arb_steps()) {
        let burst = limit.burst_capacity as f64;
        let mut now: u64 = 100_000;
        let mut bucket = TokenBucket::full(&limit, now);
        let mut high_water = now;
        let mut granted = 0.0;

        for (delta, tokens, paced) in steps {
            now = (now as i64 + delta).max(0) as u64;
            high_water = high_water.max(now);

            let request = if paced { ConsumeRequest::paced(tokens) } else { ConsumeRequest::burst(tokens) };
            if bucket.try_consume(&limit, request, now).is_granted() {
                granted += tokens as f64;
            }

            prop_assert!(bucket.tokens >= 0.0);
            prop_assert!(bucket.tokens <= burst + 1e-9);
        }

        // Refill is only ever credited up to the furthest time observed
        let refilled = (high_water - 100_000) as f64 / 1000.0 * limit.rate_per_second;
        prop_assert!(granted <= burst + refilled + 1e-6);
    }

    /// Waiting the reported quota wait time is always enough
    #[test]
    fn prop_quota_wait_time_is_sufficient(
        max_tokens in 1.0f64..1_000.0,
        regen in 0.5f64..500.0,
        available_fraction in 0.0f64..=1.0,
        request_fraction in 0.0f64..=1.0,
    ) {
        let limits = QuotaLimits::new(max_tokens, regen);
        let mut quota = PersistentQuota::full(&limits, 0);
        quota.available_tokens = max_tokens * available_fraction;
        let request = (max_tokens * request_fraction).ceil().min(max_tokens);

        let wait = quota.wait_time_for(request);
        let reservation = quota.try_reserve(request, wait.as_millis() as u64);
        let granted = matches!(reservation, Reservation::Granted { .. });
        prop_assert!(granted);
    }

    /// Backoff stays within the exponential envelope plus jitter
    #[test]
    fn prop_backoff_bounds(
        base_ms in 1u64..2_000,
        max_ms in 2_000u64..120_000,
        jitter_ms in 0u64..1_000,
        attempt in 0u32..40,
    ) {
        let policy = RetryPolicy::new()
            .base_delay(Duration::from_millis(base_ms))
            .max_delay(Duration::from_millis(max_ms))
            .max_jitter(Duration::from_millis(jitter_ms));

        let exponential = Duration::from_millis(base_ms)
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(Duration::from_millis(max_ms));
        let delay = policy.calculate_delay(attempt);

        prop_assert!(delay >= exponential);
        prop_assert!(delay <= exponential + Duration::from_millis(jitter_ms));
    }
}
