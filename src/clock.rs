//! Clock Port
//!
//! Token and quota arithmetic reads time through the [`Clock`] trait so the
//! in-process stores can be driven deterministically in tests.
//!
//! Timestamps are milliseconds since the Unix epoch. Stores treat a reading
//! earlier than the last recorded one as "no time elapsed" rather than as a
//! negative interval.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt::Debug;

/// Source of the current time in epoch milliseconds
pub trait Clock: Send + Sync + Debug {
    /// Current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;

    /// Current time as a UTC timestamp
    fn now_utc(&self) -> DateTime<Utc> {
        ms_to_utc(self.now_ms())
    }
}

/// Convert epoch milliseconds to a UTC timestamp
pub fn ms_to_utc(ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Convert a UTC timestamp to epoch milliseconds, clamping pre-epoch values to zero
pub fn utc_to_ms(at: DateTime<Utc>) -> u64 {
    at.timestamp_millis().max(0) as u64
}

/// Wall clock. Used when several processes must agree on timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        utc_to_ms(Utc::now())
    }
}

/// Monotonic clock anchored to the wall clock at construction.
///
/// Never moves backwards, and follows tokio's paused test clock, which makes
/// it the default for the in-process stores.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    anchor_ms: u64,
    anchor: tokio::time::Instant,
}

impl MonotonicClock {
    /// Create a clock anchored at the current wall-clock time
    pub fn new() -> Self {
        Self {
            anchor_ms: utc_to_ms(Utc::now()),
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.anchor);
        self.anchor_ms + elapsed.as_millis() as u64
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub use mock::MockClock;

#[cfg(any(test, feature = "test-helpers"))]
mod mock {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Manually driven clock for tests.
    ///
    /// Clones share the same time. Unlike the production clocks it can be
    /// set backwards, to exercise clock-skew handling.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        now_ms: Arc<AtomicU64>,
    }

    impl MockClock {
        /// Create a mock clock starting at `start_ms`
        pub fn new(start_ms: u64) -> Self {
            Self {
                now_ms: Arc::new(AtomicU64::new(start_ms)),
            }
        }

        /// Advance the clock by a duration
        pub fn advance(&self, by: Duration) {
            self.now_ms
                .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }

        /// Set the clock to an absolute time
        pub fn set(&self, ms: u64) {
            self.now_ms.store(ms, Ordering::SeqCst);
        }
    }

    impl Clock for MockClock {
        fn now_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }
}
