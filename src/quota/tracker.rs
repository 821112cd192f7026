//! Persistent Quota Tracker
//!
//! Regenerating per-owner budget for an upstream whose quota refills at a
//! fixed rate per minute. The local balance is an estimate: whenever the
//! upstream reports its own remaining count, [`QuotaTracker::reconcile`]
//! replaces the estimate outright rather than blending the two.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::store::{QuotaLimits, QuotaSnapshot, QuotaStore, Reservation};
use crate::clock::utc_to_ms;
use crate::error::{CoordinatorError, StoreError};
use crate::metrics;
use crate::rate_limit::StoreFailurePolicy;

/// Tracks regenerating quotas in a [`QuotaStore`]
#[derive(Debug)]
pub struct QuotaTracker {
    store: Arc<dyn QuotaStore>,
    limits: QuotaLimits,
    failure_policy: StoreFailurePolicy,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn QuotaStore>, limits: QuotaLimits) -> Self {
        Self {
            store,
            limits,
            failure_policy: StoreFailurePolicy::default(),
        }
    }

    /// Set the behaviour when the store is unreachable during `reserve`
    pub fn with_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Balance for `owner`, regenerated to now
    pub async fn available_tokens(&self, owner: &str) -> Result<f64, StoreError> {
        Ok(self.snapshot(owner).await?.quota.available_tokens)
    }

    pub async fn snapshot(&self, owner: &str) -> Result<QuotaSnapshot, StoreError> {
        self.store.snapshot(owner, &self.limits).await
    }

    /// Atomically take `tokens` from `owner`'s budget if available
    pub async fn reserve(&self, owner: &str, tokens: u32) -> Result<Reservation, CoordinatorError> {
        self.check_request(owner, tokens)?;

        let reservation = match self
            .store
            .reserve(owner, &self.limits, tokens as f64)
            .await
        {
            Ok(reservation) => reservation,
            Err(err) => {
                metrics::STORE_ERRORS_TOTAL
                    .with_label_values(&[self.store.backend(), self.failure_policy.as_str()])
                    .inc();
                match self.failure_policy {
                    StoreFailurePolicy::FailOpen => {
                        warn!(owner, error = %err, policy = %self.failure_policy, "Quota store unavailable, allowing reservation");
                        Reservation::Granted { remaining: 0.0 }
                    }
                    StoreFailurePolicy::FailClosed => {
                        warn!(owner, error = %err, policy = %self.failure_policy, "Quota store unavailable, rejecting reservation");
                        return Err(CoordinatorError::Store(err));
                    }
                }
            }
        };

        let result = if reservation.is_granted() {
            "granted"
        } else {
            "insufficient"
        };
        metrics::QUOTA_RESERVATIONS_TOTAL
            .with_label_values(&[owner, result])
            .inc();
        debug!(owner, tokens, ?reservation, "Quota reservation");
        Ok(reservation)
    }

    /// How long until `tokens` tokens are available to `owner`; zero if they already are
    pub async fn wait_time_for_tokens(&self, owner: &str, tokens: u32) -> Result<Duration, StoreError> {
        let snapshot = self.snapshot(owner).await?;
        Ok(snapshot.quota.wait_time_for(tokens as f64))
    }

    /// Overwrite `owner`'s balance with an authoritative upstream count observed at `observed_at`
    pub async fn reconcile(
        &self,
        owner: &str,
        authoritative: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.reconcile_at(owner, authoritative, Some(utc_to_ms(observed_at)))
            .await
    }

    /// [`reconcile`](Self::reconcile) with the observation time taken as the store's "now"
    pub async fn reconcile_now(&self, owner: &str, authoritative: f64) -> Result<(), StoreError> {
        self.reconcile_at(owner, authoritative, None).await
    }

    async fn reconcile_at(
        &self,
        owner: &str,
        authoritative: f64,
        observed_at_ms: Option<u64>,
    ) -> Result<(), StoreError> {
        let quota = self
            .store
            .reconcile(owner, &self.limits, authoritative, observed_at_ms)
            .await?;
        debug!(
            owner,
            authoritative,
            available = quota.available_tokens,
            "Reconciled quota with upstream"
        );
        Ok(())
    }

    /// Reserve `tokens`, sleeping for regeneration up to `timeout`.
    ///
    /// Gives up early, without sleeping, once the reported wait would
    /// overrun the timeout.
    pub async fn wait_for_tokens(
        &self,
        owner: &str,
        tokens: u32,
        timeout: Duration,
    ) -> Result<f64, CoordinatorError> {
        let started = Instant::now();
        loop {
            match self.reserve(owner, tokens).await? {
                Reservation::Granted { remaining } => return Ok(remaining),
                Reservation::Insufficient { wait, .. } => {
                    let waited = started.elapsed();
                    if waited + wait > timeout {
                        return Err(CoordinatorError::Timeout {
                            operation: owner.to_string(),
                            waited,
                        });
                    }
                    debug!(owner, tokens, wait_secs = wait.as_secs(), "Waiting for quota");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn check_request(&self, owner: &str, tokens: u32) -> Result<(), CoordinatorError> {
        if tokens == 0 {
            return Err(CoordinatorError::InvalidRequest {
                operation: owner.to_string(),
                reason: "at least one token must be reserved".to_string(),
            });
        }
        if tokens as f64 > self.limits.max_tokens {
            return Err(CoordinatorError::InvalidRequest {
                operation: owner.to_string(),
                reason: format!(
                    "requested {} tokens but the quota holds at most {}",
                    tokens, self.limits.max_tokens
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ms_to_utc, MockClock};
    use crate::quota::MemoryQuotaStore;

    fn tracker(start_ms: u64) -> (QuotaTracker, MockClock) {
        let clock = MockClock::new(start_ms);
        let store = MemoryQuotaStore::with_clock(Arc::new(clock.clone()));
        (
            QuotaTracker::new(Arc::new(store), QuotaLimits::new(100.0, 20.0)),
            clock,
        )
    }

    #[tokio::test]
    async fn test_reserve_and_wait_time() {
        let (tracker, _clock) = tracker(0);

        let granted = tracker.reserve("seller", 90).await.unwrap();
        assert_eq!(granted, Reservation::Granted { remaining: 10.0 });

        let denied = tracker.reserve("seller", 50).await.unwrap();
        assert_eq!(
            denied,
            Reservation::Insufficient {
                available: 10.0,
                wait: Duration::from_secs(120)
            }
        );
        assert_eq!(
            tracker.wait_time_for_tokens("seller", 50).await.unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            tracker.wait_time_for_tokens("seller", 5).await.unwrap(),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_reconcile_overrides_local_estimate() {
        let (tracker, clock) = tracker(10_000_000);
        tracker.reserve("seller", 20).await.unwrap();
        assert_eq!(tracker.available_tokens("seller").await.unwrap(), 80.0);

        let t = ms_to_utc(10_000_000);
        tracker.reconcile("seller", 7.0, t).await.unwrap();
        assert_eq!(tracker.available_tokens("seller").await.unwrap(), 7.0);

        clock.advance(Duration::from_secs(3));
        assert!((tracker.available_tokens("seller").await.unwrap() - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reconcile_stamped_ahead_of_store_clock() {
        let (tracker, clock) = tracker(10_000_000);

        // The store clock lags wall time by an hour
        let t = ms_to_utc(10_000_000 + 3_600_000);
        tracker.reconcile("seller", 7.0, t).await.unwrap();
        assert_eq!(tracker.available_tokens("seller").await.unwrap(), 7.0);

        clock.advance(Duration::from_secs(3));
        assert!((tracker.available_tokens("seller").await.unwrap() - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_owners_are_independent() {
        let (tracker, _clock) = tracker(0);
        tracker.reserve("a", 100).await.unwrap();
        assert!(tracker.reserve("b", 100).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (tracker, _clock) = tracker(0);
        assert!(matches!(
            tracker.reserve("seller", 0).await,
            Err(CoordinatorError::InvalidRequest { .. })
        ));
        assert!(matches!(
            tracker.reserve("seller", 101).await,
            Err(CoordinatorError::InvalidRequest { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tokens_sleeps_for_regeneration() {
        let store = MemoryQuotaStore::new();
        let tracker = QuotaTracker::new(Arc::new(store), QuotaLimits::new(10.0, 60.0));
        tracker.reserve("seller", 10).await.unwrap();

        let start = Instant::now();
        let remaining = tracker
            .wait_for_tokens("seller", 2, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(remaining.abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_tokens_gives_up_before_timeout() {
        let store = MemoryQuotaStore::new();
        let tracker = QuotaTracker::new(Arc::new(store), QuotaLimits::new(10.0, 1.0));
        tracker.reserve("seller", 10).await.unwrap();

        let start = Instant::now();
        let err = tracker
            .wait_for_tokens("seller", 5, Duration::from_secs(60))
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::Timeout { .. }));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
