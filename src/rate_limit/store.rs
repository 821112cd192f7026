//! Token Bucket Store
//!
//! Pluggable storage for per-operation bucket state. Every backend exposes a
//! single indivisible read-refill-and-conditionally-decrement primitive,
//! [`BucketStore::try_consume`]; callers never read state and write it back
//! later.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use super::bucket::{ConsumeOutcome, ConsumeRequest, TokenBucket};
use super::config::RateLimitConfig;
use crate::clock::{Clock, MonotonicClock};
use crate::error::StoreError;

/// What to do when the backing store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Reject the request with [`CoordinatorError::Store`](crate::error::CoordinatorError::Store)
    #[default]
    FailClosed,

    /// Let the request through without deducting anything
    FailOpen,
}

impl StoreFailurePolicy {
    /// Name used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreFailurePolicy::FailClosed => "fail_closed",
            StoreFailurePolicy::FailOpen => "fail_open",
        }
    }
}

impl std::fmt::Display for StoreFailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    /// Bucket state refilled to `observed_at_ms`
    pub bucket: TokenBucket,

    /// Store time at which the snapshot was taken
    pub observed_at_ms: u64,
}

/// Backend holding token buckets
#[async_trait]
pub trait BucketStore: Send + Sync + Debug {
    /// Atomically refill the bucket for `limit.operation` and deduct
    /// `request.tokens` if it allows
    async fn try_consume(
        &self,
        limit: &RateLimitConfig,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome, StoreError>;

    /// Current state, refilled to now, without mutating the store
    async fn snapshot(&self, limit: &RateLimitConfig) -> Result<BucketSnapshot, StoreError>;

    /// Short backend name for logs and metrics
    fn backend(&self) -> &'static str;
}

/// In-process bucket store for a single instance
#[derive(Debug, Clone)]
pub struct MemoryBucketStore {
    buckets: Arc<Mutex<HashMap<String, TokenBucket>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBucketStore {
    /// Create a store on the monotonic clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// Create a store on a specific clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of buckets created so far
    pub fn len(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Whether no bucket has been touched yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_bucket<R>(
        &self,
        limit: &RateLimitConfig,
        f: impl FnOnce(&mut TokenBucket, u64) -> R,
    ) -> Result<R, StoreError> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| StoreError::Corrupt("bucket map lock poisoned".to_string()))?;
        let now_ms = self.clock.now_ms();
        let bucket = buckets
            .entry(limit.operation.clone())
            .or_insert_with(|| TokenBucket::full(limit, now_ms));
        Ok(f(bucket, now_ms))
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn try_consume(
        &self,
        limit: &RateLimitConfig,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome, StoreError> {
        self.with_bucket(limit, |bucket, now_ms| {
            bucket.try_consume(limit, request, now_ms)
        })
    }

    async fn snapshot(&self, limit: &RateLimitConfig) -> Result<BucketSnapshot, StoreError> {
        self.with_bucket(limit, |bucket, now_ms| BucketSnapshot {
            bucket: bucket.refilled(limit, now_ms),
            observed_at_ms: now_ms,
        })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::time::Duration;

    fn store() -> (MemoryBucketStore, MockClock) {
        let clock = MockClock::new(10_000);
        (MemoryBucketStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_first_use_creates_full_bucket() {
        let (store, _clock) = store();
        let limit = RateLimitConfig::new("catalog.get_item", 2.0, 2);

        assert!(store.is_empty());
        let snapshot = store.snapshot(&limit).await.unwrap();
        assert_eq!(snapshot.bucket.tokens, 2.0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_consume_until_empty() {
        let (store, _clock) = store();
        let limit = RateLimitConfig::new("catalog.get_item", 2.0, 2);

        for _ in 0..2 {
            let outcome = store
                .try_consume(&limit, ConsumeRequest::burst(1))
                .await
                .unwrap();
            assert!(outcome.is_granted());
        }

        let outcome = store
            .try_consume(&limit, ConsumeRequest::burst(1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConsumeOutcome::Denied {
                retry_after: Duration::from_millis(500),
                available: 0.0
            }
        );
    }

    #[tokio::test]
    async fn test_snapshot_does_not_mutate() {
        let (store, clock) = store();
        let limit = RateLimitConfig::new("op", 1.0, 4);

        store
            .try_consume(&limit, ConsumeRequest::burst(4))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let first = store.snapshot(&limit).await.unwrap();
        let second = store.snapshot(&limit).await.unwrap();
        assert_eq!(first.bucket.tokens, 2.0);
        assert_eq!(second.bucket.tokens, 2.0);
    }

    #[tokio::test]
    async fn test_refill_matches_elapsed_time() {
        let (store, clock) = store();
        let limit = RateLimitConfig::new("op", 4.0, 10);

        store
            .try_consume(&limit, ConsumeRequest::burst(10))
            .await
            .unwrap();

        clock.advance(Duration::from_millis(1_250));
        let snapshot = store.snapshot(&limit).await.unwrap();
        assert!((snapshot.bucket.tokens - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_clock_skew_is_clamped() {
        let (store, clock) = store();
        let limit = RateLimitConfig::new("op", 1.0, 3);

        store
            .try_consume(&limit, ConsumeRequest::burst(2))
            .await
            .unwrap();
        clock.set(5_000);

        let snapshot = store.snapshot(&limit).await.unwrap();
        assert!((snapshot.bucket.tokens - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_operations_are_independent() {
        let (store, _clock) = store();
        let a = RateLimitConfig::new("a", 1.0, 1);
        let b = RateLimitConfig::new("b", 1.0, 1);

        assert!(store
            .try_consume(&a, ConsumeRequest::burst(1))
            .await
            .unwrap()
            .is_granted());
        assert!(store
            .try_consume(&b, ConsumeRequest::burst(1))
            .await
            .unwrap()
            .is_granted());
    }

    #[test]
    fn test_concurrent_consumers_never_over_issue() {
        let store = MemoryBucketStore::with_clock(Arc::new(MockClock::new(0)));
        let limit = Arc::new(RateLimitConfig::new("op", 1.0, 25));
        let rt = tokio::runtime::Runtime::new().unwrap();

        let granted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    let limit = Arc::clone(&limit);
                    let handle = rt.handle().clone();
                    scope.spawn(move || {
                        (0..10)
                            .filter(|_| {
                                handle
                                    .block_on(store.try_consume(&limit, ConsumeRequest::burst(1)))
                                    .unwrap()
                                    .is_granted()
                            })
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(granted, 25);
    }
}
