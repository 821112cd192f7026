//! Token Bucket Limiter
//!
//! Public acquire/inspect API over a [`BucketStore`]. A caller that finds the
//! bucket short is parked in its operation's FIFO lane; one drain task per
//! lane grants queued callers in order, spacing grants by the operation's
//! minimum delay.
//!
//! The limiter never retries on the caller's behalf. Timeouts, cancellation
//! and store failures are returned to the immediate caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bucket::{ConsumeOutcome, ConsumeRequest};
use super::config::{OperationRegistry, RateLimitConfig};
use super::dashboard::OperationStatus;
use super::queue::{CancelToken, Grant, Lane};
use super::store::{BucketStore, MemoryBucketStore, StoreFailurePolicy};
use crate::clock::ms_to_utc;
use crate::error::CoordinatorError;
use crate::metrics;

/// Lower bound on drainer sleeps, so rounding never turns into a busy loop
const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

/// Limiter-wide settings
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Wait bound applied when the caller passes none
    pub default_timeout: Duration,

    /// Upper bound of the random pause after each queued grant
    pub queue_jitter: Duration,

    /// Behaviour when the store is unreachable
    pub failure_policy: StoreFailurePolicy,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            queue_jitter: Duration::from_millis(50),
            failure_policy: StoreFailurePolicy::default(),
        }
    }
}

/// Per-call options for [`RateLimiter::acquire_with`]
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub tokens: u32,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl AcquireOptions {
    pub fn new(tokens: u32) -> Self {
        Self {
            tokens,
            timeout: None,
            cancel: None,
        }
    }

    /// Bound the queue wait
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Token bucket rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

#[derive(Debug)]
struct LimiterInner {
    registry: OperationRegistry,
    store: Arc<dyn BucketStore>,
    lanes: HashMap<String, Arc<Lane>>,
    settings: LimiterSettings,
    shutting_down: AtomicBool,
}

impl RateLimiter {
    /// Create a limiter over a store
    pub fn new(
        registry: OperationRegistry,
        store: Arc<dyn BucketStore>,
        settings: LimiterSettings,
    ) -> Self {
        let lanes = registry
            .operations()
            .into_iter()
            .map(|operation| (operation, Lane::new()))
            .collect();

        info!(
            backend = store.backend(),
            operations = registry.len(),
            failure_policy = %settings.failure_policy,
            "Rate limiter initialized"
        );

        Self {
            inner: Arc::new(LimiterInner {
                registry,
                store,
                lanes,
                settings,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Limiter over a fresh in-process store with default settings
    pub fn in_memory(registry: OperationRegistry) -> Self {
        Self::new(
            registry,
            Arc::new(MemoryBucketStore::new()),
            LimiterSettings::default(),
        )
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.inner.settings
    }

    /// Name of the store backend
    pub fn backend(&self) -> &'static str {
        self.inner.store.backend()
    }

    /// Acquire `tokens` tokens for `operation`, waiting up to the default timeout
    pub async fn acquire(&self, operation: &str, tokens: u32) -> Result<(), CoordinatorError> {
        self.acquire_with(operation, AcquireOptions::new(tokens))
            .await
    }

    /// Acquire with an explicit timeout and/or cancellation token.
    ///
    /// On success the tokens have been deducted from the bucket. A queued
    /// caller that times out or is cancelled leaves the queue without
    /// consuming anything.
    pub async fn acquire_with(
        &self,
        operation: &str,
        options: AcquireOptions,
    ) -> Result<(), CoordinatorError> {
        let result = self.acquire_inner(operation, options).await;
        if let Err(err) = &result {
            if self.inner.registry.contains(operation) {
                metrics::ACQUIRE_FAILURES_TOTAL
                    .with_label_values(&[operation, err.kind()])
                    .inc();
            }
        }
        result
    }

    async fn acquire_inner(
        &self,
        operation: &str,
        options: AcquireOptions,
    ) -> Result<(), CoordinatorError> {
        let inner = &self.inner;
        let limit = inner.registry.get(operation)?;
        let tokens = options.tokens;

        if tokens == 0 {
            return Err(CoordinatorError::InvalidRequest {
                operation: operation.to_string(),
                reason: "at least one token must be requested".to_string(),
            });
        }
        if tokens > limit.burst_capacity {
            return Err(CoordinatorError::InvalidRequest {
                operation: operation.to_string(),
                reason: format!(
                    "requested {} tokens but burst capacity is {}",
                    tokens, limit.burst_capacity
                ),
            });
        }
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(CoordinatorError::ShuttingDown);
        }

        let lane = inner.lane(operation)?;
        let timeout = options.timeout.unwrap_or(inner.settings.default_timeout);
        let started = Instant::now();

        let (id, mut rx) = {
            let mut state = lane.lock().await;
            if state.closed {
                return Err(CoordinatorError::ShuttingDown);
            }
            state.prune_abandoned();

            // Only an empty lane may take the fast path; otherwise we would overtake the queue.
            // The bucket still holds it `min_delay_ms` away from the last queued grant.
            if state.queue.is_empty() {
                if let ConsumeOutcome::Granted { remaining } =
                    inner.consume(limit, ConsumeRequest::burst(tokens)).await?
                {
                    metrics::TOKENS_GRANTED_TOTAL
                        .with_label_values(&[operation, "burst"])
                        .inc_by(tokens as u64);
                    debug!(operation, tokens, remaining, "Granted without queueing");
                    return Ok(());
                }
            }

            let entry = lane.enqueue(&mut state, operation, tokens, options.cancel.clone());
            metrics::QUEUE_DEPTH
                .with_label_values(&[operation])
                .set(state.queue.len() as i64);
            debug!(
                operation,
                tokens,
                queue_length = state.queue.len(),
                "Queued for capacity"
            );

            if !state.draining {
                state.draining = true;
                tokio::spawn(LimiterInner::drain(
                    Arc::clone(&self.inner),
                    Arc::clone(limit),
                    Arc::clone(lane),
                ));
            }
            entry
        };

        let cancel = options.cancel.unwrap_or_default();
        let reason = tokio::select! {
            grant = &mut rx => {
                return grant.unwrap_or_else(|_| {
                    if cancel.is_cancelled() {
                        Err(CoordinatorError::Cancelled(operation.to_string()))
                    } else {
                        Err(CoordinatorError::ShuttingDown)
                    }
                });
            }
            _ = tokio::time::sleep(timeout) => CoordinatorError::Timeout {
                operation: operation.to_string(),
                waited: started.elapsed(),
            },
            _ = cancel.cancelled() => CoordinatorError::Cancelled(operation.to_string()),
        };

        inner.abandon(lane, operation, id, rx, reason).await
    }

    /// Whether `tokens` tokens are available right now. Does not consume.
    pub async fn has_tokens(&self, operation: &str, tokens: u32) -> Result<bool, CoordinatorError> {
        let limit = self.inner.registry.get(operation)?;
        let snapshot = self.inner.store.snapshot(limit).await?;
        Ok(snapshot.bucket.covers(tokens as f64))
    }

    /// Read-only snapshot of one operation
    pub async fn get_status(&self, operation: &str) -> Result<OperationStatus, CoordinatorError> {
        let inner = &self.inner;
        let limit = inner.registry.get(operation)?;
        let lane = inner.lane(operation)?;

        let (queue_length, queued_tokens, head_tokens) = {
            let state = lane.lock().await;
            (
                state.queue.len(),
                state.queued_tokens(),
                state.queue.front().map(|r| r.tokens_requested),
            )
        };

        let snapshot = inner.store.snapshot(limit).await?;
        let bucket = snapshot.bucket;
        let wait = match head_tokens {
            Some(tokens) => bucket
                .time_until_available(limit, tokens as f64)
                .max(bucket.min_delay_remaining(limit, snapshot.observed_at_ms)),
            None => bucket
                .time_until_available(limit, 1.0)
                .max(bucket.paced_delay_remaining(limit, snapshot.observed_at_ms)),
        };

        Ok(OperationStatus {
            operation: operation.to_string(),
            tokens_available: bucket.tokens,
            burst_capacity: limit.burst_capacity,
            rate_per_second: limit.rate_per_second,
            queue_length,
            queued_tokens,
            next_available_at: ms_to_utc(snapshot.observed_at_ms + wait.as_millis() as u64),
        })
    }

    /// Status of every configured operation, sorted by name
    pub async fn status_all(&self) -> Result<Vec<OperationStatus>, CoordinatorError> {
        let mut statuses = Vec::with_capacity(self.inner.registry.len());
        for operation in self.inner.registry.operations() {
            statuses.push(self.get_status(&operation).await?);
        }
        Ok(statuses)
    }

    /// Split `items` into chunks no larger than the operation's batch size
    pub fn split_batch<'a, T>(
        &self,
        operation: &str,
        items: &'a [T],
    ) -> Result<std::slice::Chunks<'a, T>, CoordinatorError> {
        let limit = self.inner.registry.get(operation)?;
        Ok(items.chunks(limit.max_batch_size as usize))
    }

    /// Callers currently queued for `operation`
    pub async fn queue_length(&self, operation: &str) -> Result<usize, CoordinatorError> {
        Ok(self.inner.lane(operation)?.len().await)
    }

    /// Drop waiters whose callers cancelled or went away, and refresh queue gauges
    pub async fn prune_abandoned(&self) -> usize {
        let mut pruned = 0;
        for (operation, lane) in &self.inner.lanes {
            let mut state = lane.lock().await;
            let removed = state.prune_abandoned();
            metrics::QUEUE_DEPTH
                .with_label_values(&[operation.as_str()])
                .set(state.queue.len() as i64);
            if removed > 0 {
                lane.wake();
            }
            pruned += removed;
        }
        if pruned > 0 {
            debug!(pruned, "Pruned abandoned waiters");
        }
        pruned
    }

    /// Reject new acquires and fail every queued caller with `ShuttingDown`
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut failed = 0;
        for (operation, lane) in &self.inner.lanes {
            let mut state = lane.lock().await;
            state.closed = true;
            while let Some(request) = state.queue.pop_front() {
                request.resolve(Err(CoordinatorError::ShuttingDown));
                failed += 1;
            }
            metrics::QUEUE_DEPTH
                .with_label_values(&[operation.as_str()])
                .set(0);
            lane.wake();
        }
        info!(failed_waiters = failed, "Rate limiter shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }
}

impl LimiterInner {
    fn lane(&self, operation: &str) -> Result<&Arc<Lane>, CoordinatorError> {
        self.lanes
            .get(operation)
            .ok_or_else(|| CoordinatorError::UnknownOperation(operation.to_string()))
    }

    /// Run the store primitive, applying the failure policy on backend errors
    async fn consume(
        &self,
        limit: &RateLimitConfig,
        request: ConsumeRequest,
    ) -> Result<ConsumeOutcome, CoordinatorError> {
        match self.store.try_consume(limit, request).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let policy = self.settings.failure_policy;
                metrics::STORE_ERRORS_TOTAL
                    .with_label_values(&[self.store.backend(), policy.as_str()])
                    .inc();
                match policy {
                    StoreFailurePolicy::FailOpen => {
                        warn!(
                            operation = %limit.operation,
                            error = %err,
                            policy = %policy,
                            "Token store unavailable, allowing request"
                        );
                        Ok(ConsumeOutcome::Granted { remaining: 0.0 })
                    }
                    StoreFailurePolicy::FailClosed => {
                        warn!(
                            operation = %limit.operation,
                            error = %err,
                            policy = %policy,
                            "Token store unavailable, rejecting request"
                        );
                        Err(CoordinatorError::Store(err))
                    }
                }
            }
        }
    }

    /// Leave the queue after a timeout or cancellation.
    ///
    /// If the drainer already resolved us, that outcome wins: tokens it
    /// deducted are never silently dropped.
    async fn abandon(
        &self,
        lane: &Lane,
        operation: &str,
        id: u64,
        mut rx: oneshot::Receiver<Grant>,
        reason: CoordinatorError,
    ) -> Grant {
        let mut state = lane.lock().await;
        if state.remove(id).is_some() {
            metrics::QUEUE_DEPTH
                .with_label_values(&[operation])
                .set(state.queue.len() as i64);
            drop(state);
            lane.wake();
            debug!(operation, reason = reason.kind(), "Left queue without a grant");
            return Err(reason);
        }
        drop(state);

        match rx.try_recv() {
            Ok(grant) => grant,
            Err(_) => Err(reason),
        }
    }

    async fn drain(self: Arc<Self>, limit: Arc<RateLimitConfig>, lane: Arc<Lane>) {
        let operation = limit.operation.as_str();
        debug!(operation, "Queue drainer started");

        loop {
            let mut state = lane.lock().await;
            state.prune_abandoned();

            let Some(tokens) = state.queue.front().map(|r| r.tokens_requested) else {
                state.draining = false;
                metrics::QUEUE_DEPTH.with_label_values(&[operation]).set(0);
                debug!(operation, "Queue drained");
                return;
            };

            match self.consume(&limit, ConsumeRequest::paced(tokens)).await {
                Ok(ConsumeOutcome::Granted { remaining }) => {
                    if let Some(request) = state.queue.pop_front() {
                        let waited = request.enqueued_at.elapsed();
                        let retries = request.retry_count;
                        if request.resolve(Ok(())) {
                            metrics::TOKENS_GRANTED_TOTAL
                                .with_label_values(&[operation, "queued"])
                                .inc_by(tokens as u64);
                            metrics::QUEUE_WAIT_SECONDS
                                .with_label_values(&[operation])
                                .observe(waited.as_secs_f64());
                            debug!(
                                operation,
                                tokens,
                                remaining,
                                retries,
                                waited_ms = waited.as_millis() as u64,
                                "Granted queued request"
                            );
                        } else {
                            warn!(operation, tokens, "Caller went away after tokens were deducted");
                        }
                    }
                    metrics::QUEUE_DEPTH
                        .with_label_values(&[operation])
                        .set(state.queue.len() as i64);
                    drop(state);
                    self.pause_for_jitter().await;
                }
                Ok(ConsumeOutcome::Denied { retry_after, .. }) => {
                    if let Some(head) = state.queue.front_mut() {
                        head.retry_count += 1;
                    }
                    drop(state);
                    tokio::select! {
                        _ = tokio::time::sleep(retry_after.max(MIN_RETRY_INTERVAL)) => {}
                        _ = lane.woken() => {}
                    }
                }
                Err(err) => {
                    if let Some(request) = state.queue.pop_front() {
                        request.resolve(Err(err));
                    }
                }
            }
        }
    }

    /// Random pause between queued grants so woken callers do not stampede
    async fn pause_for_jitter(&self) {
        let max_ms = self.settings.queue_jitter.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=max_ms))).await;
    }
}
