//! Request Queue
//!
//! Per-operation FIFO of callers waiting for tokens. Each operation owns one
//! [`Lane`]; a single drain task per lane grants waiters strictly in arrival
//! order and exits when the lane is empty.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex, MutexGuard, Notify};
use tokio::time::Instant;

use crate::error::CoordinatorError;

/// Outcome delivered to a parked caller
pub(crate) type Grant = Result<(), CoordinatorError>;

/// Cooperative cancellation handle for a queued `acquire`.
///
/// Clones share state. Cancelling removes the caller from its queue without
/// consuming tokens.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a token that has not fired
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the token
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the token has fired
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the token fires
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A caller parked until its operation has capacity
#[derive(Debug)]
pub struct QueuedRequest {
    pub id: u64,
    pub operation: String,
    pub tokens_requested: u32,
    pub enqueued_at: Instant,

    /// Times the drainer found the bucket short for this request
    pub retry_count: u32,

    pub cancel: Option<CancelToken>,
    grant: oneshot::Sender<Grant>,
}

impl QueuedRequest {
    /// Whether nobody is waiting on this request any more
    pub fn is_abandoned(&self) -> bool {
        self.grant.is_closed() || self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    /// Hand the outcome to the caller. Returns false if the caller is gone.
    pub(crate) fn resolve(self, grant: Grant) -> bool {
        self.grant.send(grant).is_ok()
    }
}

/// Mutable part of a lane, guarded by the lane lock
#[derive(Debug, Default)]
pub(crate) struct LaneState {
    pub queue: VecDeque<QueuedRequest>,

    /// A drain task is running for this lane
    pub draining: bool,

    /// Lane refuses new waiters (shutdown)
    pub closed: bool,
}

impl LaneState {
    /// Drop waiters whose caller cancelled or went away. Returns how many.
    pub fn prune_abandoned(&mut self) -> usize {
        let before = self.queue.len();
        self.queue.retain(|request| !request.is_abandoned());
        before - self.queue.len()
    }

    /// Remove a waiter by id
    pub fn remove(&mut self, id: u64) -> Option<QueuedRequest> {
        let index = self.queue.iter().position(|request| request.id == id)?;
        self.queue.remove(index)
    }

    /// Tokens requested by everyone queued
    pub fn queued_tokens(&self) -> u64 {
        self.queue.iter().map(|r| r.tokens_requested as u64).sum()
    }
}

/// FIFO lane for one operation
#[derive(Debug, Default)]
pub(crate) struct Lane {
    state: Mutex<LaneState>,

    /// Wakes the drainer early when the head of the queue changes
    wake: Notify,

    next_id: AtomicU64,
}

impl Lane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().await
    }

    /// Append a waiter. Caller must hold the lane lock.
    pub fn enqueue(
        &self,
        state: &mut LaneState,
        operation: &str,
        tokens_requested: u32,
        cancel: Option<CancelToken>,
    ) -> (u64, oneshot::Receiver<Grant>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.queue.push_back(QueuedRequest {
            id,
            operation: operation.to_string(),
            tokens_requested,
            enqueued_at: Instant::now(),
            retry_count: 0,
            cancel,
            grant: tx,
        });
        (id, rx)
    }

    /// Nudge the drainer to re-read the head of the queue
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Resolve when [`Lane::wake`] is called
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }
}
