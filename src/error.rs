//! Error Types
//!
//! This module defines the errors returned by the limiter, the circuit
//! breaker, the retry coordinator and the quota tracker.

use std::time::Duration;

/// Errors raised by a token or quota store backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Redis command or connection failure
    #[cfg(feature = "redis-store")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Filesystem error while persisting state
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store returned something we cannot interpret
    #[error("corrupt store state: {0}")]
    Corrupt(String),
}

/// Error types for coordinated API access
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Operation is not present in the configuration table
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Request can never succeed (e.g. more tokens than the burst capacity)
    #[error("Invalid request for '{operation}': {reason}")]
    InvalidRequest { operation: String, reason: String },

    /// Queue wait exceeded the caller's bound
    #[error("Timed out after {}ms waiting for '{operation}' capacity", .waited.as_millis())]
    Timeout { operation: String, waited: Duration },

    /// Caller cancelled while queued
    #[error("Acquire for '{0}' was cancelled")]
    Cancelled(String),

    /// Breaker is failing fast
    #[error("Circuit '{name}' is open, retry in {}s", .retry_after.as_secs())]
    CircuitOpen { name: String, retry_after: Duration },

    /// The wrapped call reported a 429 / quota-exceeded condition
    #[error("Upstream rate limit for '{operation}': {message}")]
    RateLimited {
        operation: String,
        retry_after: Option<Duration>,
        message: String,
    },

    /// The wrapped call failed for a reason other than rate limiting
    #[error("Upstream call for '{operation}' failed: {source}")]
    Upstream {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// All retry attempts were used up
    #[error("Retries exhausted for '{operation}' after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<CoordinatorError>,
    },

    /// Token or quota store is unreachable and the failure policy is fail-closed
    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),

    /// Limiter is shutting down
    #[error("Rate limiter is shutting down")]
    ShuttingDown,
}

impl CoordinatorError {
    /// Suggested delay before the caller tries again, when one is known
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoordinatorError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            CoordinatorError::RateLimited { retry_after, .. } => *retry_after,
            CoordinatorError::RetryExhausted { last, .. } => last.retry_after(),
            _ => None,
        }
    }

    /// Whether retrying later may succeed
    ///
    /// Misconfiguration and impossible requests are not recoverable; queue
    /// timeouts, open circuits, upstream throttling and store outages are.
    pub fn is_recoverable(&self) -> bool {
        match self {
            CoordinatorError::UnknownOperation(_)
            | CoordinatorError::InvalidRequest { .. }
            | CoordinatorError::ShuttingDown => false,
            CoordinatorError::Upstream { .. } => false,
            CoordinatorError::RetryExhausted { last, .. } => last.is_recoverable(),
            CoordinatorError::Timeout { .. }
            | CoordinatorError::Cancelled(_)
            | CoordinatorError::CircuitOpen { .. }
            | CoordinatorError::RateLimited { .. }
            | CoordinatorError::Store(_) => true,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::UnknownOperation(_) => "unknown_operation",
            CoordinatorError::InvalidRequest { .. } => "invalid_request",
            CoordinatorError::Timeout { .. } => "timeout",
            CoordinatorError::Cancelled(_) => "cancelled",
            CoordinatorError::CircuitOpen { .. } => "circuit_open",
            CoordinatorError::RateLimited { .. } => "rate_limited",
            CoordinatorError::Upstream { .. } => "upstream",
            CoordinatorError::RetryExhausted { .. } => "retry_exhausted",
            CoordinatorError::Store(_) => "store",
            CoordinatorError::ShuttingDown => "shutting_down",
        }
    }

    /// Whether this error came from upstream throttling
    pub fn is_rate_limit(&self) -> bool {
        match self {
            CoordinatorError::RateLimited { .. } => true,
            CoordinatorError::RetryExhausted { last, .. } => last.is_rate_limit(),
            _ => false,
        }
    }
}
