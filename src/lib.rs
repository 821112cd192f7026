//! Ratekeeper Library
//!
//! Rate-limited access coordination for quota-constrained external APIs:
//! per-operation token buckets with fair queueing, circuit breakers,
//! throttling-aware retries and persistent regenerating quotas.

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod quota;
pub mod rate_limit;
pub mod retry;
pub mod status_server;

pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::Config;
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, StoreError};
pub use quota::QuotaTracker;
pub use rate_limit::{AcquireOptions, CancelToken, RateLimiter};
pub use retry::{CallError, RetryCoordinator, RetryPolicy};
