//! Rate Limiting Module
//!
//! Per-operation token buckets with fair queueing for quota-constrained
//! upstream APIs.
//!
//! # Features
//!
//! - Continuous-refill token buckets with a per-operation burst capacity
//! - Strict FIFO queueing per operation, with timeouts and cancellation
//! - Minimum spacing between queued grants
//! - In-process or Redis-shared bucket state behind one atomic primitive
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RateLimiter                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌──────────────────────────────────┐  │
//! │  │ OperationRegistry│  │ Lanes (FIFO queue + drainer / op)│  │
//! │  └─────────────────┘  └──────────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │     BucketStore (Memory | Redis): refill + consume   │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bucket;
pub mod config;
pub mod dashboard;
pub mod limiter;
pub mod queue;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod store;

#[cfg(test)]
mod proptests;

pub use bucket::{ConsumeOutcome, ConsumeRequest, TokenBucket};
pub use config::{OperationRegistry, RateLimitConfig, DEFAULT_OPERATIONS};
pub use dashboard::{OperationStatus, StatusReport};
pub use limiter::{AcquireOptions, LimiterSettings, RateLimiter};
pub use queue::{CancelToken, QueuedRequest};
#[cfg(feature = "redis-store")]
pub use redis_store::{RedisBucketStore, RedisBucketStoreConfig};
pub use store::{BucketSnapshot, BucketStore, MemoryBucketStore, StoreFailurePolicy};
