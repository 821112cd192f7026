//! Persistent Quota Module
//!
//! Regenerating budgets for upstreams that meter usage per owner (e.g. per
//! seller account) rather than per call rate, and that report their own
//! remaining quota in responses.
//!
//! # Backends
//!
//! - [`MemoryQuotaStore`]: single process, lost on restart
//! - [`FileQuotaStore`]: single host, survives restarts
//! - `RedisQuotaStore`: shared by every worker (feature `redis-store`)

pub mod file_store;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod store;
pub mod tracker;

pub use file_store::FileQuotaStore;
#[cfg(feature = "redis-store")]
pub use redis_store::RedisQuotaStore;
pub use store::{
    MemoryQuotaStore, PersistentQuota, QuotaLimits, QuotaSnapshot, QuotaStore, Reservation,
};
pub use tracker::QuotaTracker;
