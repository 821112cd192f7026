//! Process-wide Coordinator
//!
//! Wires the limiter, one circuit breaker per operation, the retry
//! coordinator and the optional quota tracker together from a [`Config`],
//! and owns the periodic maintenance task.
//!
//! A process normally holds exactly one coordinator, reached through
//! [`init`] / [`global`] / [`shutdown`]. Tests and embedders can also build
//! private instances with [`Coordinator::from_config`] or [`Coordinator::new`].

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::circuit_breaker::BreakerRegistry;
use crate::clock::MonotonicClock;
use crate::config::{Config, QuotaBackend, StoreBackend};
use crate::error::CoordinatorError;
use crate::quota::{FileQuotaStore, MemoryQuotaStore, QuotaStore, QuotaTracker};
use crate::rate_limit::{
    BucketStore, CancelToken, MemoryBucketStore, OperationStatus, RateLimiter, StatusReport,
};
use crate::retry::{CallError, RetryCoordinator, RetryPolicy};

#[cfg(feature = "redis-store")]
use crate::quota::RedisQuotaStore;
#[cfg(feature = "redis-store")]
use crate::rate_limit::{RedisBucketStore, RedisBucketStoreConfig};

static GLOBAL: RwLock<Option<Arc<Coordinator>>> = RwLock::new(None);

/// Limiter, breakers, retries and quota for one process
#[derive(Debug)]
pub struct Coordinator {
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    retry: RetryCoordinator,
    quota: Option<Arc<QuotaTracker>>,
    stop: CancelToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Assemble a coordinator from already-built parts
    pub fn new(
        limiter: RateLimiter,
        breakers: BreakerRegistry,
        policy: RetryPolicy,
        quota: Option<(Arc<QuotaTracker>, String)>,
    ) -> Self {
        let mut retry = RetryCoordinator::new(limiter.clone(), breakers.clone(), policy);
        if let Some((tracker, owner)) = &quota {
            retry = retry.with_quota(Arc::clone(tracker), owner);
        }
        let quota = quota.map(|(tracker, _)| tracker);

        Self {
            limiter,
            breakers,
            retry,
            quota,
            stop: CancelToken::new(),
            maintenance: Mutex::new(None),
        }
    }

    /// Build every component described by `config`. Does not start maintenance.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = config.registry()?;
        let store = bucket_store(config).await?;
        let limiter = RateLimiter::new(registry, store, config.limiter_settings());

        let breakers = BreakerRegistry::new(
            limiter.registry().operations(),
            config.breaker_config(),
            Arc::new(MonotonicClock::new()),
        );

        let quota = if config.quota.enabled {
            let store = quota_store(config).await?;
            let tracker = QuotaTracker::new(store, config.quota_limits())
                .with_failure_policy(config.store.failure_policy);
            info!(
                backend = tracker.backend(),
                owner = %config.quota.owner,
                max_tokens = config.quota.max_tokens,
                regen_per_minute = config.quota.regen_per_minute,
                "Quota tracker enabled"
            );
            Some((Arc::new(tracker), config.quota.owner.clone()))
        } else {
            None
        };

        Ok(Self::new(limiter, breakers, config.retry_policy(), quota))
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn retry(&self) -> &RetryCoordinator {
        &self.retry
    }

    pub fn quota(&self) -> Option<&Arc<QuotaTracker>> {
        self.quota.as_ref()
    }

    /// Acquire one or more tokens for `operation`
    pub async fn acquire(&self, operation: &str, tokens: u32) -> Result<(), CoordinatorError> {
        self.limiter.acquire(operation, tokens).await
    }

    /// Run `call` through limiter, breaker and backoff with the configured retry budget
    pub async fn call<F, Fut, T>(&self, operation: &str, call: F) -> Result<T, CoordinatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.retry.call(operation, call).await
    }

    /// Status of one operation
    pub async fn operation_status(&self, operation: &str) -> Result<OperationStatus, CoordinatorError> {
        self.limiter.get_status(operation).await
    }

    /// Full status view across operations and breakers
    pub async fn status_report(&self) -> Result<StatusReport, CoordinatorError> {
        let operations = self.limiter.status_all().await?;
        Ok(StatusReport::new(
            self.limiter.backend(),
            self.limiter.settings().failure_policy,
            operations,
            self.breakers.snapshots(),
        ))
    }

    /// Spawn the periodic task that prunes abandoned waiters and refreshes gauges.
    ///
    /// A second call while the task is running is a no-op.
    pub fn start_maintenance(&self, interval: Duration) {
        let mut slot = self
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let limiter = self.limiter.clone();
        let breakers = self.breakers.clone();
        let stop = self.stop.clone();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let pruned = limiter.prune_abandoned().await;
                        breakers.refresh();
                        if pruned > 0 {
                            debug!(pruned, "Maintenance pass");
                        }
                    }
                }
            }
            debug!("Maintenance task stopped");
        }));
        debug!(interval_ms = interval.as_millis() as u64, "Maintenance task started");
    }

    /// Stop maintenance and fail every queued caller with `ShuttingDown`
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        self.limiter.shutdown().await;
    }
}

async fn bucket_store(config: &Config) -> Result<Arc<dyn BucketStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryBucketStore::new())),
        #[cfg(feature = "redis-store")]
        StoreBackend::Redis => {
            let store = RedisBucketStore::connect_with_config(
                &config.store.redis_url,
                RedisBucketStoreConfig {
                    key_prefix: config.store.key_prefix.clone(),
                    ..RedisBucketStoreConfig::default()
                },
            )
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.store.redis_url))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreBackend::Redis => anyhow::bail!("Redis backend requires the `redis-store` feature"),
    }
}

async fn quota_store(config: &Config) -> Result<Arc<dyn QuotaStore>> {
    match config.quota.backend {
        QuotaBackend::Memory => Ok(Arc::new(MemoryQuotaStore::new())),
        QuotaBackend::File => {
            let store = FileQuotaStore::open(&config.quota.state_file)
                .await
                .with_context(|| {
                    format!("Failed to open quota state file {}", config.quota.state_file)
                })?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "redis-store")]
        QuotaBackend::Redis => {
            let store = RedisQuotaStore::connect_with_prefix(
                &config.store.redis_url,
                &config.store.quota_key_prefix(),
            )
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.store.redis_url))?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        QuotaBackend::Redis => anyhow::bail!("Redis backend requires the `redis-store` feature"),
    }
}

/// Build the process-wide coordinator and start its maintenance task.
///
/// Returns the existing instance if one is already installed.
pub async fn init(config: &Config) -> Result<Arc<Coordinator>> {
    if let Some(existing) = global() {
        debug!("Coordinator already initialized");
        return Ok(existing);
    }

    let coordinator = Arc::new(Coordinator::from_config(config).await?);

    let installed = {
        let mut slot = GLOBAL.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_ref() {
            Some(winner) => Err(Arc::clone(winner)),
            None => {
                *slot = Some(Arc::clone(&coordinator));
                Ok(())
            }
        }
    };

    match installed {
        Ok(()) => {
            coordinator.start_maintenance(config.maintenance_interval());
            info!(
                backend = coordinator.limiter.backend(),
                operations = coordinator.limiter.registry().len(),
                "Coordinator initialized"
            );
            Ok(coordinator)
        }
        Err(winner) => {
            // Lost a concurrent init; discard ours
            coordinator.shutdown().await;
            Ok(winner)
        }
    }
}

/// The installed coordinator, if any
pub fn global() -> Option<Arc<Coordinator>> {
    GLOBAL
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Uninstall and shut down the process-wide coordinator. A later [`init`] builds a fresh one.
pub async fn shutdown() {
    let coordinator = GLOBAL
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(coordinator) = coordinator {
        coordinator.shutdown().await;
        info!("Coordinator shut down");
    }
}
