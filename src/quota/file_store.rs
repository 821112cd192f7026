//! File-backed quota store.
//!
//! Keeps quotas in memory and rewrites a JSON state file after every
//! mutation, so a restart on the same host resumes from the last balance
//! instead of a full budget. Writes go to a sibling temp file that is then
//! renamed over the state file; a crash mid-write leaves the previous state
//! intact.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::store::{
    with_quota, PersistentQuota, QuotaLimits, QuotaSnapshot, QuotaStore, Reservation,
};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct QuotaStateFile<Q = HashMap<String, PersistentQuota>> {
    version: u32,
    quotas: Q,
}

/// Quota store persisted to a local JSON file
#[derive(Debug)]
pub struct FileQuotaStore {
    path: PathBuf,
    quotas: Mutex<HashMap<String, PersistentQuota>>,
    clock: Arc<dyn Clock>,
}

impl FileQuotaStore {
    /// Open the state file, starting empty if it does not exist yet.
    ///
    /// Uses the wall clock: timestamps must stay meaningful across restarts.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_clock(path, Arc::new(SystemClock::new())).await
    }

    pub async fn open_with_clock(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let quotas = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: QuotaStateFile = serde_json::from_slice(&bytes)?;
                if state.version != STATE_VERSION {
                    return Err(StoreError::Corrupt(format!(
                        "unsupported quota state version {} in {}",
                        state.version,
                        path.display()
                    )));
                }
                info!(path = %path.display(), owners = state.quotas.len(), "Loaded quota state");
                state.quotas
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No quota state file yet");
                HashMap::new()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            quotas: Mutex::new(quotas),
            clock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, quotas: &HashMap<String, PersistentQuota>) -> Result<(), StoreError> {
        let state = QuotaStateFile {
            version: STATE_VERSION,
            quotas,
        };
        let bytes = serde_json::to_vec_pretty(&state)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `f` to a staged copy and adopt it only once it is on disk.
    /// A failed write leaves both memory and file at the previous state.
    async fn update<R>(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        f: impl FnOnce(&mut PersistentQuota, u64) -> R,
    ) -> Result<R, StoreError> {
        let mut quotas = self.quotas.lock().await;
        let now_ms = self.clock.now_ms();
        let mut staged = quotas.clone();
        let result = with_quota(&mut staged, owner, limits, now_ms, |quota| f(quota, now_ms));
        self.persist(&staged).await?;
        *quotas = staged;
        Ok(result)
    }
}

#[async_trait]
impl QuotaStore for FileQuotaStore {
    async fn reserve(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        tokens: f64,
    ) -> Result<Reservation, StoreError> {
        self.update(owner, limits, |quota, now_ms| quota.try_reserve(tokens, now_ms))
            .await
    }

    async fn snapshot(&self, owner: &str, limits: &QuotaLimits) -> Result<QuotaSnapshot, StoreError> {
        let quotas = self.quotas.lock().await;
        let now_ms = self.clock.now_ms();
        let mut quota = quotas
            .get(owner)
            .copied()
            .unwrap_or_else(|| PersistentQuota::full(limits, now_ms));
        quota.apply_limits(limits);
        Ok(QuotaSnapshot {
            quota: quota.refilled(now_ms),
            observed_at_ms: now_ms,
        })
    }

    async fn reconcile(
        &self,
        owner: &str,
        limits: &QuotaLimits,
        authoritative: f64,
        observed_at_ms: Option<u64>,
    ) -> Result<PersistentQuota, StoreError> {
        self.update(owner, limits, |quota, now_ms| {
            quota.reconcile(authoritative, observed_at_ms.unwrap_or(now_ms), now_ms);
            *quota
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "file"
    }
}
