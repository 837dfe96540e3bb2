use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FalconError, FalconResult};

/// Top-level configuration (`falcon.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FalconConfig {
    #[serde(default)]
    pub ddl: DdlConfig,
    #[serde(default)]
    pub txn: TxnConfig,
}

impl FalconConfig {
    pub fn from_toml_str(text: &str) -> FalconResult<Self> {
        toml::from_str(text).map_err(|e| FalconError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> FalconResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FalconError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!(
            "Loaded config from {} (lease={}ms, reorg_wait={}ms)",
            path.display(),
            config.ddl.lease_ms,
            config.ddl.reorg_wait_timeout_ms
        );
        Ok(config)
    }
}

/// DDL worker configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DdlConfig {
    /// Identity this worker campaigns for DDL ownership with.
    pub owner_id: String,
    /// Owner lease in milliseconds (0 = no lease; ownership never expires).
    pub lease_ms: u64,
    /// How long one invocation waits on a running reorganization before
    /// reporting a timeout. Capped at half the lease when one is set.
    pub reorg_wait_timeout_ms: u64,
    /// Completed jobs kept by the job tracker for status queries.
    pub tracker_history: usize,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            owner_id: "ddl-worker-1".into(),
            lease_ms: 0,
            reorg_wait_timeout_ms: 10_000,
            tracker_history: 100,
        }
    }
}

impl DdlConfig {
    /// Budget for one reorganization wait. With a lease the wait ends at half
    /// of it, leaving the worker time to renew ownership before it lapses.
    pub fn reorg_wait_timeout(&self) -> Duration {
        let ms = if self.lease_ms > 0 {
            self.reorg_wait_timeout_ms.min(self.lease_ms / 2)
        } else {
            self.reorg_wait_timeout_ms
        };
        Duration::from_millis(ms)
    }
}

/// Transaction retry policy used by `run_in_new_txn`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Attempts before giving up on a retryable transaction.
    pub max_retries: u32,
    /// Base back-off between attempts, multiplied by the attempt number.
    pub backoff_ms: u64,
    /// Upper bound for a single back-off sleep.
    pub max_backoff_ms: u64,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_retries: 100,
            backoff_ms: 1,
            max_backoff_ms: 50,
        }
    }
}

impl TxnConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .backoff_ms
            .saturating_mul(attempt as u64)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
