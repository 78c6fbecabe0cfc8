//! Synchronizer configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

/// Configuration for a synchronizer instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Chain to mirror (e.g. `"ethereum"`), used in log fields.
    pub chain: String,
    /// Interval between scheduled passes (milliseconds).
    pub poll_interval_ms: u64,
    /// Keys requested per packed-key call.
    pub key_batch_size: u64,
    /// Batch fetches in flight at once.
    pub batch_concurrency: usize,
    /// A module whose nonce is unchanged is still resynced once the head is
    /// this many blocks past the checkpoint.
    pub max_block_gap: u64,
    /// Headers the reorg detector will walk before assuming a reorg.
    pub max_reorg_depth: u64,
    /// Deadline for a single chain call (milliseconds).
    pub request_timeout_ms: u64,
    /// Retries after the first attempt of a transient chain failure.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Process exits if no pass completes within this window (milliseconds).
    pub watchdog_timeout_ms: u64,
    /// Rows per multi-row INSERT statement.
    pub max_rows_per_statement: usize,
    /// Streaming cursors are cancelled after this much consumer idleness (milliseconds).
    pub cursor_idle_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chain: "ethereum".into(),
            poll_interval_ms: 5_000,
            key_batch_size: 1_100,
            batch_concurrency: 4,
            max_block_gap: 32,
            max_reorg_depth: 256,
            request_timeout_ms: 15_000,
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            watchdog_timeout_ms: 30 * 60 * 1_000,
            max_rows_per_statement: 499,
            cursor_idle_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    pub fn cursor_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.cursor_idle_timeout_ms)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.key_batch_size == 0 {
            return Err(SyncError::InvalidArgument("key_batch_size must be positive".into()));
        }
        if self.batch_concurrency == 0 {
            return Err(SyncError::InvalidArgument("batch_concurrency must be positive".into()));
        }
        if self.max_rows_per_statement == 0 {
            return Err(SyncError::InvalidArgument(
                "max_rows_per_statement must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(SyncError::InvalidArgument("poll_interval_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = SyncConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let cfg = SyncConfig {
            key_batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(SyncError::InvalidArgument(_))));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: SyncConfig = serde_json::from_str(r#"{"chain":"holesky","max_block_gap":8}"#).unwrap();
        assert_eq!(cfg.chain, "holesky");
        assert_eq!(cfg.max_block_gap, 8);
        assert_eq!(cfg.key_batch_size, 1_100);
    }
}
