//! Fluent builder API for configuring the synchronizer.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainkeys_sync::SyncConfigBuilder;
//!
//! let config = SyncConfigBuilder::new()
//!     .chain("holesky")
//!     .poll_interval_ms(12_000)
//!     .key_batch_size(500)
//!     .max_block_gap(64)
//!     .build()
//!     .unwrap();
//! ```

use chainkeys_core::chain::ChainReader;
use chainkeys_core::config::SyncConfig;
use chainkeys_core::error::Result;
use chainkeys_core::store::SyncStore;

use crate::retry::RetryingReader;
use crate::updater::Updater;

/// Fluent builder for [`SyncConfig`].
#[derive(Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    /// Set the chain slug used in log fields.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Set the interval between scheduled passes in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Set the number of keys requested per packed-key call.
    pub fn key_batch_size(mut self, size: u64) -> Self {
        self.config.key_batch_size = size;
        self
    }

    pub fn batch_concurrency(mut self, n: usize) -> Self {
        self.config.batch_concurrency = n;
        self
    }

    /// Resync unchanged modules once the head is this many blocks past the checkpoint.
    pub fn max_block_gap(mut self, blocks: u64) -> Self {
        self.config.max_block_gap = blocks;
        self
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Set the per-call chain deadline in milliseconds.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    /// Set the initial and maximum retry backoff in milliseconds.
    pub fn backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.config.initial_backoff_ms = initial_ms;
        self.config.max_backoff_ms = max_ms;
        self
    }

    pub fn watchdog_timeout_ms(mut self, ms: u64) -> Self {
        self.config.watchdog_timeout_ms = ms;
        self
    }

    /// Set the row count of each multi-row INSERT.
    pub fn max_rows_per_statement(mut self, rows: usize) -> Self {
        self.config.max_rows_per_statement = rows;
        self
    }

    pub fn cursor_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.config.cursor_idle_timeout_ms = ms;
        self
    }

    /// Validate and build the [`SyncConfig`].
    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build an [`Updater`] whose chain calls go through a [`RetryingReader`].
    pub fn build_updater<R, S>(self, reader: R, store: S) -> Result<Updater<RetryingReader<R>, S>>
    where
        R: ChainReader,
        S: SyncStore,
    {
        let config = self.build()?;
        let reader = RetryingReader::from_config(reader, &config);
        Ok(Updater::new(reader, store, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainkeys_core::chain::MemoryChain;
    use chainkeys_core::error::SyncError;
    use chainkeys_storage::InMemoryStorage;

    #[test]
    fn builder_defaults() {
        let cfg = SyncConfigBuilder::new().build().unwrap();
        assert_eq!(cfg.chain, "ethereum");
        assert_eq!(cfg.key_batch_size, 1_100);
        assert_eq!(cfg.max_block_gap, 32);
    }

    #[test]
    fn builder_custom() {
        let cfg = SyncConfigBuilder::new()
            .chain("holesky")
            .poll_interval_ms(12_000)
            .key_batch_size(500)
            .batch_concurrency(8)
            .max_block_gap(64)
            .max_reorg_depth(128)
            .request_timeout_ms(2_000)
            .max_retries(5)
            .backoff(50, 1_000)
            .watchdog_timeout_ms(60_000)
            .max_rows_per_statement(100)
            .cursor_idle_timeout_ms(5_000)
            .build()
            .unwrap();

        assert_eq!(cfg.chain, "holesky");
        assert_eq!(cfg.poll_interval_ms, 12_000);
        assert_eq!(cfg.key_batch_size, 500);
        assert_eq!(cfg.batch_concurrency, 8);
        assert_eq!(cfg.max_reorg_depth, 128);
        assert_eq!(cfg.max_retries, 5);
        assert_eq!((cfg.initial_backoff_ms, cfg.max_backoff_ms), (50, 1_000));
        assert_eq!(cfg.max_rows_per_statement, 100);
        assert_eq!(cfg.cursor_idle_timeout_ms, 5_000);
    }

    #[test]
    fn invalid_values_rejected() {
        let err = SyncConfigBuilder::new().key_batch_size(0).build().unwrap_err();
        assert!(matches!(err, SyncError::InvalidArgument(_)));
        assert!(SyncConfigBuilder::new().batch_concurrency(0).build().is_err());
    }

    #[test]
    fn updater_carries_config() {
        let updater = SyncConfigBuilder::new()
            .chain("sepolia")
            .build_updater(MemoryChain::new(), InMemoryStorage::new())
            .unwrap();
        assert_eq!(updater.config().chain, "sepolia");
    }
}
