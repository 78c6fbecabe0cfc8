//! Timeout and exponential-backoff retry around a [`ChainReader`].

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use chainkeys_core::chain::ChainReader;
use chainkeys_core::config::SyncConfig;
use chainkeys_core::error::{Result, SyncError};
use chainkeys_core::types::{BlockHeader, BlockRef, LogEntry, Operator, PackedKeys, StakingModule};

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl From<&SyncConfig> for RetryConfig {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
            ..Default::default()
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        Some(Duration::from_millis(base_ms.min(cap_ms) as u64))
    }
}

// ─── RetryingReader ───────────────────────────────────────────────────────────

/// A [`ChainReader`] whose every call is bounded by a deadline and retried
/// on transient failure.
///
/// Timeouts surface as [`SyncError::Timeout`]. Errors that are not
/// [`SyncError::is_retryable`] (decode failures, bad arguments) are returned
/// on first sight.
pub struct RetryingReader<R> {
    inner: R,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<R: ChainReader> RetryingReader<R> {
    pub fn new(inner: R, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            inner,
            retry: RetryPolicy::new(retry),
            timeout,
        }
    }

    pub fn from_config(inner: R, cfg: &SyncConfig) -> Self {
        Self::new(inner, RetryConfig::from(cfg), cfg.request_timeout())
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn call<T, F, Fut>(&self, method: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout {
                    ms: self.timeout.as_millis() as u64,
                }),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            method,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying chain call"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(method, attempt, error = %e, "max retries exceeded");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<R: ChainReader> ChainReader for RetryingReader<R> {
    async fn get_block(&self, block: BlockRef) -> Result<BlockHeader> {
        self.call("get_block", || self.inner.get_block(block.clone()))
            .await
    }

    async fn get_logs(
        &self,
        address: &str,
        topics: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>> {
        self.call("get_logs", || {
            self.inner.get_logs(address, topics, from_block, to_block)
        })
        .await
    }

    async fn get_staking_modules(&self, block: BlockRef) -> Result<Vec<StakingModule>> {
        self.call("get_staking_modules", || {
            self.inner.get_staking_modules(block.clone())
        })
        .await
    }

    async fn get_operator_count(&self, module: &str, block: BlockRef) -> Result<u64> {
        self.call("get_operator_count", || {
            self.inner.get_operator_count(module, block.clone())
        })
        .await
    }

    async fn get_operator(&self, module: &str, index: u64, block: BlockRef) -> Result<Operator> {
        self.call("get_operator", || {
            self.inner.get_operator(module, index, block.clone())
        })
        .await
    }

    async fn get_nonce(&self, module: &str, block: BlockRef) -> Result<u64> {
        self.call("get_nonce", || self.inner.get_nonce(module, block.clone()))
            .await
    }

    async fn get_packed_keys(
        &self,
        module: &str,
        operator_index: u64,
        offset: u64,
        limit: u64,
        block: BlockRef,
    ) -> Result<PackedKeys> {
        self.call("get_packed_keys", || {
            self.inner
                .get_packed_keys(module, operator_index, offset, limit, block.clone())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainkeys_core::chain::MemoryChain;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        });
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(300)));
        assert!(policy.next_delay(6).is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let chain = MemoryChain::new();
        chain.fail_next_calls(2);
        let reader = RetryingReader::new(chain, fast_retry(3), Duration::from_secs(1));
        let head = reader.get_block(BlockRef::Latest).await.unwrap();
        assert_eq!(head.number, 0);
        assert_eq!(reader.inner().calls().get_block.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail() {
        let chain = MemoryChain::new();
        chain.fail_next_calls(10);
        let reader = RetryingReader::new(chain, fast_retry(2), Duration::from_secs(1));
        let err = reader.get_block(BlockRef::Latest).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(reader.inner().calls().get_block.load(Ordering::Relaxed), 3);
    }

    struct SlowThenDecode {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChainReader for SlowThenDecode {
        async fn get_block(&self, _block: BlockRef) -> Result<BlockHeader> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(SyncError::Rpc("unreachable".into()))
        }
        async fn get_logs(&self, _: &str, _: &[String], _: u64, _: u64) -> Result<Vec<LogEntry>> {
            Ok(vec![])
        }
        async fn get_staking_modules(&self, _: BlockRef) -> Result<Vec<StakingModule>> {
            Ok(vec![])
        }
        async fn get_operator_count(&self, _: &str, _: BlockRef) -> Result<u64> {
            Ok(0)
        }
        async fn get_operator(&self, _: &str, _: u64, _: BlockRef) -> Result<Operator> {
            Err(SyncError::NotFound("operator".into()))
        }
        async fn get_nonce(&self, _: &str, _: BlockRef) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Decode("bad nonce".into()))
        }
        async fn get_packed_keys(
            &self,
            _: &str,
            _: u64,
            _: u64,
            _: u64,
            _: BlockRef,
        ) -> Result<PackedKeys> {
            Ok(PackedKeys::default())
        }
    }

    #[tokio::test]
    async fn slow_call_times_out_and_retries() {
        let reader = RetryingReader::new(
            SlowThenDecode {
                calls: AtomicU32::new(0),
            },
            fast_retry(1),
            Duration::from_millis(10),
        );
        let err = reader.get_block(BlockRef::Latest).await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout { ms: 10 }));
        assert_eq!(reader.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn decode_errors_are_not_retried() {
        let reader = RetryingReader::new(
            SlowThenDecode {
                calls: AtomicU32::new(0),
            },
            fast_retry(3),
            Duration::from_secs(1),
        );
        let err = reader.get_nonce("0xm", BlockRef::Latest).await.unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
        assert_eq!(reader.inner().calls.load(Ordering::SeqCst), 1);
    }
}
