//! Module fetch services: range and batch logic over a [`ChainReader`].
//!
//! Every read takes an explicit [`BlockRef`]; a resync passes the head hash
//! so all of its calls observe one chain snapshot.

use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;

use chainkeys_core::batch::plan_batches;
use chainkeys_core::chain::ChainReader;
use chainkeys_core::codec::decode_packed_keys;
use chainkeys_core::error::{Result, SyncError};
use chainkeys_core::types::{BlockRef, Key, Operator, StakingModule};

// ─── Operators ────────────────────────────────────────────────────────────────

pub struct OperatorFetchService<'a, R: ?Sized> {
    reader: &'a R,
    concurrency: usize,
}

impl<'a, R: ChainReader + ?Sized> OperatorFetchService<'a, R> {
    pub fn new(reader: &'a R, concurrency: usize) -> Self {
        Self {
            reader,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn count(&self, module: &str, block: &BlockRef) -> Result<u64> {
        self.reader.get_operator_count(module, block.clone()).await
    }

    pub async fn fetch_one(&self, module: &str, index: u64, block: &BlockRef) -> Result<Operator> {
        self.reader.get_operator(module, index, block.clone()).await
    }

    /// Every operator of `module`, in index order.
    pub async fn fetch_all(&self, module: &str, block: &BlockRef) -> Result<Vec<Operator>> {
        let count = self.count(module, block).await?;
        futures::stream::iter(0..count)
            .map(|index| self.fetch_one(module, index, block))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    /// Used-key counts at the finalized block, by operator index.
    ///
    /// A failed finalized read degrades to an empty map, i.e. zero for every
    /// operator, rather than failing the pass.
    pub async fn finalized_used_keys(&self, module: &str) -> HashMap<u64, u64> {
        match self.fetch_all(module, &BlockRef::Finalized).await {
            Ok(operators) => operators
                .into_iter()
                .map(|op| (op.index, op.used_signing_keys))
                .collect(),
            Err(e) => {
                tracing::warn!(
                    module,
                    error = %e,
                    "finalized operator read failed, assuming zero used keys"
                );
                HashMap::new()
            }
        }
    }
}

// ─── Keys ─────────────────────────────────────────────────────────────────────

pub struct KeyBatchFetchService<'a, R: ?Sized> {
    reader: &'a R,
    batch_size: u64,
    concurrency: usize,
}

impl<'a, R: ChainReader + ?Sized> KeyBatchFetchService<'a, R> {
    pub fn new(reader: &'a R, batch_size: u64, concurrency: usize) -> Self {
        Self {
            reader,
            batch_size,
            concurrency: concurrency.max(1),
        }
    }

    /// Keys `[from, to)` of one operator.
    ///
    /// Batches are fetched concurrently and concatenated in offset order. Any
    /// failing batch fails the whole fetch.
    pub async fn fetch(
        &self,
        module: &str,
        operator_index: u64,
        from: u64,
        to: u64,
        block: &BlockRef,
    ) -> Result<Vec<Key>> {
        let batches = plan_batches(self.batch_size, from, to.saturating_sub(from))?;
        let chunks: Vec<Vec<Key>> = futures::stream::iter(batches)
            .map(|batch| async move {
                let packed = self
                    .reader
                    .get_packed_keys(module, operator_index, batch.offset, batch.size, block.clone())
                    .await?;
                let keys = decode_packed_keys(module, operator_index, batch.offset, &packed)?;
                if keys.len() as u64 != batch.size {
                    return Err(SyncError::Decode(format!(
                        "operator {operator_index}: asked for {} keys at {}, got {}",
                        batch.size,
                        batch.offset,
                        keys.len()
                    )));
                }
                tracing::debug!(
                    module,
                    operator_index,
                    offset = batch.offset,
                    size = batch.size,
                    "key batch fetched"
                );
                Ok(keys)
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        Ok(chunks.concat())
    }
}

// ─── Nonce / modules ──────────────────────────────────────────────────────────

pub struct NonceFetchService<'a, R: ?Sized> {
    reader: &'a R,
}

impl<'a, R: ChainReader + ?Sized> NonceFetchService<'a, R> {
    pub fn new(reader: &'a R) -> Self {
        Self { reader }
    }

    pub async fn current_nonce(&self, module: &str, block: &BlockRef) -> Result<u64> {
        self.reader.get_nonce(module, block.clone()).await
    }
}

pub struct StakingModuleFetchService<'a, R: ?Sized> {
    reader: &'a R,
}

impl<'a, R: ChainReader + ?Sized> StakingModuleFetchService<'a, R> {
    pub fn new(reader: &'a R) -> Self {
        Self { reader }
    }

    pub async fn modules(&self, block: &BlockRef) -> Result<Vec<StakingModule>> {
        self.reader.get_staking_modules(block.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chainkeys_core::chain::MemoryChain;
    use chainkeys_core::types::{BlockHeader, LogEntry, PackedKeys};
    use std::sync::atomic::Ordering;

    const MODULE: &str = "0x00000000000000000000000000000000000000aa";

    fn operator(index: u64) -> Operator {
        Operator {
            module_address: MODULE.into(),
            index,
            active: true,
            name: format!("op-{index}"),
            reward_address: format!("0x{index:040x}"),
            staking_limit: 100,
            stopped_validators: 0,
            total_signing_keys: 0,
            used_signing_keys: 0,
        }
    }

    fn chain_with_keys(operators: u64, keys: u64) -> MemoryChain {
        let chain = MemoryChain::new();
        chain.update(|s| {
            s.operators
                .insert(MODULE.into(), (0..operators).map(operator).collect());
            for op in 0..operators {
                s.add_keys(MODULE, op, keys);
            }
        });
        chain.mine();
        chain
    }

    #[tokio::test]
    async fn operators_fetched_in_index_order() {
        let chain = chain_with_keys(5, 0);
        let service = OperatorFetchService::new(&chain, 3);
        let ops = service.fetch_all(MODULE, &BlockRef::Latest).await.unwrap();
        assert_eq!(ops.iter().map(|o| o.index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn finalized_failure_degrades_to_empty() {
        let chain = chain_with_keys(2, 4);
        chain.update(|s| s.set_used(MODULE, 1, 3));
        chain.mine();
        chain.set_finalized(2);
        let service = OperatorFetchService::new(&chain, 2);
        assert_eq!(service.finalized_used_keys(MODULE).await.get(&1), Some(&3));

        chain.fail_finalized(true);
        assert!(service.finalized_used_keys(MODULE).await.is_empty());
    }

    #[tokio::test]
    async fn keys_concatenated_across_batches() {
        let chain = chain_with_keys(1, 10);
        let service = KeyBatchFetchService::new(&chain, 3, 4);
        let keys = service
            .fetch(MODULE, 0, 2, 10, &BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(keys.iter().map(|k| k.index).collect::<Vec<_>>(), (2..10).collect::<Vec<_>>());
        assert_eq!(chain.calls().get_packed_keys.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn empty_window_makes_no_calls() {
        let chain = chain_with_keys(1, 10);
        let service = KeyBatchFetchService::new(&chain, 3, 4);
        assert!(service.fetch(MODULE, 0, 5, 5, &BlockRef::Latest).await.unwrap().is_empty());
        assert_eq!(chain.calls().get_packed_keys.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn short_batch_is_a_decode_error() {
        let chain = chain_with_keys(1, 4);
        let service = KeyBatchFetchService::new(&chain, 10, 1);
        let err = service
            .fetch(MODULE, 0, 0, 6, &BlockRef::Latest)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    struct MismatchedBlobs;

    #[async_trait]
    impl ChainReader for MismatchedBlobs {
        async fn get_block(&self, _: BlockRef) -> Result<BlockHeader> {
            Err(SyncError::Rpc("unused".into()))
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
        async fn get_operator(&self, _: &str, index: u64, _: BlockRef) -> Result<Operator> {
            Ok(operator(index))
        }
        async fn get_nonce(&self, _: &str, _: BlockRef) -> Result<u64> {
            Ok(0)
        }
        async fn get_packed_keys(
            &self,
            _: &str,
            _: u64,
            _: u64,
            _: u64,
            _: BlockRef,
        ) -> Result<PackedKeys> {
            Ok(PackedKeys {
                pubkeys: format!("0x{}", "11".repeat(48 * 2)),
                signatures: format!("0x{}", "22".repeat(96)),
                used: vec![false, false],
            })
        }
    }

    #[tokio::test]
    async fn mismatched_blob_aborts_fetch() {
        let service = KeyBatchFetchService::new(&MismatchedBlobs, 2, 1);
        let err = service
            .fetch(MODULE, 0, 0, 2, &BlockRef::Latest)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Decode(_)));
    }

    #[tokio::test]
    async fn nonce_and_modules_pass_through() {
        let chain = MemoryChain::new();
        assert!(StakingModuleFetchService::new(&chain)
            .modules(&BlockRef::Latest)
            .await
            .unwrap()
            .is_empty());
        assert!(NonceFetchService::new(&chain)
            .current_nonce(MODULE, &BlockRef::Latest)
            .await
            .is_err());
    }
}
