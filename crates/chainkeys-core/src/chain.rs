//! The chain reader capability and an in-memory chain for tests.
//!
//! Contract ABI bindings live behind [`ChainReader`]; the synchronizer only
//! depends on the trait. [`MemoryChain`] is a scriptable implementation that
//! keeps a full state snapshot per block, can fork, and counts calls.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::join_hex;
use crate::error::{Result, SyncError};
use crate::types::{BlockHeader, BlockRef, Key, LogEntry, Operator, PackedKeys, StakingModule};

/// Read access to the execution layer and the staking-module contracts.
///
/// Every contract read takes an explicit [`BlockRef`] so a pass can pin all
/// of its calls to one snapshot.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_block(&self, block: BlockRef) -> Result<BlockHeader>;

    /// Logs emitted by `address` whose topic0 is one of `topics`
    /// (empty = any), in the inclusive range `[from_block, to_block]`.
    async fn get_logs(
        &self,
        address: &str,
        topics: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>>;

    async fn get_staking_modules(&self, block: BlockRef) -> Result<Vec<StakingModule>>;

    async fn get_operator_count(&self, module: &str, block: BlockRef) -> Result<u64>;

    async fn get_operator(&self, module: &str, index: u64, block: BlockRef) -> Result<Operator>;

    async fn get_nonce(&self, module: &str, block: BlockRef) -> Result<u64>;

    /// Packed keys `[offset, offset + limit)` of one operator.
    async fn get_packed_keys(
        &self,
        module: &str,
        operator_index: u64,
        offset: u64,
        limit: u64,
        block: BlockRef,
    ) -> Result<PackedKeys>;
}

#[async_trait]
impl<T: ChainReader + ?Sized> ChainReader for Arc<T> {
    async fn get_block(&self, block: BlockRef) -> Result<BlockHeader> {
        (**self).get_block(block).await
    }

    async fn get_logs(
        &self,
        address: &str,
        topics: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>> {
        (**self).get_logs(address, topics, from_block, to_block).await
    }

    async fn get_staking_modules(&self, block: BlockRef) -> Result<Vec<StakingModule>> {
        (**self).get_staking_modules(block).await
    }

    async fn get_operator_count(&self, module: &str, block: BlockRef) -> Result<u64> {
        (**self).get_operator_count(module, block).await
    }

    async fn get_operator(&self, module: &str, index: u64, block: BlockRef) -> Result<Operator> {
        (**self).get_operator(module, index, block).await
    }

    async fn get_nonce(&self, module: &str, block: BlockRef) -> Result<u64> {
        (**self).get_nonce(module, block).await
    }

    async fn get_packed_keys(
        &self,
        module: &str,
        operator_index: u64,
        offset: u64,
        limit: u64,
        block: BlockRef,
    ) -> Result<PackedKeys> {
        (**self)
            .get_packed_keys(module, operator_index, offset, limit, block)
            .await
    }
}

// ─── In-memory chain (for testing) ────────────────────────────────────────────

/// Contract state of every staking module at one block.
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    pub modules: Vec<StakingModule>,
    /// Module address → operators in index order.
    pub operators: BTreeMap<String, Vec<Operator>>,
    /// (module address, operator index) → keys in index order.
    pub keys: BTreeMap<(String, u64), Vec<Key>>,
}

impl ChainState {
    fn module_mut(&mut self, module: &str) -> Option<&mut StakingModule> {
        self.modules
            .iter_mut()
            .find(|m| m.staking_module_address.eq_ignore_ascii_case(module))
    }

    /// Increment a module's nonce, as the contract does on any mutation.
    pub fn bump_nonce(&mut self, module: &str) {
        if let Some(m) = self.module_mut(module) {
            m.nonce += 1;
        }
    }

    /// Append `count` deterministic keys to an operator and raise its
    /// total-key counter accordingly.
    pub fn add_keys(&mut self, module: &str, operator_index: u64, count: u64) {
        let keys = self
            .keys
            .entry((module.to_string(), operator_index))
            .or_default();
        let start = keys.len() as u64;
        for index in start..start + count {
            keys.push(sample_key(module, operator_index, index));
        }
        let total = keys.len() as u64;
        if let Some(op) = self
            .operators
            .get_mut(module)
            .and_then(|ops| ops.get_mut(operator_index as usize))
        {
            op.total_signing_keys = total;
        }
    }

    /// Mark the first `count` keys of an operator as used.
    pub fn set_used(&mut self, module: &str, operator_index: u64, count: u64) {
        if let Some(keys) = self.keys.get_mut(&(module.to_string(), operator_index)) {
            for key in keys.iter_mut() {
                key.used = key.index < count;
            }
        }
        if let Some(op) = self
            .operators
            .get_mut(module)
            .and_then(|ops| ops.get_mut(operator_index as usize))
        {
            op.used_signing_keys = count;
        }
    }
}

/// Deterministic key material for tests: bytes derived from the identity.
pub fn sample_key(module: &str, operator_index: u64, index: u64) -> Key {
    let tag = (operator_index as u8).wrapping_mul(31).wrapping_add(index as u8);
    let seed = module.len() as u8;
    Key {
        module_address: module.to_string(),
        operator_index,
        index,
        key: format!("0x{}", hex::encode([tag ^ seed; 48])),
        deposit_signature: format!("0x{}", hex::encode([tag.wrapping_add(1); 96])),
        used: false,
    }
}

/// Per-method call counters of a [`MemoryChain`].
#[derive(Debug, Default)]
pub struct CallCounters {
    pub get_block: AtomicU64,
    pub get_logs: AtomicU64,
    pub get_staking_modules: AtomicU64,
    pub get_operator_count: AtomicU64,
    pub get_operator: AtomicU64,
    pub get_nonce: AtomicU64,
    pub get_packed_keys: AtomicU64,
}

impl CallCounters {
    /// Operator and key reads, i.e. everything a module resync costs.
    pub fn module_fetches(&self) -> u64 {
        self.get_operator_count.load(Ordering::Relaxed)
            + self.get_operator.load(Ordering::Relaxed)
            + self.get_packed_keys.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for c in [
            &self.get_block,
            &self.get_logs,
            &self.get_staking_modules,
            &self.get_operator_count,
            &self.get_operator,
            &self.get_nonce,
            &self.get_packed_keys,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct ChainInner {
    /// Canonical chain, index = block number.
    canonical: Vec<BlockHeader>,
    /// Every block ever produced, including orphans, by hash.
    headers: HashMap<String, BlockHeader>,
    states: HashMap<String, Arc<ChainState>>,
    pending: ChainState,
    pending_logs: Vec<(String, String)>,
    logs: Vec<LogEntry>,
    finalized: Option<u64>,
    fail_next: u32,
    fail_finalized: bool,
    salt: u64,
}

/// Scriptable in-memory chain for tests and ephemeral runs.
pub struct MemoryChain {
    inner: Mutex<ChainInner>,
    calls: CallCounters,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    /// A chain holding only an empty genesis block.
    pub fn new() -> Self {
        let chain = Self {
            inner: Mutex::new(ChainInner::default()),
            calls: CallCounters::default(),
        };
        chain.mine();
        chain
    }

    /// Mutate the state that the next mined block will carry.
    pub fn update(&self, f: impl FnOnce(&mut ChainState)) {
        f(&mut self.inner.lock().unwrap().pending);
    }

    /// Record a log to be emitted in the next mined block.
    pub fn emit_log(&self, address: &str, topic: &str) {
        self.inner
            .lock()
            .unwrap()
            .pending_logs
            .push((address.to_string(), topic.to_string()));
    }

    /// Produce a new canonical block carrying the pending state.
    pub fn mine(&self) -> BlockHeader {
        let mut inner = self.inner.lock().unwrap();
        Self::mine_locked(&mut inner)
    }

    /// Mine `n` blocks, returning the last one.
    pub fn mine_many(&self, n: u64) -> BlockHeader {
        let mut inner = self.inner.lock().unwrap();
        let mut last = Self::mine_locked(&mut inner);
        for _ in 1..n {
            last = Self::mine_locked(&mut inner);
        }
        last
    }

    /// Drop the top `depth` canonical blocks and mine a replacement block on
    /// the fork point carrying the pending state. Returns the new head.
    pub fn reorg(&self, depth: u64) -> BlockHeader {
        let mut inner = self.inner.lock().unwrap();
        let keep = inner.canonical.len().saturating_sub(depth as usize).max(1);
        inner.canonical.truncate(keep);
        Self::mine_locked(&mut inner)
    }

    pub fn head(&self) -> BlockHeader {
        let inner = self.inner.lock().unwrap();
        inner.canonical[inner.canonical.len() - 1].clone()
    }

    pub fn set_finalized(&self, number: u64) {
        self.inner.lock().unwrap().finalized = Some(number);
    }

    /// Make reads at the `Finalized` tag fail.
    pub fn fail_finalized(&self, fail: bool) {
        self.inner.lock().unwrap().fail_finalized = fail;
    }

    /// Make the next `n` calls of any kind fail with a transient RPC error.
    pub fn fail_next_calls(&self, n: u32) {
        self.inner.lock().unwrap().fail_next = n;
    }

    pub fn calls(&self) -> &CallCounters {
        &self.calls
    }

    fn mine_locked(inner: &mut ChainInner) -> BlockHeader {
        inner.salt += 1;
        let number = inner.canonical.len() as u64;
        let parent_hash = inner
            .canonical
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| format!("0x{:064x}", 0));
        let header = BlockHeader {
            number,
            hash: format!("0x{:048x}{:016x}", inner.salt, number),
            parent_hash,
            timestamp: 1_600_000_000 + (number as i64) * 12,
        };
        let state = Arc::new(inner.pending.clone());
        for (address, topic) in std::mem::take(&mut inner.pending_logs) {
            inner.logs.push(LogEntry {
                address,
                topics: vec![topic],
                block_number: number,
                block_hash: header.hash.clone(),
                removed: false,
            });
        }
        inner.states.insert(header.hash.clone(), state);
        inner.headers.insert(header.hash.clone(), header.clone());
        inner.canonical.push(header.clone());
        header
    }

    fn enter(&self, counter: &AtomicU64) -> Result<()> {
        counter.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(SyncError::Rpc("injected failure".into()));
        }
        Ok(())
    }

    fn resolve(inner: &ChainInner, block: &BlockRef) -> Result<BlockHeader> {
        let found = match block {
            BlockRef::Latest => inner.canonical.last().cloned(),
            BlockRef::Finalized => {
                if inner.fail_finalized {
                    return Err(SyncError::Rpc("finalized block unavailable".into()));
                }
                inner
                    .finalized
                    .and_then(|n| inner.canonical.get(n as usize).cloned())
            }
            BlockRef::Number(n) => inner.canonical.get(*n as usize).cloned(),
            BlockRef::Hash(h) => inner.headers.get(h).cloned(),
        };
        found.ok_or_else(|| SyncError::Rpc(format!("unknown block {block}")))
    }

    fn state_at(&self, block: &BlockRef) -> Result<Arc<ChainState>> {
        let inner = self.inner.lock().unwrap();
        let header = Self::resolve(&inner, block)?;
        inner
            .states
            .get(&header.hash)
            .cloned()
            .ok_or_else(|| SyncError::Rpc(format!("missing state for {block}")))
    }
}

#[async_trait]
impl ChainReader for MemoryChain {
    async fn get_block(&self, block: BlockRef) -> Result<BlockHeader> {
        self.enter(&self.calls.get_block)?;
        let inner = self.inner.lock().unwrap();
        Self::resolve(&inner, &block)
    }

    async fn get_logs(
        &self,
        address: &str,
        topics: &[String],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>> {
        self.enter(&self.calls.get_logs)?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .logs
            .iter()
            .filter(|log| log.block_number >= from_block && log.block_number <= to_block)
            .filter(|log| {
                inner
                    .canonical
                    .get(log.block_number as usize)
                    .is_some_and(|b| b.hash == log.block_hash)
            })
            .filter(|log| log.address.eq_ignore_ascii_case(address))
            .filter(|log| {
                topics.is_empty()
                    || log
                        .topics
                        .first()
                        .is_some_and(|t0| topics.iter().any(|t| t.eq_ignore_ascii_case(t0)))
            })
            .cloned()
            .collect())
    }

    async fn get_staking_modules(&self, block: BlockRef) -> Result<Vec<StakingModule>> {
        self.enter(&self.calls.get_staking_modules)?;
        Ok(self.state_at(&block)?.modules.clone())
    }

    async fn get_operator_count(&self, module: &str, block: BlockRef) -> Result<u64> {
        self.enter(&self.calls.get_operator_count)?;
        let state = self.state_at(&block)?;
        Ok(state.operators.get(module).map_or(0, |ops| ops.len() as u64))
    }

    async fn get_operator(&self, module: &str, index: u64, block: BlockRef) -> Result<Operator> {
        self.enter(&self.calls.get_operator)?;
        let state = self.state_at(&block)?;
        state
            .operators
            .get(module)
            .and_then(|ops| ops.get(index as usize))
            .cloned()
            .ok_or_else(|| SyncError::Rpc(format!("operator {index} of {module} not found")))
    }

    async fn get_nonce(&self, module: &str, block: BlockRef) -> Result<u64> {
        self.enter(&self.calls.get_nonce)?;
        let state = self.state_at(&block)?;
        state
            .modules
            .iter()
            .find(|m| m.staking_module_address.eq_ignore_ascii_case(module))
            .map(|m| m.nonce)
            .ok_or_else(|| SyncError::Rpc(format!("module {module} not found")))
    }

    async fn get_packed_keys(
        &self,
        module: &str,
        operator_index: u64,
        offset: u64,
        limit: u64,
        block: BlockRef,
    ) -> Result<PackedKeys> {
        self.enter(&self.calls.get_packed_keys)?;
        let state = self.state_at(&block)?;
        let keys = state
            .keys
            .get(&(module.to_string(), operator_index))
            .map(Vec::as_slice)
            .unwrap_or_default();
        let start = (offset as usize).min(keys.len());
        let end = (offset.saturating_add(limit) as usize).min(keys.len());
        let slice = &keys[start..end];
        Ok(PackedKeys {
            pubkeys: join_hex(&slice.iter().map(|k| k.key.as_str()).collect::<Vec<_>>()),
            signatures: join_hex(
                &slice
                    .iter()
                    .map(|k| k.deposit_signature.as_str())
                    .collect::<Vec<_>>(),
            ),
            used: slice.iter().map(|k| k.used).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModuleStatus;

    const MODULE: &str = "0x00000000000000000000000000000000000000aa";

    fn module() -> StakingModule {
        StakingModule {
            id: 1,
            staking_module_address: MODULE.into(),
            module_fee: 500,
            treasury_fee: 500,
            target_share: 10_000,
            status: ModuleStatus::Active,
            name: "curated".into(),
            last_deposit_at: 0,
            last_deposit_block: 0,
            exited_validators_count: 0,
            module_type: "curated-onchain-v1".into(),
            active: true,
            nonce: 1,
        }
    }

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

    #[tokio::test]
    async fn blocks_chain_by_parent_hash() {
        let chain = MemoryChain::new();
        let a = chain.mine();
        let b = chain.mine();
        assert!(b.extends(&a));
        let latest = chain.get_block(BlockRef::Latest).await.unwrap();
        assert_eq!(latest, b);
        let by_hash = chain.get_block(BlockRef::hash(&a.hash)).await.unwrap();
        assert_eq!(by_hash, a);
    }

    #[tokio::test]
    async fn reads_are_pinned_to_block_state() {
        let chain = MemoryChain::new();
        chain.update(|s| {
            s.modules.push(module());
            s.operators.insert(MODULE.into(), vec![operator(0)]);
            s.add_keys(MODULE, 0, 3);
        });
        let first = chain.mine();
        chain.update(|s| s.add_keys(MODULE, 0, 2));
        chain.mine();

        let old = chain
            .get_operator(MODULE, 0, BlockRef::hash(&first.hash))
            .await
            .unwrap();
        assert_eq!(old.total_signing_keys, 3);
        let new = chain.get_operator(MODULE, 0, BlockRef::Latest).await.unwrap();
        assert_eq!(new.total_signing_keys, 5);
    }

    #[tokio::test]
    async fn packed_keys_slice_range() {
        let chain = MemoryChain::new();
        chain.update(|s| {
            s.modules.push(module());
            s.operators.insert(MODULE.into(), vec![operator(0)]);
            s.add_keys(MODULE, 0, 5);
        });
        chain.mine();
        let packed = chain
            .get_packed_keys(MODULE, 0, 3, 10, BlockRef::Latest)
            .await
            .unwrap();
        assert_eq!(packed.used.len(), 2);
        assert_eq!(packed.pubkeys.len(), 2 + 2 * 48 * 2);
    }

    #[tokio::test]
    async fn reorg_replaces_head_and_orphans_logs() {
        let chain = MemoryChain::new();
        chain.emit_log(MODULE, "0xtopic");
        let orphan = chain.mine();
        let replacement = chain.reorg(1);
        assert_eq!(replacement.number, orphan.number);
        assert_ne!(replacement.hash, orphan.hash);
        let logs = chain.get_logs(MODULE, &[], 0, 10).await.unwrap();
        assert!(logs.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let chain = MemoryChain::new();
        chain.fail_next_calls(1);
        let err = chain.get_block(BlockRef::Latest).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(chain.get_block(BlockRef::Latest).await.is_ok());
        assert_eq!(chain.calls().get_block.load(Ordering::Relaxed), 2);
    }
}
