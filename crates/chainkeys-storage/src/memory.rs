//! In-memory storage backend.
//!
//! Stores modules, operators, keys, validators and both checkpoints in RAM
//! behind a single lock, so a commit is observed entirely or not at all.
//! Useful for tests and short-lived synchronizers that don't need persistence.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chainkeys_core::checkpoint::ElMeta;
use chainkeys_core::consensus::{ConsensusMeta, Validator};
use chainkeys_core::error::Result;
use chainkeys_core::store::{KeyStream, ModuleUpdate, PassCommit, SyncStore};
use chainkeys_core::types::{Key, KeyFilter, Operator, OperatorFilter, StakingModule};

use crate::cursor::cursor_from_vec;

#[derive(Default)]
struct State {
    el_meta: Option<ElMeta>,
    modules: BTreeMap<u32, StakingModule>,
    operators: BTreeMap<(String, u64), Operator>,
    keys: BTreeMap<(String, u64, u64), Key>,
    consensus_meta: Option<ConsensusMeta>,
    validators: Vec<Validator>,
    commits: u64,
}

impl State {
    fn apply_update(&mut self, update: ModuleUpdate) {
        let module = update.module_address.clone();

        self.operators.retain(|(m, _), _| *m != module);
        for op in &update.operators {
            self.operators
                .insert((module.clone(), op.index), op.clone());
        }

        let limits = update.key_limit_map();
        self.keys.retain(|(m, op, index), _| {
            *m != module || limits.get(op).is_some_and(|limit| index < limit)
        });
        for key in update.keys {
            self.keys
                .insert((module.clone(), key.operator_index, key.index), key);
        }
    }

    fn module_keys(&self, module: &str, filter: KeyFilter) -> Vec<Key> {
        self.keys
            .values()
            .filter(|k| k.module_address == module && filter.matches(k))
            .cloned()
            .collect()
    }
}

/// In-memory mirror storage.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful pass commits since creation.
    pub fn commit_count(&self) -> u64 {
        self.state.lock().unwrap().commits
    }

    /// Total number of stored keys across all modules.
    pub fn key_count(&self) -> usize {
        self.state.lock().unwrap().keys.len()
    }
}

#[async_trait]
impl SyncStore for InMemoryStorage {
    async fn el_meta(&self) -> Result<Option<ElMeta>> {
        Ok(self.state.lock().unwrap().el_meta.clone())
    }

    async fn staking_modules(&self) -> Result<Vec<StakingModule>> {
        Ok(self.state.lock().unwrap().modules.values().cloned().collect())
    }

    async fn operators(&self, module: &str) -> Result<Vec<Operator>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .operators
            .values()
            .filter(|op| op.module_address == module)
            .cloned()
            .collect())
    }

    async fn commit_pass(&self, commit: PassCommit) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for module in commit.modules {
            state.modules.insert(module.id, module);
        }
        for update in commit.updates {
            state.apply_update(update);
        }
        state.el_meta = Some(commit.meta);
        state.commits += 1;
        Ok(())
    }

    async fn operators_snapshot(
        &self,
        module: &str,
        filter: OperatorFilter,
    ) -> Result<(Vec<Operator>, Option<ElMeta>)> {
        let state = self.state.lock().unwrap();
        let operators = state
            .operators
            .values()
            .filter(|op| op.module_address == module && filter.matches(op))
            .cloned()
            .collect();
        Ok((operators, state.el_meta.clone()))
    }

    async fn keys_snapshot(
        &self,
        module: &str,
        filter: KeyFilter,
    ) -> Result<(Vec<Key>, Option<ElMeta>)> {
        let state = self.state.lock().unwrap();
        Ok((state.module_keys(module, filter), state.el_meta.clone()))
    }

    async fn stream_keys(
        &self,
        module: &str,
        filter: KeyFilter,
        idle: Duration,
    ) -> Result<KeyStream> {
        let keys = self.state.lock().unwrap().module_keys(module, filter);
        Ok(cursor_from_vec(keys, idle))
    }

    async fn consensus_meta(&self) -> Result<Option<ConsensusMeta>> {
        Ok(self.state.lock().unwrap().consensus_meta.clone())
    }

    async fn commit_validators(
        &self,
        meta: ConsensusMeta,
        mut validators: Vec<Validator>,
    ) -> Result<()> {
        validators.sort_by_key(|v| v.index);
        let mut state = self.state.lock().unwrap();
        state.validators = validators;
        state.consensus_meta = Some(meta);
        Ok(())
    }

    async fn validators(&self) -> Result<(Vec<Validator>, Option<ConsensusMeta>)> {
        let state = self.state.lock().unwrap();
        Ok((state.validators.clone(), state.consensus_meta.clone()))
    }

    async fn clear(&self) -> Result<()> {
        *self.state.lock().unwrap() = State::default();
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn empty_store_has_no_meta() {
        let store = InMemoryStorage::new();
        assert!(store.el_meta().await.unwrap().is_none());
        assert!(store.staking_modules().await.unwrap().is_empty());
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn commit_applies_modules_operators_keys_and_meta() {
        let store = InMemoryStorage::new();
        store.commit_pass(sample_commit(2, 3)).await.unwrap();

        assert_eq!(store.staking_modules().await.unwrap().len(), 1);
        assert_eq!(store.operators(MODULE).await.unwrap().len(), 2);
        assert_eq!(store.key_count(), 6);
        assert_eq!(store.el_meta().await.unwrap().unwrap().block_number, 10);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn commit_drops_keys_beyond_limit() {
        let store = InMemoryStorage::new();
        store.commit_pass(sample_commit(1, 5)).await.unwrap();

        let mut shrink = sample_commit(1, 0);
        shrink.updates[0].key_limits = vec![(0, 2)];
        store.commit_pass(shrink).await.unwrap();

        let (keys, _) = store
            .keys_snapshot(MODULE, KeyFilter::default())
            .await
            .unwrap();
        assert_eq!(keys.iter().map(|k| k.index).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn each_operator_is_trimmed_to_its_own_limit() {
        let store = InMemoryStorage::new();
        store.commit_pass(sample_commit(3, 5)).await.unwrap();

        let mut shrink = sample_commit(3, 0);
        shrink.updates[0].key_limits = vec![(2, 1), (0, 4), (1, 5)];
        store.commit_pass(shrink).await.unwrap();

        let (keys, _) = store
            .keys_snapshot(MODULE, KeyFilter::default())
            .await
            .unwrap();
        let per_operator = |op| keys.iter().filter(|k| k.operator_index == op).count();
        assert_eq!((per_operator(0), per_operator(1), per_operator(2)), (4, 5, 1));
    }

    #[tokio::test]
    async fn commit_replaces_operator_set() {
        let store = InMemoryStorage::new();
        store.commit_pass(sample_commit(3, 1)).await.unwrap();
        store.commit_pass(sample_commit(1, 1)).await.unwrap();
        assert_eq!(store.operators(MODULE).await.unwrap().len(), 1);
        // Keys of vanished operators go with them.
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn snapshot_filters_keys() {
        let store = InMemoryStorage::new();
        let mut commit = sample_commit(2, 4);
        commit.updates[0].keys[0].used = true;
        store.commit_pass(commit).await.unwrap();

        let (used, meta) = store
            .keys_snapshot(MODULE, KeyFilter::operator(0).used(true))
            .await
            .unwrap();
        assert_eq!(used.len(), 1);
        assert!(meta.is_some());

        let (ops, _) = store
            .operators_snapshot(MODULE, OperatorFilter { index: Some(1) })
            .await
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].index, 1);
    }

    #[tokio::test]
    async fn stream_yields_all_keys() {
        let store = InMemoryStorage::new();
        store.commit_pass(sample_commit(2, 3)).await.unwrap();
        let keys: Vec<Key> = store
            .stream_keys(MODULE, KeyFilter::default(), Duration::from_secs(5))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 6);
    }

    #[tokio::test]
    async fn validators_replaced_wholesale() {
        let store = InMemoryStorage::new();
        store
            .commit_validators(consensus_meta(64), vec![validator(2), validator(1)])
            .await
            .unwrap();
        store
            .commit_validators(consensus_meta(96), vec![validator(7)])
            .await
            .unwrap();
        let (validators, meta) = store.validators().await.unwrap();
        assert_eq!(validators.len(), 1);
        assert_eq!(meta.unwrap().slot, 96);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let store = InMemoryStorage::new();
        store.commit_pass(sample_commit(1, 1)).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.el_meta().await.unwrap().is_none());
        assert_eq!(store.key_count(), 0);
    }
}
