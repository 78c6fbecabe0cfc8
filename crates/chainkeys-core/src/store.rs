//! Storage abstraction for the mirrored state.
//!
//! The store is the only shared mutable resource. It is written exclusively
//! through [`SyncStore::commit_pass`] (and the validator equivalent), which
//! applies data and checkpoint in one transaction, so readers only ever see
//! the last fully committed snapshot.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::ElMeta;
use crate::consensus::{ConsensusMeta, Validator};
use crate::error::Result;
use crate::types::{Key, KeyFilter, Operator, OperatorFilter, StakingModule};

/// Lazy, finite, non-restartable sequence of keys read from the store.
pub type KeyStream = BoxStream<'static, Result<Key>>;

/// Replacement data for one resynced module.
#[derive(Debug, Clone, Default)]
pub struct ModuleUpdate {
    pub module_address: String,
    /// Every operator of the module at the pass head, in index order.
    pub operators: Vec<Operator>,
    /// Re-fetched keys; indices outside the fetched windows are left as stored.
    pub keys: Vec<Key>,
    /// `(operator_index, boundary)`: stored keys at or above the boundary are dropped.
    pub key_limits: Vec<(u64, u64)>,
}

impl ModuleUpdate {
    pub fn new(module_address: impl Into<String>) -> Self {
        Self {
            module_address: module_address.into(),
            ..Default::default()
        }
    }

    /// Boundary per operator index; operators absent from the map keep no keys.
    pub fn key_limit_map(&self) -> HashMap<u64, u64> {
        self.key_limits.iter().copied().collect()
    }
}

/// Everything one update pass writes, applied atomically.
#[derive(Debug, Clone)]
pub struct PassCommit {
    /// Module descriptors observed at the pass head (nonces included).
    pub modules: Vec<StakingModule>,
    pub updates: Vec<ModuleUpdate>,
    /// Replaces the stored checkpoint.
    pub meta: ElMeta,
}

/// Typed repositories for modules, operators, keys and checkpoints.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn el_meta(&self) -> Result<Option<ElMeta>>;

    async fn staking_modules(&self) -> Result<Vec<StakingModule>>;

    /// All stored operators of one module, in index order.
    async fn operators(&self, module: &str) -> Result<Vec<Operator>>;

    /// Apply a pass in a single read-committed transaction: upsert module
    /// descriptors, replace each updated module's operators, merge keys, drop
    /// keys beyond each operator's boundary, then swap the checkpoint.
    async fn commit_pass(&self, commit: PassCommit) -> Result<()>;

    /// Operators plus the checkpoint they belong to, read in one
    /// repeatable-read transaction.
    async fn operators_snapshot(
        &self,
        module: &str,
        filter: OperatorFilter,
    ) -> Result<(Vec<Operator>, Option<ElMeta>)>;

    /// Keys plus the checkpoint they belong to, read in one repeatable-read
    /// transaction.
    async fn keys_snapshot(
        &self,
        module: &str,
        filter: KeyFilter,
    ) -> Result<(Vec<Key>, Option<ElMeta>)>;

    /// Stream keys row by row. The underlying query is cancelled if the
    /// consumer does not take a row within `idle`.
    async fn stream_keys(&self, module: &str, filter: KeyFilter, idle: Duration)
        -> Result<KeyStream>;

    async fn consensus_meta(&self) -> Result<Option<ConsensusMeta>>;

    /// Replace every validator and the consensus checkpoint atomically.
    async fn commit_validators(&self, meta: ConsensusMeta, validators: Vec<Validator>)
        -> Result<()>;

    async fn validators(&self) -> Result<(Vec<Validator>, Option<ConsensusMeta>)>;

    /// Delete every mirrored row.
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl<T: SyncStore + ?Sized> SyncStore for Arc<T> {
    async fn el_meta(&self) -> Result<Option<ElMeta>> {
        (**self).el_meta().await
    }

    async fn staking_modules(&self) -> Result<Vec<StakingModule>> {
        (**self).staking_modules().await
    }

    async fn operators(&self, module: &str) -> Result<Vec<Operator>> {
        (**self).operators(module).await
    }

    async fn commit_pass(&self, commit: PassCommit) -> Result<()> {
        (**self).commit_pass(commit).await
    }

    async fn operators_snapshot(
        &self,
        module: &str,
        filter: OperatorFilter,
    ) -> Result<(Vec<Operator>, Option<ElMeta>)> {
        (**self).operators_snapshot(module, filter).await
    }

    async fn keys_snapshot(
        &self,
        module: &str,
        filter: KeyFilter,
    ) -> Result<(Vec<Key>, Option<ElMeta>)> {
        (**self).keys_snapshot(module, filter).await
    }

    async fn stream_keys(
        &self,
        module: &str,
        filter: KeyFilter,
        idle: Duration,
    ) -> Result<KeyStream> {
        (**self).stream_keys(module, filter, idle).await
    }

    async fn consensus_meta(&self) -> Result<Option<ConsensusMeta>> {
        (**self).consensus_meta().await
    }

    async fn commit_validators(
        &self,
        meta: ConsensusMeta,
        validators: Vec<Validator>,
    ) -> Result<()> {
        (**self).commit_validators(meta, validators).await
    }

    async fn validators(&self) -> Result<(Vec<Validator>, Option<ConsensusMeta>)> {
        (**self).validators().await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_limits_by_operator() {
        let mut update = ModuleUpdate::new("0xmodule");
        update.key_limits = vec![(0, 5), (2, 9)];
        let limits = update.key_limit_map();
        assert_eq!(limits.get(&0), Some(&5));
        assert_eq!(limits.get(&2), Some(&9));
        assert_eq!(limits.get(&1), None);
    }
}
