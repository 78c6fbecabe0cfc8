//! The synchronization pass.
//!
//! One pass compares the stored checkpoint with the chain head, decides per
//! module whether its mirror must be refreshed, performs every chain read
//! for the modules that must, and finally writes modules, operators, keys
//! and the new checkpoint in a single store commit.
//!
//! ```text
//! el_meta + head ─┬─ head behind checkpoint ──→ Lagging   (no writes)
//!                 ├─ head == checkpoint ───────→ Unchanged (no writes)
//!                 └─ per module: cold start | nonce | block gap | reorg | operator events
//!                        └─→ fetch operators + key windows at head hash
//!                                 └─→ commit_pass(modules, updates, meta)
//! ```
//!
//! The updater keeps no state between passes: the checkpoint read at the
//! start of a pass is the only input carried over from the previous one.

use std::fmt;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use chainkeys_core::chain::ChainReader;
use chainkeys_core::checkpoint::ElMeta;
use chainkeys_core::config::SyncConfig;
use chainkeys_core::error::{Result, SyncError};
use chainkeys_core::reorg::ReorgDetector;
use chainkeys_core::store::{ModuleUpdate, PassCommit, SyncStore};
use chainkeys_core::strategy::{ModuleStrategy, StrategyRegistry};
use chainkeys_core::types::{BlockHeader, BlockRef, StakingModule};

use crate::fetch::{
    KeyBatchFetchService, NonceFetchService, OperatorFetchService, StakingModuleFetchService,
};
use crate::scheduler::Tickable;

/// Result of one [`Updater::run_pass`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The head is below the stored checkpoint; nothing was written.
    Lagging { head: u64, checkpoint: u64 },
    /// The head is the checkpoint block; nothing was written.
    Unchanged,
    /// A commit was made at `head`.
    Synced {
        head: BlockHeader,
        /// Addresses of the modules that were resynced.
        updated_modules: Vec<String>,
    },
}

/// Why a module is resynced during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncReason {
    ColdStart,
    NonceChanged { stored: u64, current: u64 },
    BlockGap(u64),
    Reorg,
    OperatorEvents(usize),
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ColdStart => write!(f, "cold start"),
            Self::NonceChanged { stored, current } => write!(f, "nonce {stored} -> {current}"),
            Self::BlockGap(gap) => write!(f, "{gap} blocks since checkpoint"),
            Self::Reorg => write!(f, "reorg"),
            Self::OperatorEvents(n) => write!(f, "{n} operator events"),
        }
    }
}

/// Facts established once per pass and shared by every module.
#[derive(Debug, Default)]
struct PassState {
    /// Reorg verdict, computed on first need.
    reorg: Option<bool>,
}

/// Drives update passes for every staking module.
pub struct Updater<R, S> {
    reader: R,
    store: S,
    strategies: StrategyRegistry,
    config: SyncConfig,
}

impl<R: ChainReader, S: SyncStore> Updater<R, S> {
    pub fn new(reader: R, store: S, config: SyncConfig) -> Self {
        Self {
            reader,
            store,
            strategies: StrategyRegistry::with_defaults(),
            config,
        }
    }

    /// Replace the module-type strategy registry.
    pub fn with_strategies(mut self, strategies: StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one update pass.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let meta = self.store.el_meta().await?;
        let head = self.reader.get_block(BlockRef::Latest).await?;

        if let Some(meta) = &meta {
            if meta.is_ahead_of(&head) {
                warn!(
                    chain = %self.config.chain,
                    head = head.number,
                    checkpoint = meta.block_number,
                    "head is behind stored checkpoint, skipping pass"
                );
                return Ok(PassOutcome::Lagging {
                    head: head.number,
                    checkpoint: meta.block_number,
                });
            }
            if meta.is_at(&head) {
                debug!(head = head.number, "head unchanged");
                return Ok(PassOutcome::Unchanged);
            }
        }

        let at = BlockRef::hash(&head.hash);
        let modules = StakingModuleFetchService::new(&self.reader).modules(&at).await?;
        let stored_modules = self.store.staking_modules().await?;
        check_module_list(&stored_modules, &modules)?;

        let mut state = PassState::default();
        let mut updates = Vec::new();
        for module in &modules {
            let strategy = self.strategies.get(&module.module_type)?;
            let stored = stored_modules.iter().find(|m| m.id == module.id);
            let reason = self
                .resync_reason(meta.as_ref(), &head, module, stored, strategy.as_ref(), &mut state)
                .await?;
            match reason {
                Some(reason) => {
                    info!(
                        module = %module.staking_module_address,
                        id = module.id,
                        reason = %reason,
                        "resyncing module"
                    );
                    // Stored used counts are only a safe prefix while the
                    // checkpoint block is still canonical.
                    let reorg = match &meta {
                        Some(meta) => self.reorged(meta, &head, &mut state).await?,
                        None => false,
                    };
                    updates.push(
                        self.plan_update(module, strategy.as_ref(), &at, reorg)
                            .await?,
                    );
                }
                None => debug!(module = %module.staking_module_address, "module unchanged"),
            }
        }

        let changed = !updates.is_empty();
        let next = match &meta {
            Some(meta) => meta.advance(&head, changed),
            None => ElMeta::genesis(&head),
        };
        let updated_modules: Vec<String> =
            updates.iter().map(|u| u.module_address.clone()).collect();

        self.store
            .commit_pass(PassCommit {
                modules,
                updates,
                meta: next,
            })
            .await?;

        info!(
            chain = %self.config.chain,
            head = head.number,
            updated = updated_modules.len(),
            "pass committed"
        );
        Ok(PassOutcome::Synced {
            head,
            updated_modules,
        })
    }

    /// First trigger that forces a resync of `module`, if any.
    async fn resync_reason(
        &self,
        meta: Option<&ElMeta>,
        head: &BlockHeader,
        module: &StakingModule,
        stored: Option<&StakingModule>,
        strategy: &dyn ModuleStrategy,
        state: &mut PassState,
    ) -> Result<Option<ResyncReason>> {
        let (Some(meta), Some(stored)) = (meta, stored) else {
            return Ok(Some(ResyncReason::ColdStart));
        };
        let address = module.staking_module_address.as_str();

        let current = NonceFetchService::new(&self.reader)
            .current_nonce(address, &BlockRef::hash(&head.hash))
            .await?;
        if current != stored.nonce {
            return Ok(Some(ResyncReason::NonceChanged {
                stored: stored.nonce,
                current,
            }));
        }

        let gap = meta.gap_to(head);
        if gap > self.config.max_block_gap {
            return Ok(Some(ResyncReason::BlockGap(gap)));
        }

        if self.reorged(meta, head, state).await? {
            return Ok(Some(ResyncReason::Reorg));
        }

        if head.number > meta.block_number {
            let topics = strategy.operator_event_topics();
            let events = self
                .reader
                .get_logs(address, &topics, meta.block_number + 1, head.number)
                .await?
                .into_iter()
                .filter(|log| !log.removed)
                .count();
            if events > 0 {
                return Ok(Some(ResyncReason::OperatorEvents(events)));
            }
        }

        Ok(None)
    }

    /// Reorg verdict for this pass, detected at most once.
    async fn reorged(
        &self,
        meta: &ElMeta,
        head: &BlockHeader,
        state: &mut PassState,
    ) -> Result<bool> {
        if let Some(reorg) = state.reorg {
            return Ok(reorg);
        }
        let previous = BlockHeader {
            number: meta.block_number,
            hash: meta.block_hash.clone(),
            parent_hash: String::new(),
            timestamp: meta.timestamp,
        };
        let detector = ReorgDetector::new(
            &self.reader,
            self.config.max_reorg_depth,
            self.config.batch_concurrency,
        );
        let reorg = detector.check(&previous, head).await?.is_some();
        state.reorg = Some(reorg);
        Ok(reorg)
    }

    /// Read everything a module resync needs at `at`.
    async fn plan_update(
        &self,
        module: &StakingModule,
        strategy: &dyn ModuleStrategy,
        at: &BlockRef,
        reorg: bool,
    ) -> Result<ModuleUpdate> {
        let address = module.staking_module_address.as_str();
        let operators_svc = OperatorFetchService::new(&self.reader, self.config.batch_concurrency);
        let keys_svc = KeyBatchFetchService::new(
            &self.reader,
            self.config.key_batch_size,
            self.config.batch_concurrency,
        );

        let operators = operators_svc.fetch_all(address, at).await?;
        let stored = self.store.operators(address).await?;
        // Used counts stored before a reorg may come from an orphaned block.
        let finalized = if reorg {
            Some(operators_svc.finalized_used_keys(address).await)
        } else {
            None
        };

        let mut update = ModuleUpdate::new(address);
        for operator in &operators {
            let previous = stored.iter().find(|p| p.index == operator.index);
            let finalized_used = finalized
                .as_ref()
                .map(|used| used.get(&operator.index).copied().unwrap_or(0));
            let window = strategy.refetch_window(previous, operator, finalized_used);
            let keys = keys_svc
                .fetch(address, operator.index, window.from, window.to, at)
                .await?;
            debug!(
                module = address,
                operator = operator.index,
                from = window.from,
                to = window.to,
                "operator keys fetched"
            );
            update
                .key_limits
                .push((operator.index, strategy.right_boundary(operator)));
            update.keys.extend(keys);
        }
        update.operators = operators;
        Ok(update)
    }
}

/// Every stored module must still exist on chain.
fn check_module_list(stored: &[StakingModule], current: &[StakingModule]) -> Result<()> {
    let vanished = stored
        .iter()
        .any(|s| !current.iter().any(|c| c.id == s.id));
    if current.len() < stored.len() || vanished {
        return Err(SyncError::ModuleListShrank {
            previous: stored.len(),
            current: current.len(),
        });
    }
    Ok(())
}

#[async_trait]
impl<R: ChainReader, S: SyncStore> Tickable for Updater<R, S> {
    fn name(&self) -> &str {
        "el-updater"
    }

    async fn tick(&self) -> Result<()> {
        self.run_pass().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainkeys_core::types::ModuleStatus;

    fn module(id: u32) -> StakingModule {
        StakingModule {
            id,
            staking_module_address: format!("0x{id:040x}"),
            module_fee: 0,
            treasury_fee: 0,
            target_share: 0,
            status: ModuleStatus::Active,
            name: format!("m{id}"),
            last_deposit_at: 0,
            last_deposit_block: 0,
            exited_validators_count: 0,
            module_type: "curated-onchain-v1".into(),
            active: true,
            nonce: 0,
        }
    }

    #[test]
    fn module_list_may_grow() {
        assert!(check_module_list(&[module(1)], &[module(1), module(2)]).is_ok());
        assert!(check_module_list(&[], &[module(1)]).is_ok());
    }

    #[test]
    fn module_list_shrink_is_fatal() {
        let err = check_module_list(&[module(1), module(2)], &[module(1)]).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, SyncError::ModuleListShrank { previous: 2, current: 1 }));
    }

    #[test]
    fn replaced_module_counts_as_shrink() {
        let err = check_module_list(&[module(1)], &[module(2)]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn reasons_render() {
        assert_eq!(
            ResyncReason::NonceChanged { stored: 1, current: 2 }.to_string(),
            "nonce 1 -> 2"
        );
        assert_eq!(ResyncReason::BlockGap(40).to_string(), "40 blocks since checkpoint");
    }
}
