//! Consensus-layer validator registry sync.
//!
//! Mirrors the validator set of the latest finalized beacon state. Like the
//! execution-layer updater, a pass is a no-op when the stored slot already
//! matches, and refuses to move the mirror backwards.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use chainkeys_core::consensus::{ConsensusMeta, ConsensusReader};
use chainkeys_core::error::Result;
use chainkeys_core::store::SyncStore;

use crate::scheduler::Tickable;

/// Result of one [`ValidatorRegistry::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryOutcome {
    /// The finalized slot is below the stored one; nothing was written.
    Lagging { slot: u64, stored: u64 },
    /// The stored slot is the finalized slot.
    Unchanged,
    Updated { slot: u64, validators: usize },
}

pub struct ValidatorRegistry<C, S> {
    consensus: C,
    store: S,
}

impl<C: ConsensusReader, S: SyncStore> ValidatorRegistry<C, S> {
    pub fn new(consensus: C, store: S) -> Self {
        Self { consensus, store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replace the mirrored validator set with the finalized one.
    pub async fn update(&self) -> Result<RegistryOutcome> {
        let finalized = self.consensus.finalized_state().await?;
        if let Some(stored) = self.store.consensus_meta().await? {
            if let Some(outcome) = compare_slots(&stored, &finalized) {
                return Ok(outcome);
            }
        }

        let validators = self.consensus.validators(&finalized.state_root).await?;
        let count = validators.len();
        let slot = finalized.slot;
        self.store.commit_validators(finalized, validators).await?;
        info!(slot, validators = count, "validator registry updated");
        Ok(RegistryOutcome::Updated {
            slot,
            validators: count,
        })
    }
}

fn compare_slots(stored: &ConsensusMeta, finalized: &ConsensusMeta) -> Option<RegistryOutcome> {
    if finalized.slot == stored.slot {
        debug!(slot = stored.slot, "finalized slot unchanged");
        return Some(RegistryOutcome::Unchanged);
    }
    if finalized.slot < stored.slot {
        warn!(
            slot = finalized.slot,
            stored = stored.slot,
            "finalized slot is behind stored registry, skipping update"
        );
        return Some(RegistryOutcome::Lagging {
            slot: finalized.slot,
            stored: stored.slot,
        });
    }
    None
}

#[async_trait]
impl<C: ConsensusReader, S: SyncStore> Tickable for ValidatorRegistry<C, S> {
    fn name(&self) -> &str {
        "validator-registry"
    }

    async fn tick(&self) -> Result<()> {
        self.update().await.map(|_| ())
    }
}
