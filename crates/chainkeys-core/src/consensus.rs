//! Consensus-layer mirror: finalized state checkpoint and validator set.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SyncError};

/// Checkpoint of the finalized beacon state the validator mirror reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMeta {
    pub slot: u64,
    pub epoch: u64,
    pub state_root: String,
    /// Execution block embedded in the finalized beacon block.
    pub block_number: u64,
    pub block_hash: String,
    pub timestamp: i64,
}

/// Beacon-chain validator lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    PendingInitialized,
    PendingQueued,
    ActiveOngoing,
    ActiveExiting,
    ActiveSlashed,
    ExitedUnslashed,
    ExitedSlashed,
    WithdrawalPossible,
    WithdrawalDone,
}

impl ValidatorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingInitialized => "pending_initialized",
            Self::PendingQueued => "pending_queued",
            Self::ActiveOngoing => "active_ongoing",
            Self::ActiveExiting => "active_exiting",
            Self::ActiveSlashed => "active_slashed",
            Self::ExitedUnslashed => "exited_unslashed",
            Self::ExitedSlashed => "exited_slashed",
            Self::WithdrawalPossible => "withdrawal_possible",
            Self::WithdrawalDone => "withdrawal_done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending_initialized" => Self::PendingInitialized,
            "pending_queued" => Self::PendingQueued,
            "active_ongoing" => Self::ActiveOngoing,
            "active_exiting" => Self::ActiveExiting,
            "active_slashed" => Self::ActiveSlashed,
            "exited_unslashed" => Self::ExitedUnslashed,
            "exited_slashed" => Self::ExitedSlashed,
            "withdrawal_possible" => Self::WithdrawalPossible,
            "withdrawal_done" => Self::WithdrawalDone,
            _ => return None,
        })
    }

    /// Validators that may still be asked to exit.
    pub fn is_exit_eligible(&self) -> bool {
        matches!(self, Self::ActiveOngoing)
    }
}

/// One beacon-chain validator, identified by its public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub index: u64,
    pub pubkey: String,
    pub status: ValidatorStatus,
}

/// Read access to a consensus-layer node.
#[async_trait]
pub trait ConsensusReader: Send + Sync {
    /// Header summary of the latest finalized beacon state.
    async fn finalized_state(&self) -> Result<ConsensusMeta>;

    /// Full validator set of the state with `state_root`.
    async fn validators(&self, state_root: &str) -> Result<Vec<Validator>>;
}

#[async_trait]
impl<T: ConsensusReader + ?Sized> ConsensusReader for Arc<T> {
    async fn finalized_state(&self) -> Result<ConsensusMeta> {
        (**self).finalized_state().await
    }

    async fn validators(&self, state_root: &str) -> Result<Vec<Validator>> {
        (**self).validators(state_root).await
    }
}

/// Scriptable consensus node for tests.
#[derive(Default)]
pub struct MemoryConsensus {
    state: Mutex<Option<(ConsensusMeta, Vec<Validator>)>>,
}

impl MemoryConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalize(&self, meta: ConsensusMeta, validators: Vec<Validator>) {
        *self.state.lock().unwrap() = Some((meta, validators));
    }
}

#[async_trait]
impl ConsensusReader for MemoryConsensus {
    async fn finalized_state(&self) -> Result<ConsensusMeta> {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|(meta, _)| meta.clone())
            .ok_or_else(|| SyncError::Rpc("no finalized state".into()))
    }

    async fn validators(&self, state_root: &str) -> Result<Vec<Validator>> {
        match self.state.lock().unwrap().as_ref() {
            Some((meta, validators)) if meta.state_root == state_root => Ok(validators.clone()),
            _ => Err(SyncError::Rpc(format!("unknown state {state_root}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        let all = [
            ValidatorStatus::PendingInitialized,
            ValidatorStatus::PendingQueued,
            ValidatorStatus::ActiveOngoing,
            ValidatorStatus::ActiveExiting,
            ValidatorStatus::ActiveSlashed,
            ValidatorStatus::ExitedUnslashed,
            ValidatorStatus::ExitedSlashed,
            ValidatorStatus::WithdrawalPossible,
            ValidatorStatus::WithdrawalDone,
        ];
        for s in all {
            assert_eq!(ValidatorStatus::parse(s.as_str()), Some(s));
        }
        assert!(ValidatorStatus::ActiveOngoing.is_exit_eligible());
        assert!(!ValidatorStatus::ExitedSlashed.is_exit_eligible());
    }

    #[tokio::test]
    async fn memory_consensus_serves_matching_root_only() {
        let node = MemoryConsensus::new();
        assert!(node.finalized_state().await.is_err());
        node.finalize(
            ConsensusMeta {
                slot: 64,
                epoch: 2,
                state_root: "0xroot".into(),
                block_number: 10,
                block_hash: "0xblock".into(),
                timestamp: 0,
            },
            vec![],
        );
        assert_eq!(node.finalized_state().await.unwrap().slot, 64);
        assert!(node.validators("0xroot").await.is_ok());
        assert!(node.validators("0xother").await.is_err());
    }
}
