//! Shared fixtures for backend tests.

use chainkeys_core::chain::sample_key;
use chainkeys_core::checkpoint::ElMeta;
use chainkeys_core::consensus::{ConsensusMeta, Validator, ValidatorStatus};
use chainkeys_core::store::{ModuleUpdate, PassCommit};
use chainkeys_core::types::{ModuleStatus, Operator, StakingModule};

pub const MODULE: &str = "0x55032650b14df07b85bf18a3a3ec8e0af2e028d5";

pub fn module(nonce: u64) -> StakingModule {
    StakingModule {
        id: 1,
        staking_module_address: MODULE.into(),
        module_fee: 500,
        treasury_fee: 500,
        target_share: 10_000,
        status: ModuleStatus::Active,
        name: "curated".into(),
        last_deposit_at: 1_700_000_000,
        last_deposit_block: 9,
        exited_validators_count: 0,
        module_type: "curated-onchain-v1".into(),
        active: true,
        nonce,
    }
}

pub fn operator(index: u64, total: u64) -> Operator {
    Operator {
        module_address: MODULE.into(),
        index,
        active: true,
        name: format!("operator-{index}"),
        reward_address: format!("0x{:040x}", index + 1),
        staking_limit: total,
        stopped_validators: 0,
        total_signing_keys: total,
        used_signing_keys: 0,
    }
}

pub fn meta(block_number: u64) -> ElMeta {
    ElMeta {
        block_number,
        block_hash: format!("0x{block_number:064x}"),
        timestamp: 1_700_000_000 + block_number as i64 * 12,
        last_changed_block_hash: format!("0x{block_number:064x}"),
    }
}

/// A commit at block 10 carrying `operators` operators with `keys` keys each.
pub fn sample_commit(operators: u64, keys: u64) -> PassCommit {
    let mut update = ModuleUpdate::new(MODULE);
    for op in 0..operators {
        update.operators.push(operator(op, keys));
        update.key_limits.push((op, keys));
        update
            .keys
            .extend((0..keys).map(|i| sample_key(MODULE, op, i)));
    }
    PassCommit {
        modules: vec![module(1)],
        updates: vec![update],
        meta: meta(10),
    }
}

pub fn consensus_meta(slot: u64) -> ConsensusMeta {
    ConsensusMeta {
        slot,
        epoch: slot / 32,
        state_root: format!("0x{slot:064x}"),
        block_number: slot,
        block_hash: format!("0x{:064x}", slot + 1),
        timestamp: 1_606_824_023 + slot as i64 * 12,
    }
}

pub fn validator(index: u64) -> Validator {
    Validator {
        index,
        pubkey: format!("0x{index:096x}"),
        status: ValidatorStatus::ActiveOngoing,
    }
}
