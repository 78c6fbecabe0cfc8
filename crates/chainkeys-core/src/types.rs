//! Shared domain types: chain primitives and the mirrored staking-module entities.

use serde::{Deserialize, Serialize};

// ─── BlockHeader ──────────────────────────────────────────────────────────────

/// The subset of an execution-layer block header the synchronizer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// Which chain snapshot a read observes.
///
/// A whole fetch pass uses one `Hash` reference so that every underlying call
/// sees the same state, however many calls the pass issues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockRef {
    Latest,
    Finalized,
    Number(u64),
    Hash(String),
}

impl BlockRef {
    pub fn hash(hash: impl Into<String>) -> Self {
        Self::Hash(hash.into())
    }
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Finalized => write!(f, "finalized"),
            Self::Number(n) => write!(f, "#{n}"),
            Self::Hash(h) => write!(f, "{h}"),
        }
    }
}

// ─── Chain call results ───────────────────────────────────────────────────────

/// A log entry as returned by `eth_getLogs`, already parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: String,
    pub topics: Vec<String>,
    pub block_number: u64,
    pub block_hash: String,
    /// Set by the node when the log was dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

/// Raw result of one signing-key range call: two packed hex blobs and the
/// per-key used flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedKeys {
    pub pubkeys: String,
    pub signatures: String,
    pub used: Vec<bool>,
}

// ─── Key ──────────────────────────────────────────────────────────────────────

/// One validator signing key of one operator of one module.
///
/// Identity is `(module_address, operator_index, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub module_address: String,
    pub operator_index: u64,
    /// Position of the key within the operator's key list.
    pub index: u64,
    /// 48-byte BLS public key (`0x…`).
    pub key: String,
    /// 96-byte deposit signature (`0x…`).
    pub deposit_signature: String,
    pub used: bool,
}

// ─── Operator ─────────────────────────────────────────────────────────────────

/// A node operator registered in one module.
///
/// Identity is `(module_address, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub module_address: String,
    pub index: u64,
    pub active: bool,
    pub name: String,
    pub reward_address: String,
    pub staking_limit: u64,
    pub stopped_validators: u64,
    pub total_signing_keys: u64,
    pub used_signing_keys: u64,
}

impl Operator {
    /// Returns `true` if `other` describes the same operator entity, i.e. the
    /// keys it reported as used still belong to the same owner.
    pub fn is_same_operator(&self, other: &Operator) -> bool {
        self.index == other.index
            && self.module_address.eq_ignore_ascii_case(&other.module_address)
            && self.reward_address.eq_ignore_ascii_case(&other.reward_address)
    }
}

// ─── StakingModule ────────────────────────────────────────────────────────────

/// On-chain lifecycle status of a staking module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Active,
    DepositsPaused,
    Stopped,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::DepositsPaused => "deposits_paused",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "deposits_paused" => Some(Self::DepositsPaused),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

/// Cached copy of one module's on-chain descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakingModule {
    pub id: u32,
    pub staking_module_address: String,
    /// Module fee in basis points.
    pub module_fee: u32,
    /// Treasury fee in basis points.
    pub treasury_fee: u32,
    /// Target share in basis points.
    pub target_share: u32,
    pub status: ModuleStatus,
    pub name: String,
    pub last_deposit_at: i64,
    pub last_deposit_block: u64,
    pub exited_validators_count: u64,
    /// Module-type tag, e.g. `"curated-onchain-v1"`.
    pub module_type: String,
    pub active: bool,
    /// Change counter bumped by the module on any key/operator mutation.
    pub nonce: u64,
}

/// How a caller names a staking module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSelector {
    Id(u32),
    Address(String),
}

impl ModuleSelector {
    /// Parses a numeric id or a `0x` address.
    pub fn parse(s: &str) -> Self {
        match s.parse::<u32>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Address(s.to_string()),
        }
    }

    pub fn matches(&self, module: &StakingModule) -> bool {
        match self {
            Self::Id(id) => module.id == *id,
            Self::Address(addr) => module.staking_module_address.eq_ignore_ascii_case(addr),
        }
    }
}

// ─── Filters ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorFilter {
    pub index: Option<u64>,
}

impl OperatorFilter {
    pub fn matches(&self, op: &Operator) -> bool {
        self.index.map_or(true, |i| op.index == i)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFilter {
    pub operator_index: Option<u64>,
    pub used: Option<bool>,
}

impl KeyFilter {
    pub fn operator(index: u64) -> Self {
        Self {
            operator_index: Some(index),
            ..Default::default()
        }
    }

    pub fn used(mut self, used: bool) -> Self {
        self.used = Some(used);
        self
    }

    pub fn matches(&self, key: &Key) -> bool {
        self.operator_index.map_or(true, |i| key.operator_index == i)
            && self.used.map_or(true, |u| key.used == u)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
