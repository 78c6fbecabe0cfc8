//! Per-module-type sync strategies.
//!
//! A strategy answers two questions for one module type: up to which key
//! index an operator's keys must be mirrored, and which events signal an
//! operator metadata change. From those, [`ModuleStrategy::refetch_window`]
//! derives the minimal key range that must be re-fetched for an operator.
//!
//! Keys below an operator's used-key count are immutable on chain, so they
//! are skipped unless the operator changed identity or a reorg made the
//! previously observed count untrustworthy.

use std::collections::HashMap;
use std::sync::Arc;

use tiny_keccak::{Hasher, Keccak};

use crate::error::{Result, SyncError};
use crate::types::Operator;

/// Tag of the curated node-operator registry.
pub const CURATED_MODULE_TYPE: &str = "curated-onchain-v1";
/// Tag of the community staking module.
pub const COMMUNITY_MODULE_TYPE: &str = "community-onchain-v1";

const CURATED_OPERATOR_EVENTS: &[&str] = &[
    "NodeOperatorAdded(uint256,string,address,uint64)",
    "NodeOperatorActiveSet(uint256,bool)",
    "NodeOperatorNameSet(uint256,string)",
    "NodeOperatorRewardAddressSet(uint256,address)",
    "NodeOperatorTotalKeysTrimmed(uint256,uint64)",
];

const COMMUNITY_OPERATOR_EVENTS: &[&str] = &[
    "NodeOperatorAdded(uint256,address,address)",
    "NodeOperatorManagerAddressChanged(uint256,address,address)",
    "NodeOperatorRewardAddressChanged(uint256,address,address)",
];

/// Half-open key range `[from, to)` to re-fetch for one operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyWindow {
    pub from: u64,
    pub to: u64,
}

impl KeyWindow {
    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capabilities of one staking-module type.
pub trait ModuleStrategy: Send + Sync {
    /// The module-type tag this strategy serves.
    fn module_type(&self) -> &str;

    /// Exclusive upper bound of the key indices to mirror for `operator`.
    fn right_boundary(&self, operator: &Operator) -> u64;

    /// topic0 values of the events that signal operator metadata changes.
    fn operator_event_topics(&self) -> Vec<String>;

    /// Minimal key window to re-fetch given the previously stored record.
    ///
    /// `finalized_used` is the used-key count read at the finalized block; it
    /// is only supplied when the stored count may come from an orphaned block.
    fn refetch_window(
        &self,
        previous: Option<&Operator>,
        current: &Operator,
        finalized_used: Option<u64>,
    ) -> KeyWindow {
        let to = self.right_boundary(current);
        let unchanged = match previous {
            Some(prev) if prev.is_same_operator(current) => match finalized_used {
                Some(finalized) => prev.used_signing_keys.min(finalized),
                None => prev.used_signing_keys,
            },
            _ => 0,
        };
        // Used keys can only disappear on test chains; start over rather than
        // trust a prefix that no longer exists.
        let from = if unchanged <= to && unchanged <= current.used_signing_keys {
            unchanged
        } else {
            0
        };
        KeyWindow { from, to }
    }
}

/// Curated node-operator registry: mirrors every added key.
#[derive(Debug, Default, Clone, Copy)]
pub struct CuratedStrategy;

impl ModuleStrategy for CuratedStrategy {
    fn module_type(&self) -> &str {
        CURATED_MODULE_TYPE
    }

    fn right_boundary(&self, operator: &Operator) -> u64 {
        operator.total_signing_keys
    }

    fn operator_event_topics(&self) -> Vec<String> {
        CURATED_OPERATOR_EVENTS.iter().map(|s| event_topic(s)).collect()
    }
}

/// Community staking module: mirrors every added key.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommunityStakingStrategy;

impl ModuleStrategy for CommunityStakingStrategy {
    fn module_type(&self) -> &str {
        COMMUNITY_MODULE_TYPE
    }

    fn right_boundary(&self, operator: &Operator) -> u64 {
        operator.total_signing_keys
    }

    fn operator_event_topics(&self) -> Vec<String> {
        COMMUNITY_OPERATOR_EVENTS.iter().map(|s| event_topic(s)).collect()
    }
}

/// Validator-exit view of a curated-style module: only deposited keys matter.
#[derive(Debug, Clone)]
pub struct UsedKeysStrategy {
    module_type: String,
}

impl UsedKeysStrategy {
    pub fn new(module_type: impl Into<String>) -> Self {
        Self {
            module_type: module_type.into(),
        }
    }
}

impl ModuleStrategy for UsedKeysStrategy {
    fn module_type(&self) -> &str {
        &self.module_type
    }

    fn right_boundary(&self, operator: &Operator) -> u64 {
        operator.used_signing_keys
    }

    fn operator_event_topics(&self) -> Vec<String> {
        CURATED_OPERATOR_EVENTS.iter().map(|s| event_topic(s)).collect()
    }
}

/// Strategies keyed by module-type tag.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn ModuleStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Curated and community staking strategies.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CuratedStrategy));
        registry.register(Arc::new(CommunityStakingStrategy));
        registry
    }

    /// Register (or replace) the strategy for its module type.
    pub fn register(&mut self, strategy: Arc<dyn ModuleStrategy>) {
        self.strategies
            .insert(strategy.module_type().to_string(), strategy);
    }

    pub fn get(&self, module_type: &str) -> Result<Arc<dyn ModuleStrategy>> {
        self.strategies
            .get(module_type)
            .cloned()
            .ok_or_else(|| SyncError::UnknownModuleType(module_type.to_string()))
    }

    pub fn module_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.strategies.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// keccak-256 of an event signature, as a `0x`-prefixed topic0.
pub fn event_topic(signature: &str) -> String {
    let mut hasher = Keccak::v256();
    hasher.update(signature.as_bytes());
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    format!("0x{}", hex::encode(out))
}
