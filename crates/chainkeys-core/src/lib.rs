//! chainkeys-core — foundation for the reorg-safe staking-module mirror.
//!
//! # Architecture
//!
//! ```text
//! SyncScheduler → Updater (one pass per tick)
//!                    ├── ReorgDetector     (checkpoint → head ancestry walk)
//!                    ├── StrategyRegistry  (per-module-type key windows)
//!                    ├── Fetch services    (BatchPlanner + KeyCodec over ChainReader)
//!                    └── SyncStore         (memory / SQLite / Postgres, one commit per pass)
//! ```

pub mod batch;
pub mod chain;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod consensus;
pub mod error;
pub mod reorg;
pub mod store;
pub mod strategy;
pub mod types;

pub use batch::{plan_batches, Batch};
pub use chain::{ChainReader, MemoryChain};
pub use checkpoint::ElMeta;
pub use config::SyncConfig;
pub use consensus::{ConsensusMeta, ConsensusReader, Validator, ValidatorStatus};
pub use error::{Result, SyncError};
pub use reorg::{ReorgDetector, ReorgEvent, ReorgType};
pub use store::{KeyStream, ModuleUpdate, PassCommit, SyncStore};
pub use strategy::{KeyWindow, ModuleStrategy, StrategyRegistry};
pub use types::{
    BlockHeader, BlockRef, Key, KeyFilter, ModuleSelector, Operator, OperatorFilter,
    StakingModule,
};
