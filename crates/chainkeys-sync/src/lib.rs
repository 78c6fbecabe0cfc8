//! chainkeys-sync — fetch services, synchronization pass and scheduler.

pub mod builder;
pub mod fetch;
pub mod retry;
pub mod scheduler;
pub mod updater;
pub mod validators;

pub use builder::SyncConfigBuilder;
pub use fetch::{
    KeyBatchFetchService, NonceFetchService, OperatorFetchService, StakingModuleFetchService,
};
pub use retry::{RetryConfig, RetryPolicy, RetryingReader};
pub use scheduler::{
    ExpireHook, FatalHook, PassGuard, PassPermit, SyncScheduler, TickResult, Tickable, Watchdog,
};
pub use updater::{PassOutcome, ResyncReason, Updater};
pub use validators::{RegistryOutcome, ValidatorRegistry};
