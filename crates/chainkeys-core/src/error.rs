//! Error types for the chainkeys synchronization pipeline.

use thiserror::Error;

/// Errors that can occur while mirroring staking-module state.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient chain I/O failure (connection reset, node hiccup, …).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// A chain call or cursor exceeded its deadline.
    #[error("Timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The chain returned data that cannot be decoded (corrupt or mismatched blobs).
    #[error("Decode error: {0}")]
    Decode(String),

    /// Caller passed arguments outside the accepted domain.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A module the store already knows disappeared from the chain.
    #[error("Staking module list shrank from {previous} to {current} modules")]
    ModuleListShrank { previous: usize, current: usize },

    #[error("No sync strategy registered for module type '{0}'")]
    UnknownModuleType(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Unrecoverable condition; the process is expected to exit.
    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Returns `true` if the error is transient and the call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Timeout { .. })
    }

    /// Returns `true` if the error must terminate the process rather than
    /// wait for the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ModuleListShrank { .. } | Self::Fatal(_))
    }
}

/// Convenience alias used across the workspace.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
