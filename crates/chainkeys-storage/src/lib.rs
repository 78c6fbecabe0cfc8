//! chainkeys-storage — pluggable storage backends for ChainKeys.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - `sqlite` — SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres` — PostgreSQL via `sqlx` (production)
//!
//! Every backend implements [`chainkeys_core::SyncStore`]; [`QueryService`]
//! is the read-side facade over any of them.

pub mod cursor;
pub mod memory;
pub mod query;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(test)]
pub(crate) mod testing;

pub use memory::InMemoryStorage;
pub use query::QueryService;

/// Rows per multi-row INSERT unless configured otherwise.
pub const DEFAULT_MAX_ROWS_PER_STATEMENT: usize = 499;
