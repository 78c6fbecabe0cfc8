//! Batch planner: splits a key range into bounded windows for parallel fetch.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// One `[offset, offset + size)` window of a planned range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub offset: u64,
    pub size: u64,
}

impl Batch {
    /// Exclusive end of the window.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Cover `[offset, offset + total)` with windows of at most `batch_size`,
/// in ascending order; only the last window may be shorter.
///
/// `(3, 0, 10)` plans `[(0,3), (3,3), (6,3), (9,1)]`.
pub fn plan_batches(batch_size: u64, offset: u64, total: u64) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(SyncError::InvalidArgument(
            "batch size must be positive".into(),
        ));
    }
    let end = offset.checked_add(total).ok_or_else(|| {
        SyncError::InvalidArgument(format!("range {offset}+{total} overflows"))
    })?;

    let mut batches = Vec::new();
    let mut start = offset;
    while start < end {
        let size = batch_size.min(end - start);
        batches.push(Batch {
            offset: start,
            size,
        });
        start += size;
    }
    Ok(batches)
}
