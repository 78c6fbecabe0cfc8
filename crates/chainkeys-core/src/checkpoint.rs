//! Execution-layer checkpoint: the chain position the stored mirror reflects.
//!
//! A checkpoint is replaced, never appended: the store keeps exactly one row,
//! installed in the same transaction as the data it describes. The value is
//! threaded through each update pass instead of being cached on a service, so
//! passes are independent and can be tested in isolation.

use serde::{Deserialize, Serialize};

use crate::types::BlockHeader;

/// The `(block_number, block_hash)` pair the stored mirror currently reflects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElMeta {
    pub block_number: u64,
    pub block_hash: String,
    /// Unix timestamp of the checkpoint block.
    pub timestamp: i64,
    /// Hash of the head at which a module was last actually resynced.
    pub last_changed_block_hash: String,
}

impl ElMeta {
    /// Checkpoint for a cold start: everything was just fetched at `head`.
    pub fn genesis(head: &BlockHeader) -> Self {
        Self {
            block_number: head.number,
            block_hash: head.hash.clone(),
            timestamp: head.timestamp,
            last_changed_block_hash: head.hash.clone(),
        }
    }

    /// The checkpoint that replaces `self` once a pass at `head` commits.
    ///
    /// `changed` is whether any module was resynced during the pass.
    pub fn advance(&self, head: &BlockHeader, changed: bool) -> Self {
        let last_changed_block_hash = if changed {
            head.hash.clone()
        } else {
            self.last_changed_block_hash.clone()
        };
        Self {
            block_number: head.number,
            block_hash: head.hash.clone(),
            timestamp: head.timestamp,
            last_changed_block_hash,
        }
    }

    /// Returns `true` if `head` is the very block this checkpoint describes.
    pub fn is_at(&self, head: &BlockHeader) -> bool {
        self.block_hash == head.hash
    }

    /// Returns `true` if `head` lies below the checkpoint (lagging or
    /// misconfigured endpoint).
    pub fn is_ahead_of(&self, head: &BlockHeader) -> bool {
        head.number < self.block_number
    }

    /// Blocks elapsed between the checkpoint and `head`.
    pub fn gap_to(&self, head: &BlockHeader) -> u64 {
        head.number.saturating_sub(self.block_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(number: u64, hash: &str) -> BlockHeader {
        BlockHeader {
            number,
            hash: hash.into(),
            parent_hash: "0xparent".into(),
            timestamp: (number * 12) as i64,
        }
    }

    #[test]
    fn genesis_marks_head_as_changed() {
        let meta = ElMeta::genesis(&head(100, "0xa"));
        assert_eq!(meta.block_number, 100);
        assert_eq!(meta.last_changed_block_hash, "0xa");
    }

    #[test]
    fn advance_without_changes_keeps_last_changed() {
        let meta = ElMeta::genesis(&head(100, "0xa"));
        let next = meta.advance(&head(105, "0xf"), false);
        assert_eq!(next.block_number, 105);
        assert_eq!(next.block_hash, "0xf");
        assert_eq!(next.last_changed_block_hash, "0xa");
    }

    #[test]
    fn advance_with_changes_moves_last_changed() {
        let meta = ElMeta::genesis(&head(100, "0xa"));
        let next = meta.advance(&head(101, "0xb"), true);
        assert_eq!(next.last_changed_block_hash, "0xb");
    }

    #[test]
    fn lagging_head_detection() {
        let meta = ElMeta::genesis(&head(100, "0xa"));
        assert!(meta.is_ahead_of(&head(99, "0x9")));
        assert!(!meta.is_ahead_of(&head(100, "0xa")));
        assert_eq!(meta.gap_to(&head(99, "0x9")), 0);
        assert_eq!(meta.gap_to(&head(140, "0xz")), 40);
    }
}
