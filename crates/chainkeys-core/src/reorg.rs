//! Reorg detection between the stored checkpoint and the observed head.
//!
//! Handles three scenarios:
//! 1. **Direct descendant**: the head's parent is the checkpoint, no reorg
//! 2. **Same-height fork**: same number, different hash
//! 3. **Broken ancestry**: some header between checkpoint and head does not
//!    link to its predecessor, or the range is deeper than we are willing to walk

use futures::{StreamExt, TryStreamExt};

use crate::chain::ChainReader;
use crate::error::Result;
use crate::types::{BlockHeader, BlockRef};

/// Describes a detected chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Head block number at which the reorg was noticed.
    pub detected_at: u64,
    /// Blocks between checkpoint and head that were inspected.
    pub depth: u64,
    pub reorg_type: ReorgType,
}

/// Classification of the reorg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgType {
    /// Head and checkpoint sit at the same height with different hashes.
    SameHeightFork,
    /// A parent-hash link between checkpoint and head is broken.
    BrokenAncestry,
    /// The gap exceeds the walk limit; ancestry is assumed broken.
    TooDeep,
}

impl std::fmt::Display for ReorgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SameHeightFork => write!(f, "same-height fork"),
            Self::BrokenAncestry => write!(f, "broken ancestry"),
            Self::TooDeep => write!(f, "too deep to verify"),
        }
    }
}

/// Walks block ancestry between a previously seen block and the current head.
pub struct ReorgDetector<'a, R: ?Sized> {
    reader: &'a R,
    /// Maximum number of headers to materialize.
    max_depth: u64,
    /// Concurrent header fetches.
    concurrency: usize,
}

impl<'a, R: ChainReader + ?Sized> ReorgDetector<'a, R> {
    pub fn new(reader: &'a R, max_depth: u64, concurrency: usize) -> Self {
        Self {
            reader,
            max_depth,
            concurrency: concurrency.max(1),
        }
    }

    /// Check whether `current` still descends from `previous`.
    ///
    /// Returns `Some(ReorgEvent)` if a reorg is detected, `None` if the chain
    /// is canonical.
    pub async fn check(
        &self,
        previous: &BlockHeader,
        current: &BlockHeader,
    ) -> Result<Option<ReorgEvent>> {
        if current.parent_hash == previous.hash {
            return Ok(None);
        }

        let event = |reorg_type, depth| {
            tracing::warn!(
                depth,
                at = current.number,
                previous = %previous.hash,
                current = %current.hash,
                reorg_type = %reorg_type,
                "Reorg detected"
            );
            ReorgEvent {
                detected_at: current.number,
                depth,
                reorg_type,
            }
        };

        if current.number == previous.number {
            if current.hash == previous.hash {
                return Ok(None);
            }
            return Ok(Some(event(ReorgType::SameHeightFork, 0)));
        }
        if current.number < previous.number {
            return Ok(Some(event(ReorgType::BrokenAncestry, 0)));
        }

        let depth = current.number - previous.number;
        if depth > self.max_depth {
            return Ok(Some(event(ReorgType::TooDeep, depth)));
        }

        let headers: Vec<BlockHeader> = futures::stream::iter(previous.number..=current.number)
            .map(|n| self.reader.get_block(BlockRef::Number(n)))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        if verify_ancestry(&headers, &previous.hash, &current.hash) {
            tracing::debug!(
                from = previous.number,
                to = current.number,
                "Ancestry verified"
            );
            Ok(None)
        } else {
            Ok(Some(event(ReorgType::BrokenAncestry, depth)))
        }
    }
}

/// Returns `true` if `headers` form an unbroken parent-hash chain starting at
/// `first_hash` and ending at `last_hash`.
pub fn verify_ancestry(headers: &[BlockHeader], first_hash: &str, last_hash: &str) -> bool {
    let (Some(first), Some(last)) = (headers.first(), headers.last()) else {
        return false;
    };
    first.hash == first_hash
        && last.hash == last_hash
        && headers.windows(2).all(|pair| pair[1].parent_hash == pair[0].hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;

    fn b(num: u64, hash: &str, parent: &str) -> BlockHeader {
        BlockHeader {
            number: num,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: (num * 12) as i64,
        }
    }

    fn linked(len: u64) -> Vec<BlockHeader> {
        (0..len)
            .map(|i| {
                let parent = if i == 0 { "0x0".to_string() } else { format!("0x{}", i - 1) };
                b(i, &format!("0x{i}"), &parent)
            })
            .collect()
    }

    #[test]
    fn linked_chain_verifies_for_every_subrange() {
        let chain = linked(12);
        for from in 0..chain.len() {
            for to in from..chain.len() {
                let slice = &chain[from..=to];
                assert!(verify_ancestry(slice, &chain[from].hash, &chain[to].hash));
            }
        }
    }

    #[test]
    fn any_flipped_parent_breaks_ancestry() {
        let chain = linked(8);
        for flip in 1..chain.len() {
            let mut broken = chain.clone();
            broken[flip].parent_hash = "0xdead".into();
            let last = broken.len() - 1;
            assert!(!verify_ancestry(&broken, &broken[0].hash, &broken[last].hash));
        }
    }

    #[test]
    fn endpoints_must_match() {
        let chain = linked(4);
        assert!(!verify_ancestry(&chain, "0xother", "0x3"));
        assert!(!verify_ancestry(&chain, "0x0", "0xother"));
        assert!(!verify_ancestry(&[], "0x0", "0x0"));
    }

    #[tokio::test]
    async fn direct_descendant_is_not_a_reorg() {
        let chain = MemoryChain::new();
        let prev = chain.mine();
        let head = chain.mine();
        let det = ReorgDetector::new(&chain, 64, 4);
        assert!(det.check(&prev, &head).await.unwrap().is_none());
        assert_eq!(chain.calls().get_block.load(std::sync::atomic::Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn same_height_fork_detected() {
        let chain = MemoryChain::new();
        let prev = chain.mine();
        let head = chain.reorg(1);
        let det = ReorgDetector::new(&chain, 64, 4);
        let event = det.check(&prev, &head).await.unwrap().unwrap();
        assert_eq!(event.reorg_type, ReorgType::SameHeightFork);
    }

    #[tokio::test]
    async fn canonical_range_is_walked() {
        let chain = MemoryChain::new();
        let prev = chain.mine();
        let head = chain.mine_many(5);
        let det = ReorgDetector::new(&chain, 64, 2);
        assert!(det.check(&prev, &head).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deep_fork_detected_by_walk() {
        let chain = MemoryChain::new();
        chain.mine();
        let prev = chain.mine();
        chain.mine_many(3);
        chain.reorg(4);
        let head = chain.mine_many(3);
        let det = ReorgDetector::new(&chain, 64, 2);
        let event = det.check(&prev, &head).await.unwrap().unwrap();
        assert_eq!(event.reorg_type, ReorgType::BrokenAncestry);
    }

    #[tokio::test]
    async fn gap_beyond_limit_assumed_reorg() {
        let chain = MemoryChain::new();
        let prev = chain.mine();
        let head = chain.mine_many(10);
        let det = ReorgDetector::new(&chain, 4, 2);
        let event = det.check(&prev, &head).await.unwrap().unwrap();
        assert_eq!(event.reorg_type, ReorgType::TooDeep);
    }
}
