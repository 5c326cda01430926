//! Per-CPU Free List.
//!
//! One [`FreeList`] guards the free extents of a single `(tier, cpu)`
//! shard: a lock, a range tree, aggregate counters, and the shard's
//! global block-number window. Mutated only under its own lock.

use spin::Mutex;

use crate::block::{BlockNumber, Tier};
use crate::error::{CoreError, CoreResult};
use crate::range_tree::{Direction, RangeTree};

/// The free-space state of a single `(tier, cpu)` shard.
pub struct FreeList {
    pub tier: Tier,
    pub cpu: usize,
    pub block_start: BlockNumber,
    pub block_end: BlockNumber,
    inner: Mutex<FreeListInner>,
}

struct FreeListInner {
    tree: RangeTree,
    num_free_blocks: u64,
}

impl FreeList {
    /// Creates a shard covering `[block_start, block_end]`, entirely free.
    pub fn new(tier: Tier, cpu: usize, block_start: BlockNumber, block_end: BlockNumber) -> Self {
        let total = block_end - block_start + 1;
        Self {
            tier,
            cpu,
            block_start,
            block_end,
            inner: Mutex::new(FreeListInner {
                tree: RangeTree::with_single_range(block_start, block_end),
                num_free_blocks: total,
            }),
        }
    }

    pub fn num_total_blocks(&self) -> u64 {
        self.block_end - self.block_start + 1
    }

    pub fn num_free_blocks(&self) -> u64 {
        self.inner.lock().num_free_blocks
    }

    pub fn num_blocknode(&self) -> usize {
        self.inner.lock().tree.len()
    }

    fn in_window(&self, lo: BlockNumber, hi: BlockNumber) -> bool {
        lo >= self.block_start && hi <= self.block_end
    }

    /// Allocates `n` contiguous blocks from this shard alone (no
    /// cross-shard steal; that policy lives in [`crate::tier_alloc::TierAllocator`]).
    pub fn alloc(&self, n: u64, direction: Direction) -> CoreResult<BlockNumber> {
        if n == 0 {
            return Err(CoreError::Invalid);
        }
        let mut guard = self.inner.lock();
        let start = guard.tree.alloc(n, direction)?;
        guard.num_free_blocks -= n;
        Ok(start)
    }

    /// Returns `[lo, hi]` to this shard's tree.
    pub fn free(&self, lo: BlockNumber, hi: BlockNumber) -> CoreResult<()> {
        if hi < lo || !self.in_window(lo, hi) {
            return Err(CoreError::IoError);
        }
        let n = hi - lo + 1;
        let mut guard = self.inner.lock();
        guard.tree.free(lo, hi)?;
        guard.num_free_blocks += n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_shard_is_entirely_free() {
        let fl = FreeList::new(Tier::Pmem, 0, 0, 999);
        assert_eq!(fl.num_free_blocks(), 1000);
        assert_eq!(fl.num_blocknode(), 1);
    }

    #[test]
    fn alloc_decrements_free_count_exactly_once() {
        let fl = FreeList::new(Tier::Pmem, 0, 0, 999);
        let start = fl.alloc(10, Direction::FromHead).unwrap();
        assert_eq!(start, 0);
        assert_eq!(fl.num_free_blocks(), 990);
    }

    #[test]
    fn free_outside_window_is_io_error() {
        let fl = FreeList::new(Tier::Bdev(0), 0, 100, 199);
        assert_eq!(fl.free(50, 60).unwrap_err(), CoreError::IoError);
    }

    #[test]
    fn alloc_then_free_restores_free_count() {
        let fl = FreeList::new(Tier::Pmem, 0, 0, 99);
        let start = fl.alloc(20, Direction::FromHead).unwrap();
        fl.free(start, start + 19).unwrap();
        assert_eq!(fl.num_free_blocks(), 100);
        assert_eq!(fl.num_blocknode(), 1);
    }
}
