//! Capacity Monitor and Victim Selector.
//!
//! Watches each tier's used/total ratio against
//! [`Tunables::migration_downward_perc`] and, for tiers over threshold,
//! hands the migration engine one victim inode per call by rotating
//! through the tier's per-CPU inode LRU lists round-robin.

use spin::Mutex;

use crate::block::Tier;
use crate::config::Tunables;
use crate::profiler::InodeLruTable;
use crate::tier_alloc::TierAllocator;

/// Capacity Monitor: `used`/`total`/`is_high` over a tier.
pub struct CapacityMonitor<'a> {
    allocator: &'a TierAllocator,
    tunables: &'a Tunables,
}

impl<'a> CapacityMonitor<'a> {
    pub fn new(allocator: &'a TierAllocator, tunables: &'a Tunables) -> Self {
        Self { allocator, tunables }
    }

    pub fn used(&self, tier: Tier) -> u64 {
        self.allocator.used(tier)
    }

    pub fn total(&self, tier: Tier) -> u64 {
        self.allocator.total(tier)
    }

    /// Whether `tier`'s used fraction is strictly above
    /// `migration_downward_perc`.
    pub fn is_high(&self, tier: Tier) -> bool {
        let total = self.total(tier);
        if total == 0 {
            return false;
        }
        let used = self.used(tier);
        // used / total > perc / 100, cross-multiplied to stay in integers.
        used.saturating_mul(100) > total.saturating_mul(self.tunables.migration_downward_perc as u64)
    }
}

/// Persistent round-robin cursor into a tier's per-CPU inode LRU lists,
/// so repeated calls sweep every shard in turn instead of always
/// draining CPU 0 first.
#[derive(Default)]
pub struct VictimCursor {
    next_cpu: Mutex<usize>,
}

/// Victim Selector: pops one demotion candidate per call, rotating
/// across a tier's CPU shards so no single shard is starved.
pub struct VictimSelector<'a> {
    lru: &'a InodeLruTable,
    cursor: VictimCursor,
}

impl<'a> VictimSelector<'a> {
    pub fn new(lru: &'a InodeLruTable) -> Self {
        Self {
            lru,
            cursor: VictimCursor::default(),
        }
    }

    /// Pops the front inode of the next shard (in round-robin order) for
    /// `tier` that has one, advancing the cursor so the following call
    /// resumes past it. Reserved inode numbers (`ino <= 8`) are skipped:
    /// metadata inodes are never migration victims.
    pub fn pop_victim(&self, tier: Tier) -> Option<u64> {
        let cpus = self.lru.cpus();
        if cpus == 0 {
            return None;
        }
        let start = {
            let mut next = self.cursor.next_cpu.lock();
            let start = *next % cpus;
            *next = (start + 1) % cpus;
            start
        };

        for offset in 0..cpus {
            let cpu = (start + offset) % cpus;
            if let Some(ino) = self.take_non_reserved(tier, cpu) {
                return Some(ino);
            }
        }
        None
    }

    fn take_non_reserved(&self, tier: Tier, cpu: usize) -> Option<u64> {
        const RESERVED_MAX_INO: u64 = 8;
        // Reserved inodes sit at the LRU head by construction (they are
        // never re-pushed after their initial placement); leave them be
        // rather than popping and losing them.
        match self.lru.front(tier, cpu) {
            Some(ino) if ino > RESERVED_MAX_INO => self.lru.pop_front(tier, cpu),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::TieredAddressSpace;
    use crate::range_tree::Direction;

    #[test]
    fn is_high_compares_used_against_threshold() {
        let space = TieredAddressSpace::new(100, &[]);
        let allocator = TierAllocator::new(space, 1).unwrap();
        let tunables = Tunables::default();
        let monitor = CapacityMonitor::new(&allocator, &tunables);

        assert!(!monitor.is_high(Tier::Pmem));
        allocator
            .alloc_tier(Tier::Pmem, 0, 0, 80, Direction::FromHead)
            .unwrap();
        assert!(monitor.is_high(Tier::Pmem));
    }

    #[test]
    fn pop_victim_rotates_round_robin_across_shards() {
        let tiers = [Tier::Pmem];
        let lru = InodeLruTable::new(&tiers, 2);
        let rank = |_: Tier| 0;
        let mut s0 = crate::write_entry::InodeHeader::new(10, 1);
        let mut s1 = crate::write_entry::InodeHeader::new(11, 1);
        lru.update_sih_tier(&mut s0, Tier::Pmem, true, false, rank);
        lru.update_sih_tier(&mut s1, Tier::Pmem, true, false, rank);

        let selector = VictimSelector::new(&lru);
        let first = selector.pop_victim(Tier::Pmem);
        let second = selector.pop_victim(Tier::Pmem);
        let mut got = alloc::vec![first, second];
        got.sort();
        assert_eq!(got, alloc::vec![Some(10), Some(11)]);
    }

    #[test]
    fn pop_victim_skips_reserved_inodes() {
        let tiers = [Tier::Pmem];
        let lru = InodeLruTable::new(&tiers, 1);
        let rank = |_: Tier| 0;
        let mut reserved = crate::write_entry::InodeHeader::new(2, 1);
        lru.update_sih_tier(&mut reserved, Tier::Pmem, true, false, rank);

        let selector = VictimSelector::new(&lru);
        assert_eq!(selector.pop_victim(Tier::Pmem), None);
    }
}
