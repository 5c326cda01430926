//! Per-Superblock State.
//!
//! Ties the tier allocator, migration engine inputs, access profiler
//! tables and capacity monitor together into the one object a mounted
//! file system instance would own. The persistent superblock record
//! itself (on-disk layout, mount flags, generation counters) is an
//! external collaborator; this models only the core-visible runtime
//! state built on top of it.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::block::{Tier, TieredAddressSpace};
use crate::capacity::{CapacityMonitor, VictimSelector};
use crate::config::Tunables;
use crate::error::CoreResult;
use crate::io::{AsyncIoList, BdevInfo, BlockDevice};
use crate::migration::MigrationContext;
use crate::profiler::InodeLruTable;
use crate::tier_alloc::TierAllocator;
use crate::transfer_buffer::TransferBuffer;

/// Per-superblock runtime state: one per mounted hybrid file system
/// instance.
pub struct PerSbState {
    pmem: Box<dyn BlockDevice>,
    bdevs: Vec<BdevInfo>,
    tiers: TierAllocator,
    transfer: TransferBuffer,
    lru: InodeLruTable,
    tunables: Tunables,
    cpus: usize,
}

impl PerSbState {
    /// Builds the runtime state from device geometry. `pmem_blocks` and
    /// `bdevs`' `capacity_page` fields determine the address-space
    /// layout; device probing/opening is the caller's responsibility.
    pub fn new(
        pmem: Box<dyn BlockDevice>,
        pmem_blocks: u64,
        bdevs: Vec<BdevInfo>,
        cpus: usize,
        tunables: Tunables,
    ) -> CoreResult<Self> {
        let bdev_blocks: Vec<u64> = bdevs.iter().map(|b| b.capacity_page).collect();
        let address_space = TieredAddressSpace::new(pmem_blocks, &bdev_blocks);
        let tiers = TierAllocator::new(address_space, cpus)?;

        let mut all_tiers = alloc::vec![Tier::Pmem];
        all_tiers.extend(bdevs.iter().map(|b| b.tier));
        let lru = InodeLruTable::new(&all_tiers, cpus);

        let transfer = TransferBuffer::new(tunables.bdev_buffer_pages);

        Ok(Self {
            pmem,
            bdevs,
            tiers,
            transfer,
            lru,
            tunables,
            cpus,
        })
    }

    pub fn tiers(&self) -> &TierAllocator {
        &self.tiers
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn lru(&self) -> &InodeLruTable {
        &self.lru
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }

    pub fn bdevs(&self) -> &[BdevInfo] {
        &self.bdevs
    }

    pub fn capacity_monitor(&self) -> CapacityMonitor<'_> {
        CapacityMonitor::new(&self.tiers, &self.tunables)
    }

    pub fn victim_selector(&self) -> VictimSelector<'_> {
        VictimSelector::new(&self.lru)
    }

    /// Builds a fresh migration context borrowing this superblock's
    /// allocator, devices and transfer buffer; each migration call gets
    /// its own [`AsyncIoList`], matching the non-overlapping-lifetime
    /// copy dispatch in [`crate::migration`].
    pub fn migration_context(&self) -> MigrationContext<'_> {
        MigrationContext {
            tiers: &self.tiers,
            pmem: self.pmem.as_ref(),
            bdevs: &self.bdevs,
            async_list: AsyncIoList::new(),
            transfer: &self.transfer,
            tunables: &self.tunables,
        }
    }

    /// One downward-migration sweep: for each tier over threshold, pops
    /// one victim inode from its LRU list. The caller is responsible for
    /// resolving the victim's inode number to its `WriteLog`/`InodeHeader`
    /// (external collaborators) and invoking `migrate_file` with the
    /// next lower tier. Mirrors the allocator's pattern of doing one unit
    /// of work per call rather than looping to quiescence internally.
    pub fn downward_candidates(&self) -> Vec<(Tier, u64)> {
        let monitor = self.capacity_monitor();
        let selector = self.victim_selector();
        let mut out = Vec::new();

        if monitor.is_high(Tier::Pmem) {
            if let Some(ino) = selector.pop_victim(Tier::Pmem) {
                out.push((Tier::Pmem, ino));
            }
        }
        for bdev in &self.bdevs {
            if monitor.is_high(bdev.tier) {
                if let Some(ino) = selector.pop_victim(bdev.tier) {
                    out.push((bdev.tier, ino));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::test_support::MemoryBlockDevice;

    fn sb() -> PerSbState {
        let pmem = Box::new(MemoryBlockDevice::new(100 * crate::block::IO_BLOCK_SIZE as usize));
        let bdevs = alloc::vec![BdevInfo::new(
            Tier::Bdev(0),
            Box::new(MemoryBlockDevice::new(100 * crate::block::IO_BLOCK_SIZE as usize)),
            100,
            3,
        )];
        PerSbState::new(pmem, 100, bdevs, 2, Tunables::default()).unwrap()
    }

    #[test]
    fn new_builds_address_space_spanning_every_tier() {
        let state = sb();
        assert_eq!(state.tiers().total(Tier::Pmem), 100);
        assert_eq!(state.tiers().total(Tier::Bdev(0)), 100);
    }

    #[test]
    fn downward_candidates_empty_when_all_tiers_under_threshold() {
        let state = sb();
        assert!(state.downward_candidates().is_empty());
    }

    #[test]
    fn downward_candidates_reports_high_tier_with_a_victim() {
        let state = sb();
        let mut sih = crate::write_entry::InodeHeader::new(50, 2);
        let rank = |t: Tier| match t {
            Tier::Pmem => 0,
            Tier::Bdev(i) => 1 + i as i32,
        };
        state.lru().update_sih_tier(&mut sih, Tier::Pmem, true, false, rank);

        state
            .tiers()
            .alloc_tier(Tier::Pmem, 0, 0, 90, crate::range_tree::Direction::FromHead)
            .unwrap();

        let victims = state.downward_candidates();
        assert_eq!(victims, alloc::vec![(Tier::Pmem, 50)]);
    }
}
