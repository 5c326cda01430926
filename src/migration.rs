//! Migration Engine.
//!
//! Coordinates the four-phase (check -> allocate -> copy -> commit) move
//! of one or a group of write entries between tiers, including
//! optimal-size grouping on the destination tier, entry splitting at tier
//! boundaries, and whole-file migration.

use alloc::vec::Vec;

use crate::block::{BlockNumber, Tier, IO_BLOCK_SIZE};
use crate::config::Tunables;
use crate::error::{CoreError, CoreResult};
use crate::io::{bdev_read, bdev_read_block, bdev_write, bdev_write_block, AsyncIoList, BdevInfo, BlockDevice, IoMode};
use crate::range_tree::Direction;
use crate::tier_alloc::{TierAllocator, ANY_CPU};
use crate::transfer_buffer::TransferBuffer;
use crate::write_entry::{InodeHeader, WriteLog};

/// Two-level tag for the tier-pair copy primitive: the pair is resolved
/// once from a nested tier check and then dispatched on as a closed
/// match over this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierPair {
    PmemToBdev,
    BdevToPmem,
    BdevToBdev,
}

fn tier_pair_for(from: Tier, to: Tier) -> CoreResult<TierPair> {
    match (from, to) {
        (Tier::Pmem, Tier::Bdev(_)) => Ok(TierPair::PmemToBdev),
        (Tier::Bdev(_), Tier::Pmem) => Ok(TierPair::BdevToPmem),
        (Tier::Bdev(_), Tier::Bdev(_)) => Ok(TierPair::BdevToBdev),
        (Tier::Pmem, Tier::Pmem) => Err(CoreError::Unsupported),
    }
}

/// External collaborator standing in for the vpmem pin/flush/lock
/// interface: reports whether any page in a range is currently
/// write-locked by a concurrent accessor. This crate never implements
/// locking itself, only consults it during the migration Check phase.
pub trait PageRangeLock {
    fn is_write_locked(&self, pgoff: u64, num_pages: u32) -> bool;
}

/// Stand-in used when no external page-lock tracking is wired up (e.g.
/// single-threaded tests).
pub struct NoLocks;

impl PageRangeLock for NoLocks {
    fn is_write_locked(&self, _pgoff: u64, _num_pages: u32) -> bool {
        false
    }
}

/// Everything the migration engine needs to move bytes between tiers: the
/// allocator, the PMEM DAX mapping stand-in, the block-device tiers, the
/// async completion list and the DRAM transfer buffer.
pub struct MigrationContext<'d> {
    pub tiers: &'d TierAllocator,
    pub pmem: &'d dyn BlockDevice,
    pub bdevs: &'d [BdevInfo],
    pub async_list: AsyncIoList<'d>,
    pub transfer: &'d TransferBuffer,
    pub tunables: &'d Tunables,
}

impl<'d> MigrationContext<'d> {
    fn device_for(&self, tier: Tier) -> CoreResult<&'d dyn BlockDevice> {
        match tier {
            Tier::Pmem => Ok(self.pmem),
            Tier::Bdev(i) => self
                .bdevs
                .iter()
                .find(|b| b.tier == Tier::Bdev(i))
                .map(|b| b.device.as_ref())
                .ok_or(CoreError::Invalid),
        }
    }

    fn opt_size_bit(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Pmem => 0,
            Tier::Bdev(i) => self.tunables.opt_size_bit_for(i as usize),
        }
    }

    /// Copies `num_pages` blocks from `(from, from_block)` to
    /// `(to, to_block)`, dispatching on the tier pair.
    fn migrate_blocks(
        &self,
        from: Tier,
        to: Tier,
        from_block: BlockNumber,
        to_block: BlockNumber,
        num_pages: u32,
    ) -> CoreResult<()> {
        match tier_pair_for(from, to)? {
            TierPair::PmemToBdev => {
                let byte_len = num_pages as usize * IO_BLOCK_SIZE as usize;
                let mut buf = alloc::vec![0u8; byte_len];
                self.pmem
                    .read_at(from_block * IO_BLOCK_SIZE, &mut buf)
                    .map_err(|_| CoreError::IoError)?;
                let dev = self.device_for(to)?;
                bdev_write_block(dev, &self.async_list, to_block, &buf, IoMode::Async)?;
                self.async_list.flush_async()
            }
            TierPair::BdevToPmem => {
                let byte_len = num_pages as usize * IO_BLOCK_SIZE as usize;
                let mut buf = alloc::vec![0u8; byte_len];
                let dev = self.device_for(from)?;
                // Must be Sync: an Async read's completion has no
                // back-reference to this stack buffer (flush_async fills
                // its own scratch buffer and discards it), so an Async
                // read here would write zeros into the PMEM destination.
                bdev_read_block(dev, &self.async_list, from_block, &mut buf, IoMode::Sync)?;
                self.pmem
                    .write_at(to_block * IO_BLOCK_SIZE, &buf)
                    .map_err(|_| CoreError::IoError)
            }
            TierPair::BdevToBdev => {
                let src_dev = self.device_for(from)?;
                let dst_dev = self.device_for(to)?;
                for page in 0..num_pages as u64 {
                    self.transfer.with_transfer_page(|buf| -> CoreResult<()> {
                        bdev_read(src_dev, &self.async_list, (from_block + page) * IO_BLOCK_SIZE, buf, IoMode::Sync)?;
                        bdev_write(dst_dev, &self.async_list, (to_block + page) * IO_BLOCK_SIZE, buf, IoMode::Sync)
                    })?;
                }
                Ok(())
            }
        }
    }

    /// Moves a single write entry to `to`. `hint` short-circuits
    /// Allocate with a pre-reserved destination block (group migration);
    /// `None` performs a solo `alloc_tier` call. Returns the destination
    /// block and, in solo mode, the index of the appended clone entry.
    pub fn migrate_entry_blocks(
        &self,
        log: &mut WriteLog,
        inode: &mut InodeHeader,
        entry_idx: usize,
        to: Tier,
        hint: Option<BlockNumber>,
        locks: &dyn PageRangeLock,
        current_cpu: usize,
    ) -> CoreResult<(BlockNumber, Option<usize>)> {
        let entry = *log.entry(entry_idx);

        // --- Check ---
        if entry.updating() {
            return Err(CoreError::Busy);
        }
        if locks.is_write_locked(entry.pgoff, entry.num_pages) {
            return Err(CoreError::Busy);
        }
        let from = entry.tier()?;
        if from == to {
            return Err(CoreError::Unsupported);
        }

        // --- Allocate ---
        let to_block = match hint {
            Some(b) => b,
            None => {
                let (block, _) =
                    self.tiers
                        .alloc_tier(to, ANY_CPU, current_cpu, entry.num_pages as u64, Direction::FromHead)?;
                block
            }
        };
        log.entry_mut(entry_idx).set_updating(true);

        // --- Copy ---
        let copy_result = self.migrate_blocks(from, to, entry.block, to_block, entry.num_pages);
        if let Err(e) = copy_result {
            log.entry_mut(entry_idx).set_updating(false);
            if hint.is_none() {
                let _ = self.tiers.free_tier(to_block, entry.num_pages as u64);
            }
            log::warn!("migration: copy failed for entry at pgoff {} ({e})", entry.pgoff);
            return Err(e);
        }

        // --- Commit ---
        log.entry_mut(entry_idx).set_updating(false);
        inode.trans_id += 1;

        if hint.is_none() {
            let cloned = log.clone_entry(entry_idx, to, to_block);
            inode.i_blocks += entry.num_pages as u64;
            Ok((to_block, Some(cloned)))
        } else {
            Ok((to_block, None))
        }
    }

    /// Group migration for one `opt_size`-aligned window. `from`
    /// must not be PMEM (tier-to-PMEM migration is always entry-by-entry).
    fn migrate_group_window(
        &self,
        log: &mut WriteLog,
        inode: &mut InodeHeader,
        from: Tier,
        to: Tier,
        window_start: u64,
        opt_size: u64,
        locks: &dyn PageRangeLock,
        current_cpu: usize,
    ) -> CoreResult<()> {
        let window_end = window_start + opt_size;

        // Snapshot entries overlapping the window before any mutation,
        // splitting any entry that straddles the boundary first.
        let mut idx = window_start;
        let mut constituents: Vec<usize> = Vec::new();
        let mut fully_covered_by_from = true;

        while idx < window_end {
            let Some(mut entry_idx) = log.find_next_entry_idx(idx) else {
                break;
            };
            let entry = *log.entry(entry_idx);
            if entry.pgoff >= window_end {
                break;
            }
            if entry.pgoff > idx {
                // Gap before this entry: the window is not edge-to-edge
                // covered, so group migration cannot apply to it.
                fully_covered_by_from = false;
            }

            if entry.end_pgoff() > window_end {
                let (first, _second) = log.split_entry(entry_idx, window_end)?;
                entry_idx = first;
            }

            let entry = *log.entry(entry_idx);
            if entry.tier()? != from {
                fully_covered_by_from = false;
            }
            constituents.push(entry_idx);
            idx = entry.end_pgoff();
        }

        if constituents.is_empty() {
            return Ok(());
        }

        // The window only qualifies for group migration if it is covered
        // edge to edge by `from`-tier entries with no gap; a short final
        // window (file shorter than a whole number of opt-size windows)
        // falls through to solo migration instead of over-allocating a
        // full opt-size extent for a partial window.
        let fully_covered = fully_covered_by_from && idx >= window_end;

        if fully_covered {
            let (extent_start, _) =
                self.tiers
                    .alloc_tier(to, ANY_CPU, current_cpu, opt_size, Direction::FromTail)?;

            let mut ok = true;
            for &cidx in &constituents {
                let e = *log.entry(cidx);
                let hint = extent_start + (e.pgoff - window_start);
                if self
                    .migrate_entry_blocks(log, inode, cidx, to, Some(hint), locks, current_cpu)
                    .is_err()
                {
                    ok = false;
                    break;
                }
            }

            if !ok {
                let _ = self.tiers.free_tier(extent_start, opt_size);
                return Err(CoreError::IoError);
            }

            let mtime = log.entry(constituents[0]).mtime;
            let epoch = log.entry(constituents[0]).epoch_id;
            let merged = log.merge_emit(window_start, opt_size, extent_start, to, mtime, epoch);

            // merge_emit only reassigns the page index at window_start;
            // every constituent's own pgoff key still points at its
            // now-superseded source-tier entry. Redirect each of them to
            // the merged entry so find_next_entry_idx never resolves a
            // page in this window back to a stale `from`-tier entry.
            for &cidx in &constituents {
                let pgoff = log.entry(cidx).pgoff;
                log.reassign(pgoff, merged);
            }
        } else {
            for &cidx in &constituents {
                if log.entry(cidx).tier()? == from {
                    self.migrate_entry_blocks(log, inode, cidx, to, None, locks, current_cpu)?;
                }
            }
        }

        Ok(())
    }

    /// Entry-by-entry migration of every live entry currently on `from`.
    fn migrate_entries_solo(
        &self,
        log: &mut WriteLog,
        inode: &mut InodeHeader,
        from: Tier,
        to: Tier,
        locks: &dyn PageRangeLock,
        current_cpu: usize,
    ) -> CoreResult<()> {
        let indices: Vec<usize> = (0..log.entries().len())
            .filter(|&i| log.entry(i).tier().map(|t| t == from).unwrap_or(false))
            .collect();
        for idx in indices {
            if log.entry(idx).tier()? == from {
                self.migrate_entry_blocks(log, inode, idx, to, None, locks, current_cpu)?;
            }
        }
        Ok(())
    }

    /// `migrate_file(inode, from, to)`: whole-file migration.
    /// Tier-to-PMEM always uses entry-by-entry migration; every other
    /// pair uses opt-size group migration.
    pub fn migrate_file(
        &self,
        log: &mut WriteLog,
        inode: &mut InodeHeader,
        from: Tier,
        to: Tier,
        locks: &dyn PageRangeLock,
        current_cpu: usize,
    ) -> CoreResult<()> {
        let _guard = inode.mig_sem.write();
        inode.ltier = to;

        if to == Tier::Pmem {
            self.migrate_entries_solo(log, inode, from, to, locks, current_cpu)?;
        } else {
            let opt_size = 1u64 << self.opt_size_bit(to);
            let max_pgoff = log
                .entries()
                .iter()
                .map(|e| e.end_pgoff())
                .max()
                .unwrap_or(0);
            let mut window_start = 0u64;
            while window_start < max_pgoff {
                self.migrate_group_window(log, inode, from, to, window_start, opt_size, locks, current_cpu)?;
                window_start += opt_size;
            }
        }

        Ok(())
    }

    /// `migrate_file_to_pmem(inode)`: promotes a whole file back to PMEM
    /// from whichever tier it currently lives on. This is a distinct
    /// named entry point from `migrate_file`, realized as that same
    /// entry-by-entry path with `to` fixed to PMEM; `from` is read from
    /// the file's current tier rather than asked of the caller.
    pub fn migrate_file_to_pmem(
        &self,
        log: &mut WriteLog,
        inode: &mut InodeHeader,
        locks: &dyn PageRangeLock,
        current_cpu: usize,
    ) -> CoreResult<()> {
        let from = log.current_tier().ok_or(CoreError::Invalid)?;
        if from == Tier::Pmem {
            return Ok(());
        }
        self.migrate_file(log, inode, from, Tier::Pmem, locks, current_cpu)
    }

    /// `rotate_file`: cycles a file PMEM -> T_low -> T_high -> PMEM, or
    /// PMEM -> T_low -> PMEM when `test_mode` is set.
    pub fn rotate_file(
        &self,
        log: &mut WriteLog,
        inode: &mut InodeHeader,
        t_low: Tier,
        t_high: Tier,
        test_mode: bool,
        locks: &dyn PageRangeLock,
        current_cpu: usize,
    ) -> CoreResult<()> {
        let current = log.current_tier().unwrap_or(Tier::Pmem);
        match current {
            Tier::Pmem => self.migrate_file(log, inode, Tier::Pmem, t_low, locks, current_cpu),
            t if t == t_low && test_mode => {
                self.migrate_file(log, inode, t_low, Tier::Pmem, locks, current_cpu)
            }
            t if t == t_low => self.migrate_file(log, inode, t_low, t_high, locks, current_cpu),
            _ => self.migrate_file(log, inode, t_high, Tier::Pmem, locks, current_cpu),
        }
    }
}
