//! Write-Entry Operations.
//!
//! A write entry is the file log's record mapping a contiguous run of
//! file pages to a contiguous run of blocks on one tier. The file-system's
//! write-entry log and inode record are external collaborators; this
//! module models exactly the slice of their behavior the allocator and
//! migration engine invoke: append, clone, split, and the nearest-entry
//! walk, plus the core-visible [`InodeHeader`] summary fields.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use modular_bitfield::prelude::*;
use spin::RwLock;

use crate::block::{BlockNumber, Tier};
use crate::error::{CoreError, CoreResult};

/// Packs the entry's 6-bit tier encoding and 1-bit `updating` flag into a
/// single byte, the way a register-style on-disk record packs adjacent
/// sub-byte fields.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierFlags {
    pub tier_code: B6,
    pub updating: bool,
    #[skip]
    __: B1,
}

fn encode_tier(tier: Tier) -> u8 {
    match tier {
        Tier::Pmem => 0,
        Tier::Bdev(i) => 1 + i,
    }
}

fn decode_tier(code: u8) -> CoreResult<Tier> {
    if code == 0 {
        Ok(Tier::Pmem)
    } else {
        Ok(Tier::Bdev(code - 1))
    }
}

const ENTRY_CHECKSUM: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

fn entry_checksum(flags_byte: u8, block: BlockNumber, pgoff: u64) -> u32 {
    let mut digest = ENTRY_CHECKSUM.digest();
    digest.update(&[flags_byte]);
    digest.update(&block.to_le_bytes());
    digest.update(&pgoff.to_le_bytes());
    digest.finalize()
}

/// Persistent record in a file's log: a contiguous `(pgoff -> block,
/// num_pages, tier)` mapping plus the profiler and migration metadata
/// carried alongside it.
#[derive(Debug, Clone, Copy)]
pub struct WriteEntry {
    flags: TierFlags,
    pub num_pages: u32,
    pub block: BlockNumber,
    pub pgoff: u64,
    pub mtime: u64,
    pub epoch_id: u64,
    pub seq_count: u32,
    checksum: u32,
}

impl WriteEntry {
    pub fn new(tier: Tier, block: BlockNumber, pgoff: u64, num_pages: u32, mtime: u64, epoch_id: u64) -> Self {
        let mut e = Self {
            flags: TierFlags::new().with_tier_code(encode_tier(tier)).with_updating(false),
            num_pages,
            block,
            pgoff,
            mtime,
            epoch_id,
            seq_count: 0,
            checksum: 0,
        };
        e.recompute_checksum();
        e
    }

    pub fn tier(&self) -> CoreResult<Tier> {
        decode_tier(self.flags.tier_code())
    }

    pub fn updating(&self) -> bool {
        self.flags.updating()
    }

    pub fn set_updating(&mut self, updating: bool) {
        self.flags.set_updating(updating);
        self.recompute_checksum();
    }

    pub fn end_pgoff(&self) -> u64 {
        self.pgoff + self.num_pages as u64
    }

    pub fn covers(&self, pgoff: u64) -> bool {
        pgoff >= self.pgoff && pgoff < self.end_pgoff()
    }

    pub fn overlaps(&self, pgoff: u64, num_pages: u32) -> bool {
        pgoff < self.end_pgoff() && pgoff + num_pages as u64 > self.pgoff
    }

    fn recompute_checksum(&mut self) {
        self.checksum = entry_checksum(self.flags.into_bytes()[0], self.block, self.pgoff);
    }
}

/// A per-inode lru-list hook slot; one per tier, owned by the inode. The
/// LRU list itself owns no inode lifetimes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LruHook {
    pub linked: bool,
}

/// Volatile per-inode summary (`sih`). Core-visible fields only; the
/// persistent inode record itself is external.
pub struct InodeHeader {
    pub ino: u64,
    pub trans_id: u64,
    pub htier: Tier,
    pub ltier: Tier,
    pub wcount: u64,
    pub i_blocks: u64,
    pub lru_hooks: Vec<LruHook>,
    /// Migration read/write semaphore: readers take it shared around any
    /// access to an entry with `updating == 1`; the migration engine
    /// takes it exclusively for the whole `migrate_file` call.
    pub mig_sem: RwLock<()>,
}

impl InodeHeader {
    pub fn new(ino: u64, num_tiers: usize) -> Self {
        Self {
            ino,
            trans_id: 0,
            htier: Tier::Pmem,
            ltier: Tier::Pmem,
            wcount: 0,
            i_blocks: 0,
            lru_hooks: alloc::vec![LruHook::default(); num_tiers],
            mig_sem: RwLock::new(()),
        }
    }
}

/// A file's append-only write-entry log, plus the (externally owned, here
/// modeled in-memory) page-index tree that maps a file offset to its
/// current live entry.
#[derive(Default)]
pub struct WriteLog {
    entries: Vec<WriteEntry>,
    /// pgoff -> index into `entries` of the entry currently live at that
    /// offset; stands in for the external page-index tree.
    page_index: BTreeMap<u64, usize>,
}

impl WriteLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[WriteEntry] {
        &self.entries
    }

    pub fn entry(&self, idx: usize) -> &WriteEntry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut WriteEntry {
        &mut self.entries[idx]
    }

    /// Log-appends a single entry, atomic w.r.t. the log tail in the
    /// sense that it is the only mutator of `entries`.
    pub fn append_entry(&mut self, entry: WriteEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Reassigns the page-index tree so that `pgoff` resolves to
    /// `entry_idx` going forward; used by migration commit and by initial
    /// writes.
    pub fn reassign(&mut self, pgoff: u64, entry_idx: usize) {
        self.page_index.insert(pgoff, entry_idx);
    }

    /// Returns the index of the nearest live entry at or after `pgoff`,
    /// or `None` if the file has no entries from that point on.
    pub fn find_next_entry_idx(&self, pgoff: u64) -> Option<usize> {
        if let Some((_, &idx)) = self.page_index.range(..=pgoff).next_back() {
            if self.entries[idx].covers(pgoff) {
                return Some(idx);
            }
        }
        self.page_index.range(pgoff..).next().map(|(_, &idx)| idx)
    }

    /// Returns the nearest live entry at or after `pgoff`, or `None` if
    /// the file has no entries from that point on.
    pub fn find_next_entry(&self, pgoff: u64) -> Option<&WriteEntry> {
        self.find_next_entry_idx(pgoff).map(|idx| &self.entries[idx])
    }

    /// `clone_entry`: produces a new entry inheriting `pgoff, num_pages,
    /// mtime, epoch_id, seq_count` from `src` but carrying `new_tier` /
    /// `new_block`; appends it and reassigns the page range to it.
    pub fn clone_entry(&mut self, src_idx: usize, new_tier: Tier, new_block: BlockNumber) -> usize {
        let src = self.entries[src_idx];
        let mut cloned = WriteEntry::new(new_tier, new_block, src.pgoff, src.num_pages, src.mtime, src.epoch_id);
        cloned.seq_count = src.seq_count;
        let idx = self.append_entry(cloned);
        self.reassign(src.pgoff, idx);
        idx
    }

    /// `split_entry`: splits `entries[idx]` at `boundary_pgoff` into two
    /// entries of lengths `num_prev` and `num_pages - num_prev`. The
    /// first half is mutated in place; the second half is appended and
    /// the page-index tree is reassigned to it, preserving
    /// `(pgoff, num_pages, block, tier)` taken together across the pair.
    pub fn split_entry(&mut self, idx: usize, boundary_pgoff: u64) -> CoreResult<(usize, usize)> {
        let src = self.entries[idx];
        if !src.covers(boundary_pgoff) || boundary_pgoff == src.pgoff {
            return Err(CoreError::Invalid);
        }
        let num_prev = (boundary_pgoff - src.pgoff) as u32;
        let tier = src.tier()?;

        let second = WriteEntry::new(
            tier,
            src.block + num_prev as u64,
            boundary_pgoff,
            src.num_pages - num_prev,
            src.mtime,
            src.epoch_id,
        );
        let second_idx = self.append_entry(second);
        self.reassign(boundary_pgoff, second_idx);

        let first = &mut self.entries[idx];
        first.num_pages = num_prev;
        first.recompute_checksum();
        self.reassign(src.pgoff, idx);

        Ok((idx, second_idx))
    }

    /// `merge_emit`: emits one entry describing an opt-size-sized merged
    /// extent on `tier` starting at `block_base`, covering
    /// `[pgoff, pgoff + opt_size)`.
    pub fn merge_emit(&mut self, pgoff: u64, opt_size: u64, block_base: BlockNumber, tier: Tier, mtime: u64, epoch_id: u64) -> usize {
        let entry = WriteEntry::new(tier, block_base, pgoff, opt_size as u32, mtime, epoch_id);
        let idx = self.append_entry(entry);
        self.reassign(pgoff, idx);
        idx
    }

    /// The tier of the first live entry, or `None` if the file has no
    /// entries.
    pub fn current_tier(&self) -> Option<Tier> {
        self.find_next_entry(0).and_then(|e| e.tier().ok())
    }

    /// Whether every live entry of the file sits on the same tier.
    pub fn is_single_tier(&self) -> bool {
        let mut seen: Option<Tier> = None;
        for &idx in self.page_index.values() {
            let Ok(tier) = self.entries[idx].tier() else {
                continue;
            };
            match seen {
                None => seen = Some(tier),
                Some(t) if t != tier => return false,
                Some(_) => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_flags_round_trip() {
        let e = WriteEntry::new(Tier::Bdev(1), 42, 0, 4, 0, 0);
        assert_eq!(e.tier().unwrap(), Tier::Bdev(1));
        assert!(!e.updating());
    }

    #[test]
    fn set_updating_toggles_flag() {
        let mut e = WriteEntry::new(Tier::Pmem, 0, 0, 4, 0, 0);
        e.set_updating(true);
        assert!(e.updating());
        e.set_updating(false);
        assert!(!e.updating());
    }

    #[test]
    fn r4_split_then_merge_preserves_mapping() {
        let mut log = WriteLog::new();
        let idx = log.append_entry(WriteEntry::new(Tier::Bdev(0), 100, 0, 8, 0, 0));
        log.reassign(0, idx);

        let (first, second) = log.split_entry(idx, 4).unwrap();
        assert_eq!(log.entry(first).num_pages, 4);
        assert_eq!(log.entry(second).pgoff, 4);
        assert_eq!(log.entry(second).num_pages, 4);
        assert_eq!(log.entry(second).block, 104);

        let merged = log.merge_emit(0, 8, 100, Tier::Bdev(0), 0, 0);
        assert_eq!(log.entry(merged).pgoff, 0);
        assert_eq!(log.entry(merged).num_pages, 8);
        assert_eq!(log.entry(merged).block, 100);
    }

    #[test]
    fn find_next_entry_returns_nearest_at_or_after() {
        let mut log = WriteLog::new();
        let idx = log.append_entry(WriteEntry::new(Tier::Pmem, 0, 10, 4, 0, 0));
        log.reassign(10, idx);

        assert_eq!(log.find_next_entry(10).unwrap().pgoff, 10);
        assert_eq!(log.find_next_entry(12).unwrap().pgoff, 10);
        assert!(log.find_next_entry(20).is_none());
    }

    #[test]
    fn clone_entry_inherits_fields_and_carries_new_location() {
        let mut log = WriteLog::new();
        let mut src = WriteEntry::new(Tier::Pmem, 0, 0, 4, 7, 9);
        src.seq_count = 3;
        let idx = log.append_entry(src);
        log.reassign(0, idx);

        let cloned = log.clone_entry(idx, Tier::Bdev(0), 500);
        let e = log.entry(cloned);
        assert_eq!(e.tier().unwrap(), Tier::Bdev(0));
        assert_eq!(e.block, 500);
        assert_eq!(e.pgoff, 0);
        assert_eq!(e.num_pages, 4);
        assert_eq!(e.seq_count, 3);
    }

    #[test]
    fn current_tier_and_single_tier_reflect_live_entries() {
        let mut log = WriteLog::new();
        assert!(log.current_tier().is_none());

        let idx = log.append_entry(WriteEntry::new(Tier::Pmem, 0, 0, 4, 0, 0));
        log.reassign(0, idx);
        assert_eq!(log.current_tier().unwrap(), Tier::Pmem);
        assert!(log.is_single_tier());

        let idx2 = log.append_entry(WriteEntry::new(Tier::Bdev(0), 10, 4, 4, 0, 0));
        log.reassign(4, idx2);
        assert!(!log.is_single_tier());
    }
}
