//! Access Profiler.
//!
//! Per-inode sync/async write classification, per-write-entry
//! sequential-run classification, and the per-(tier, CPU) inode LRU lists
//! the victim selector consumes.

use alloc::collections::VecDeque;
use hashbrown::HashMap;
use spin::Mutex;

use crate::block::Tier;
use crate::config::Tunables;
use crate::write_entry::{InodeHeader, WriteEntry, WriteLog};

/// Bit 63 of `wcount` caches the sync/async classification (1 = sync).
const SYNC_CACHE_BIT: u64 = 1 << 63;
/// `wcount >> 62 == 1` marks imminent saturation; once reached the
/// counter stops incrementing (it is only reset by `judge_sync` or
/// quiescence).
const SATURATION_SHIFT: u32 = 62;

/// Per-inode write-accumulation state consulted by [`judge_sync`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteAccumulator {
    pub wcount: u64,
    pub last_write_seconds: u64,
}

impl WriteAccumulator {
    /// Accumulates `len` bytes into `wcount`, resetting on 30-second
    /// quiescence and logging+stopping once saturation is close.
    pub fn record_write(&mut self, len: u64, now_seconds: u64) {
        if now_seconds.saturating_sub(self.last_write_seconds) >= Tunables::WRITE_QUIESCENCE_SECONDS {
            self.wcount = len;
        } else if (self.wcount >> SATURATION_SHIFT) == 1 {
            log::warn!("profiler: wcount saturating for inode write accumulator, no longer incrementing");
        } else {
            self.wcount = self.wcount.saturating_add(len);
        }
        self.last_write_seconds = now_seconds;
    }

    pub fn is_sync_cached(&self) -> bool {
        self.wcount & SYNC_CACHE_BIT != 0
    }

    /// `judge_sync`: classifies the accumulated writes and resets
    /// `wcount` accordingly. Bits `[sync_bit..62]` zero means async
    /// (reset to zero); otherwise sync (reset to the cache bit only).
    pub fn judge_sync(&mut self, tunables: &Tunables) -> bool {
        let magnitude_mask = (!0u64 << tunables.sync_bit) & !(SYNC_CACHE_BIT);
        let is_sync = self.wcount & magnitude_mask != 0;
        self.wcount = if is_sync { SYNC_CACHE_BIT } else { 0 };
        is_sync
    }
}

/// Inherits a sequential-run count for a new write at
/// `[pgoff, pgoff+num_pages)` from an overlapping, non-timed-out
/// predecessor entry; `0` if none overlaps.
pub fn next_seq_count(log: &WriteLog, pgoff: u64, num_pages: u32, now_seconds: u64, tunables: &Tunables) -> u32 {
    for entry in log.entries() {
        if entry.overlaps(pgoff, num_pages) && !is_entry_timed_out(entry, now_seconds, tunables) {
            return entry.seq_count + 1;
        }
    }
    0
}

fn is_entry_timed_out(entry: &WriteEntry, now_seconds: u64, tunables: &Tunables) -> bool {
    now_seconds.saturating_sub(entry.mtime) >= tunables.reset_seconds()
}

/// `judge_seq`: a write entry is sequential once its run count reaches
/// `2^seq_bit` consecutive writes.
pub fn judge_seq(entry: &WriteEntry, tunables: &Tunables) -> bool {
    entry.seq_count >= (1u32 << tunables.seq_bit)
}

/// One doubly-linked-list-like membership set per CPU shard for a tier;
/// modeled as a `VecDeque` of inode numbers since only head/tail/removal
/// operations are needed, never random-access indexing.
#[derive(Default)]
struct LruList {
    inodes: VecDeque<u64>,
}

impl LruList {
    fn remove(&mut self, ino: u64) {
        self.inodes.retain(|&i| i != ino);
    }

    fn push_tail(&mut self, ino: u64) {
        self.remove(ino);
        self.inodes.push_back(ino);
    }

    fn pop_front(&mut self) -> Option<u64> {
        self.inodes.pop_front()
    }

    fn front(&self) -> Option<u64> {
        self.inodes.front().copied()
    }
}

/// The per-(tier, CPU) inode LRU lists, one per shard, used by the victim
/// selector.
pub struct InodeLruTable {
    cpus: usize,
    lists: alloc::vec::Vec<Mutex<LruList>>,
    tiers: alloc::vec::Vec<Tier>,
    /// `tier -> index into tiers`, so shard lookup doesn't rescan the
    /// tier list once a superblock carries more than a couple of
    /// block-device tiers.
    by_tier: HashMap<Tier, usize>,
}

impl InodeLruTable {
    pub fn new(tiers: &[Tier], cpus: usize) -> Self {
        let mut lists = alloc::vec::Vec::with_capacity(tiers.len() * cpus);
        for _ in tiers {
            for _ in 0..cpus {
                lists.push(Mutex::new(LruList::default()));
            }
        }
        let by_tier = tiers.iter().enumerate().map(|(i, &t)| (t, i)).collect();
        Self {
            cpus,
            lists,
            tiers: tiers.to_vec(),
            by_tier,
        }
    }

    fn tier_index(&self, tier: Tier) -> Option<usize> {
        self.by_tier.get(&tier).copied()
    }

    fn slot(&self, tier: Tier, cpu: usize) -> Option<&Mutex<LruList>> {
        let ti = self.tier_index(tier)?;
        self.lists.get(ti * self.cpus + cpu)
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn front(&self, tier: Tier, cpu: usize) -> Option<u64> {
        self.slot(tier, cpu)?.lock().front()
    }

    pub fn pop_front(&self, tier: Tier, cpu: usize) -> Option<u64> {
        self.slot(tier, cpu)?.lock().pop_front()
    }

    /// `update_sih_tier(sih, tier, force, write)`: adjusts the inode's
    /// LRU membership and widens/narrows `[ltier, htier]`.
    pub fn update_sih_tier(&self, sih: &mut InodeHeader, tier: Tier, force: bool, write: bool, tier_rank: impl Fn(Tier) -> i32) {
        let cpu = (sih.ino as usize) % self.cpus.max(1);

        if force {
            for t in self.tiers.clone() {
                if let Some(slot) = self.slot(t, cpu) {
                    slot.lock().remove(sih.ino);
                }
            }
            if let Some(slot) = self.slot(tier, cpu) {
                slot.lock().push_tail(sih.ino);
            }
            sih.htier = tier;
            sih.ltier = tier;
            return;
        }

        if write {
            if let Some(slot) = self.slot(tier, cpu) {
                slot.lock().push_tail(sih.ino);
            }
            if tier_rank(tier) > tier_rank(sih.htier) {
                sih.htier = tier;
            }
            if tier_rank(tier) < tier_rank(sih.ltier) {
                sih.ltier = tier;
            }
        } else {
            for t in self.tiers.clone() {
                if tier_rank(t) > tier_rank(tier) {
                    if let Some(slot) = self.slot(t, cpu) {
                        slot.lock().remove(sih.ino);
                    }
                }
            }
            if let Some(slot) = self.slot(tier, cpu) {
                slot.lock().push_tail(sih.ino);
            }
            if tier_rank(tier) < tier_rank(sih.ltier) {
                sih.ltier = tier;
            }
        }
    }
}
