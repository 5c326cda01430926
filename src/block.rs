//! The global block-number address space and tier identification.
//!
//! PMEM owns `[0, P)`; each block-device tier owns a contiguous,
//! non-overlapping window above it. `TieredAddressSpace` is the single
//! source of truth for translating a global block number to the tier
//! that owns it.

use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::error::{CoreError, CoreResult};

/// A 64-bit global block number. Blocks are `IO_BLOCK_SIZE` bytes
/// (typically 4096) and form one densely packed address space across
/// every tier.
pub type BlockNumber = u64;

/// Default block size in bytes.
pub const IO_BLOCK_SIZE: u64 = 4096;

/// A storage tier: the fast byte-addressable PMEM tier, or one of the
/// block-device tiers ordered from fastest (`Bdev(0)`) to slowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Pmem,
    Bdev(u8),
}

impl Tier {
    pub fn bdev_index(self) -> Option<usize> {
        match self {
            Tier::Pmem => None,
            Tier::Bdev(i) => Some(i as usize),
        }
    }
}

/// One contiguous window of the global block-number space, owned by a
/// single tier.
#[derive(Debug, Clone, Copy)]
pub struct TierWindow {
    pub tier: Tier,
    pub start: BlockNumber,
    pub end: BlockNumber,
}

/// Maps global block numbers to the tier windows that partition them.
///
/// Invariant: windows are contiguous, non-overlapping, and the PMEM
/// window always starts at block 0.
#[derive(Debug, Clone)]
pub struct TieredAddressSpace {
    windows: Vec<TierWindow>,
    /// `tier -> index into windows`, so `window_for`/`tier_of`'s siblings
    /// (`tier_start`/`tier_end`) don't re-scan the tier list on every
    /// lookup once there are more than a couple of block-device tiers.
    by_tier: HashMap<Tier, usize>,
}

impl TieredAddressSpace {
    /// Builds the address space from the PMEM capacity followed by each
    /// block-device tier's capacity, in tier order. Tiers are laid out
    /// back to back starting at block 0.
    pub fn new(pmem_blocks: BlockNumber, bdev_blocks: &[BlockNumber]) -> Self {
        let mut windows = Vec::with_capacity(1 + bdev_blocks.len());
        let mut cursor = 0u64;
        if pmem_blocks > 0 {
            windows.push(TierWindow {
                tier: Tier::Pmem,
                start: 0,
                end: pmem_blocks - 1,
            });
            cursor = pmem_blocks;
        }
        for (i, &len) in bdev_blocks.iter().enumerate() {
            if len == 0 {
                continue;
            }
            windows.push(TierWindow {
                tier: Tier::Bdev(i as u8),
                start: cursor,
                end: cursor + len - 1,
            });
            cursor += len;
        }
        let by_tier = windows.iter().enumerate().map(|(i, w)| (w.tier, i)).collect();
        Self { windows, by_tier }
    }

    pub fn windows(&self) -> &[TierWindow] {
        &self.windows
    }

    pub fn window_for(&self, tier: Tier) -> Option<&TierWindow> {
        self.by_tier.get(&tier).map(|&i| &self.windows[i])
    }

    pub fn tier_start(&self, tier: Tier) -> CoreResult<BlockNumber> {
        self.window_for(tier).map(|w| w.start).ok_or(CoreError::Invalid)
    }

    pub fn tier_end(&self, tier: Tier) -> CoreResult<BlockNumber> {
        self.window_for(tier).map(|w| w.end).ok_or(CoreError::Invalid)
    }

    /// Returns the tier whose window contains `block`, or `Invalid` if no
    /// tier owns it.
    pub fn tier_of(&self, block: BlockNumber) -> CoreResult<Tier> {
        self.windows
            .iter()
            .find(|w| block >= w.start && block <= w.end)
            .map(|w| w.tier)
            .ok_or(CoreError::Invalid)
    }

    /// Local block number within the owning tier's window.
    pub fn local_of(&self, block: BlockNumber) -> CoreResult<BlockNumber> {
        let tier = self.tier_of(block)?;
        Ok(block - self.tier_start(tier)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> TieredAddressSpace {
        TieredAddressSpace::new(100, &[100, 100])
    }

    #[test]
    fn windows_are_contiguous_and_start_at_zero() {
        let s = space();
        assert_eq!(s.tier_start(Tier::Pmem).unwrap(), 0);
        assert_eq!(s.tier_end(Tier::Pmem).unwrap(), 99);
        assert_eq!(s.tier_start(Tier::Bdev(0)).unwrap(), 100);
        assert_eq!(s.tier_end(Tier::Bdev(0)).unwrap(), 199);
        assert_eq!(s.tier_start(Tier::Bdev(1)).unwrap(), 200);
        assert_eq!(s.tier_end(Tier::Bdev(1)).unwrap(), 299);
    }

    #[test]
    fn tier_of_resolves_each_window() {
        let s = space();
        assert_eq!(s.tier_of(0).unwrap(), Tier::Pmem);
        assert_eq!(s.tier_of(99).unwrap(), Tier::Pmem);
        assert_eq!(s.tier_of(100).unwrap(), Tier::Bdev(0));
        assert_eq!(s.tier_of(299).unwrap(), Tier::Bdev(1));
        assert!(s.tier_of(300).is_err());
    }

    #[test]
    fn local_of_subtracts_tier_start() {
        let s = space();
        assert_eq!(s.local_of(150).unwrap(), 50);
    }
}
