//! Crate-wide tunables.
//!
//! Every threshold and granularity named by the allocator, migration
//! engine and profiler lives in one [`Tunables`] record instead of being
//! baked in as compile-time constants, so a host can vary them per mount.

use alloc::vec::Vec;

/// Configuration knobs consulted by the allocator, migration engine and
/// access profiler.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Capacity trigger (percent) above which a tier is considered full.
    pub migration_downward_perc: u8,
    /// Threshold bit for the sync/async write classification.
    pub sync_bit: u32,
    /// Threshold bit for the sequential/random write classification.
    pub seq_bit: u32,
    /// Quiescence window, in seconds, after which accumulated profiler
    /// state is considered stale (approximately 2^reset_bit seconds).
    pub reset_bit: u32,
    /// Number of pages in the DRAM transfer buffer pool used for
    /// block-device-to-block-device migration.
    pub bdev_buffer_pages: usize,
    /// Preferred migration granularity for each block-device tier,
    /// indexed by tier (0 = first block-device tier), expressed as a
    /// power-of-two block count (`1 << opt_size_bit[tier]`).
    pub opt_size_bit: Vec<u32>,
}

impl Tunables {
    /// 30 seconds, the write-quiescence window named throughout the
    /// profiler design; kept distinct from `reset_bit`'s coarser window.
    pub const WRITE_QUIESCENCE_SECONDS: u64 = 30;

    pub fn opt_size_bit_for(&self, bdev_tier_index: usize) -> u32 {
        self.opt_size_bit
            .get(bdev_tier_index)
            .copied()
            .unwrap_or(0)
    }

    pub fn opt_size_for(&self, bdev_tier_index: usize) -> u64 {
        1u64 << self.opt_size_bit_for(bdev_tier_index)
    }

    /// `reset_bit` names a bit position in a nanosecond-scale tick
    /// counter (default 36 is approximately 64 seconds), but quiescence
    /// comparisons elsewhere in this crate are all in whole seconds;
    /// convert here rather than shifting `reset_bit` directly into a
    /// seconds count (which would overflow the intended window by nine
    /// orders of magnitude).
    pub fn reset_seconds(&self) -> u64 {
        (1u64 << self.reset_bit) / 1_000_000_000
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            migration_downward_perc: 75,
            sync_bit: 20,
            seq_bit: 2,
            reset_bit: 36,
            bdev_buffer_pages: 256,
            opt_size_bit: alloc::vec![3, 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let t = Tunables::default();
        assert_eq!(t.migration_downward_perc, 75);
        assert_eq!(t.sync_bit, 20);
        assert_eq!(t.seq_bit, 2);
        assert_eq!(t.opt_size_for(0), 8);
    }

    #[test]
    fn missing_tier_opt_size_defaults_to_one_block() {
        let t = Tunables {
            opt_size_bit: alloc::vec![3],
            ..Tunables::default()
        };
        assert_eq!(t.opt_size_for(5), 1);
    }

    #[test]
    fn default_reset_window_is_approximately_64_seconds() {
        let t = Tunables::default();
        assert_eq!(t.reset_seconds(), 68);
    }
}
