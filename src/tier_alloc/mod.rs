//! Tier Allocator.
//!
//! Chooses a tier and CPU shard, satisfies a contiguous allocation
//! request, handles cross-CPU steal when the local shard is exhausted,
//! and routes a free request back to its owning shard.

pub mod free_list;

use alloc::vec::Vec;

use crate::block::{BlockNumber, Tier, TieredAddressSpace};
use crate::error::{CoreError, CoreResult};
use crate::range_tree::Direction;
use free_list::FreeList;

/// Sentinel requesting the allocator pick the current CPU's shard.
pub const ANY_CPU: usize = usize::MAX;

/// Bounds the cross-shard steal loop: after this many retries the
/// allocator attempts the request anyway, per the steal policy in the
/// component design.
const MAX_STEAL_RETRIES: usize = 2;

/// Owns every `(tier, cpu)` [`FreeList`] shard and implements
/// `alloc_tier`/`free_tier` over them.
pub struct TierAllocator {
    shards: Vec<FreeList>,
    cpus: usize,
    address_space: TieredAddressSpace,
}

impl TierAllocator {
    /// Builds one shard per `(tier, cpu)` pair by evenly dividing each
    /// tier's window across `cpus` shards (the last shard absorbs any
    /// remainder).
    pub fn new(address_space: TieredAddressSpace, cpus: usize) -> CoreResult<Self> {
        if cpus == 0 {
            return Err(CoreError::Invalid);
        }
        let mut shards = Vec::new();
        for window in address_space.windows() {
            let total = window.end - window.start + 1;
            let per_cpu = total / cpus as u64;
            if per_cpu == 0 {
                return Err(CoreError::Invalid);
            }
            let mut cursor = window.start;
            for cpu in 0..cpus {
                let is_last = cpu + 1 == cpus;
                let end = if is_last {
                    window.end
                } else {
                    cursor + per_cpu - 1
                };
                shards.push(FreeList::new(window.tier, cpu, cursor, end));
                cursor = end + 1;
            }
        }
        Ok(Self {
            shards,
            cpus,
            address_space,
        })
    }

    pub fn address_space(&self) -> &TieredAddressSpace {
        &self.address_space
    }

    fn resolve_cpu(cpu: usize, current_cpu: usize) -> usize {
        if cpu == ANY_CPU {
            current_cpu
        } else {
            cpu
        }
    }

    fn shard(&self, tier: Tier, cpu: usize) -> Option<&FreeList> {
        self.shards.iter().find(|s| s.tier == tier && s.cpu == cpu)
    }

    fn shards_in_tier(&self, tier: Tier) -> impl Iterator<Item = &FreeList> {
        self.shards.iter().filter(move |s| s.tier == tier)
    }

    /// Picks the shard in `tier` with the most free blocks, ties broken
    /// by the lowest CPU index.
    fn richest_shard(&self, tier: Tier) -> Option<&FreeList> {
        self.shards_in_tier(tier)
            .fold(None::<&FreeList>, |best, candidate| match best {
                None => Some(candidate),
                Some(b) if candidate.num_free_blocks() > b.num_free_blocks() => Some(candidate),
                Some(b) => Some(b),
            })
    }

    /// Allocates `n` contiguous blocks from `tier`, starting at `cpu`'s
    /// shard (or the current CPU's shard if `cpu == ANY_CPU`). Falls back
    /// to the richest shard in the tier, up to [`MAX_STEAL_RETRIES`]
    /// times, before attempting on the last-chosen shard regardless.
    pub fn alloc_tier(
        &self,
        tier: Tier,
        cpu: usize,
        current_cpu: usize,
        n: u64,
        direction: Direction,
    ) -> CoreResult<(BlockNumber, u64)> {
        if n == 0 {
            return Err(CoreError::Invalid);
        }

        let local_cpu = Self::resolve_cpu(cpu, current_cpu);
        let local = self
            .shard(tier, local_cpu)
            .ok_or(CoreError::Invalid)?;

        if local.num_free_blocks() >= n {
            if let Ok(start) = local.alloc(n, direction) {
                return Ok((start, n));
            }
        }

        let mut last_err = CoreError::OutOfSpace;
        for _ in 0..MAX_STEAL_RETRIES {
            let candidate = match self.richest_shard(tier) {
                Some(c) => c,
                None => return Err(CoreError::Invalid),
            };
            match candidate.alloc(n, direction) {
                Ok(start) => return Ok((start, n)),
                Err(e) => last_err = e,
            }
        }

        log::warn!(
            "tier allocator: steal exhausted for tier {tier:?}, attempting local shard anyway"
        );
        match local.alloc(n, direction) {
            Ok(start) => Ok((start, n)),
            Err(_) => Err(last_err),
        }
    }

    /// Releases `[block, block + n)` back to the shard that owns `block`,
    /// found by scanning tier windows and then per-tier shard windows
    /// (distinct from the steal-scan above, which only runs within an
    /// already-known tier).
    pub fn free_tier(&self, block: BlockNumber, n: u64) -> CoreResult<()> {
        if n == 0 {
            return Err(CoreError::Invalid);
        }
        let hi = block + n - 1;
        let shard = self
            .shards
            .iter()
            .find(|s| block >= s.block_start && hi <= s.block_end)
            .ok_or(CoreError::IoError)?;
        shard.free(block, hi)
    }

    pub fn tier_of(&self, block: BlockNumber) -> CoreResult<Tier> {
        self.address_space.tier_of(block)
    }

    pub fn cpus(&self) -> usize {
        self.cpus
    }

    pub fn used(&self, tier: Tier) -> u64 {
        self.total(tier) - self.free(tier)
    }

    pub fn total(&self, tier: Tier) -> u64 {
        self.shards_in_tier(tier).map(|s| s.num_total_blocks()).sum()
    }

    pub fn free(&self, tier: Tier) -> u64 {
        self.shards_in_tier(tier).map(|s| s.num_free_blocks()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> TierAllocator {
        let space = TieredAddressSpace::new(1000, &[]);
        TierAllocator::new(space, 4).unwrap()
    }

    #[test]
    fn local_allocation_succeeds_without_steal() {
        let a = allocator();
        let (start, got) = a
            .alloc_tier(Tier::Pmem, 0, 0, 10, Direction::FromHead)
            .unwrap();
        assert_eq!(start, 0);
        assert_eq!(got, 10);
    }

    #[test]
    fn b4_steal_picks_richest_shard_ties_to_lowest_index() {
        let a = allocator();
        // Drain shard 0 almost entirely so it cannot satisfy a large request.
        a.alloc_tier(Tier::Pmem, 0, 0, 240, Direction::FromHead)
            .unwrap();
        // Request more than shard 0 has left (10 blocks remain); every
        // other shard still has its full 250-block allotment, so the
        // steal path must pick shard 1 (lowest untouched index).
        let (start, _) = a
            .alloc_tier(Tier::Pmem, 0, 0, 250, Direction::FromHead)
            .unwrap();
        assert_eq!(start, 250);
    }

    #[test]
    fn free_tier_routes_to_owning_shard() {
        let a = allocator();
        let (start, _) = a
            .alloc_tier(Tier::Pmem, 0, 0, 10, Direction::FromHead)
            .unwrap();
        a.free_tier(start, 10).unwrap();
        assert_eq!(a.free(Tier::Pmem), a.total(Tier::Pmem));
    }

    #[test]
    fn alloc_zero_is_invalid() {
        let a = allocator();
        assert_eq!(
            a.alloc_tier(Tier::Pmem, 0, 0, 0, Direction::FromHead)
                .unwrap_err(),
            CoreError::Invalid
        );
    }
}
