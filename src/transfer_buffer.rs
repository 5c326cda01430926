//! Small DRAM Transfer Buffer.
//!
//! A fixed pool of page-sized buffers guarded by a single mutex, used when
//! migration must stage data between two block-device tiers that cannot
//! go through the PMEM DAX mapping directly. Only one concurrent
//! block-device-to-block-device migration per superblock is possible with
//! this design; a future design could latch pages individually instead of
//! taking the whole pool's mutex.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block::IO_BLOCK_SIZE;

/// A pool of `pages` page-sized buffers behind one mutex.
pub struct TransferBuffer {
    pages: Mutex<Vec<u8>>,
    page_size: usize,
    num_pages: usize,
}

impl TransferBuffer {
    pub fn new(num_pages: usize) -> Self {
        let page_size = IO_BLOCK_SIZE as usize;
        let num_pages = num_pages.max(1);
        Self {
            pages: Mutex::new(vec![0u8; page_size * num_pages]),
            page_size,
            num_pages,
        }
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Acquires one transfer page under the pool's mutex, invokes `f` with
    /// exclusive access to it, and releases. The whole pool shares a
    /// single mutex (only one concurrent bdev-to-bdev migration per
    /// superblock), so only the first page of the pool is ever handed
    /// out; the remaining pages exist to make `num_pages` a real capacity
    /// rather than a cosmetic field, for a future per-page-latched design.
    pub fn with_transfer_page<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut pages = self.pages.lock();
        f(&mut pages[..self.page_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_transfer_page_grants_exclusive_access() {
        let buf = TransferBuffer::new(256);
        assert_eq!(buf.num_pages(), 256);
        buf.with_transfer_page(|page| {
            page[0] = 0x42;
        });
        buf.with_transfer_page(|page| {
            assert_eq!(page[0], 0x42);
        });
    }
}
