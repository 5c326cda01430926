//! Block-Device I/O Shim.
//!
//! A thin interface that submits a single contiguous read or write from a
//! tier device into one page buffer, synchronously or asynchronously. The
//! backing device itself is an external collaborator reached only through
//! [`BlockDevice`]; ASYNC here is a queued completion over that same
//! synchronous trait, matching the scope boundary that raw I/O submission
//! primitives are out of this crate's scope.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bytemuck::{Pod, Zeroable};
use spin::Mutex;

use crate::block::Tier;
use crate::error::{CoreError, CoreResult};

/// Submission mode for a block-device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Sync,
    Async,
}

/// External collaborator: a single block-device tier's raw read/write
/// primitive. Implementations perform the actual I/O; this crate never
/// opens, probes, or paths a device itself (device discovery is left to
/// configuration).
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, byte_off: u64, buf: &mut [u8]) -> CoreResult<()>;
    fn write_at(&self, byte_off: u64, buf: &[u8]) -> CoreResult<()>;
}

/// Per-block-device-tier geometry and preferred migration granularity,
/// the on-disk record's in-memory counterpart.
pub struct BdevInfo {
    pub tier: Tier,
    pub device: Box<dyn BlockDevice>,
    pub capacity_page: u64,
    pub opt_size_bit: u32,
}

impl BdevInfo {
    pub fn new(tier: Tier, device: Box<dyn BlockDevice>, capacity_page: u64, opt_size_bit: u32) -> Self {
        Self {
            tier,
            device,
            capacity_page,
            opt_size_bit,
        }
    }

    /// The fixed-width on-disk record for this tier's persistent layout,
    /// independent of the in-memory `device` handle.
    pub fn to_record(&self, path: &str, major: u32, minor: u32, capacity_sector: u64) -> BdevRecord {
        let mut record = BdevRecord {
            tier_code: self.tier.bdev_index().map(|i| i as u8 + 1).unwrap_or(0),
            _pad: [0; 7],
            major,
            minor,
            capacity_sector,
            capacity_page: self.capacity_page,
            opt_size_bit: self.opt_size_bit,
            path_len: path.len().min(PATH_CAPACITY) as u32,
            path: [0; PATH_CAPACITY],
        };
        let n = record.path_len as usize;
        record.path[..n].copy_from_slice(&path.as_bytes()[..n]);
        record
    }
}

const PATH_CAPACITY: usize = 64;

/// Plain-old-data mirror of `BdevInfo`'s on-disk encoding: `{ tier, path,
/// major, minor, capacity_sector, capacity_page, opt_size_bit }`.
/// Device selection and path probing themselves stay out of this crate's
/// scope; this type only carries the bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BdevRecord {
    /// 0 = PMEM (never actually written for a block-device tier entry),
    /// 1 + bdev index otherwise, mirroring `WriteEntry`'s tier encoding.
    pub tier_code: u8,
    _pad: [u8; 7],
    pub major: u32,
    pub minor: u32,
    pub capacity_sector: u64,
    pub capacity_page: u64,
    pub opt_size_bit: u32,
    pub path_len: u32,
    pub path: [u8; PATH_CAPACITY],
}

impl BdevRecord {
    pub fn path_str(&self) -> &str {
        let n = (self.path_len as usize).min(PATH_CAPACITY);
        core::str::from_utf8(&self.path[..n]).unwrap_or("")
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<&Self> {
        bytemuck::try_from_bytes(bytes).map_err(|_| CoreError::Invalid)
    }
}

enum PendingOp {
    Read { byte_off: u64, len: usize },
    Write { byte_off: u64, data: Vec<u8> },
}

struct Pending<'d> {
    device: &'d dyn BlockDevice,
    op: PendingOp,
}

/// Completion handle for one ASYNC submission; collected by a
/// per-superblock list and awaited by [`AsyncIoList::flush_async`].
pub struct AsyncIoList<'d> {
    pending: Mutex<Vec<Pending<'d>>>,
}

impl<'d> Default for AsyncIoList<'d> {
    fn default() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl<'d> AsyncIoList<'d> {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, device: &'d dyn BlockDevice, op: PendingOp) {
        self.pending.lock().push(Pending { device, op });
    }

    /// Waits for every pending ASYNC submission, returning the first
    /// error encountered (if any) after draining the whole list.
    pub fn flush_async(&self) -> CoreResult<()> {
        let mut ops = self.pending.lock();
        let mut first_err = None;
        for pending in ops.drain(..) {
            let result = match pending.op {
                PendingOp::Read { byte_off, len } => {
                    let mut buf = alloc::vec![0u8; len];
                    pending.device.read_at(byte_off, &mut buf)
                }
                PendingOp::Write { byte_off, data } => pending.device.write_at(byte_off, &data),
            };
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Submits a byte-granularity write. `Sync` blocks until completion;
/// `Async` enqueues on `list` and returns immediately.
pub fn bdev_write<'d>(
    device: &'d dyn BlockDevice,
    list: &AsyncIoList<'d>,
    byte_off: u64,
    buf: &[u8],
    mode: IoMode,
) -> CoreResult<()> {
    match mode {
        IoMode::Sync => device.write_at(byte_off, buf).map_err(|_| CoreError::IoError),
        IoMode::Async => {
            list.enqueue(
                device,
                PendingOp::Write {
                    byte_off,
                    data: buf.to_vec(),
                },
            );
            Ok(())
        }
    }
}

/// Submits a byte-granularity read. See [`bdev_write`] for mode semantics.
/// The ASYNC variant has no way to deliver completion bytes back into
/// `buf` — `flush_async` reads into its own scratch buffer and discards
/// it, only surfacing the first error. Callers that need the bytes (any
/// read whose result is consumed, as opposed to a fire-and-forget
/// read-ahead) must use `IoMode::Sync`.
pub fn bdev_read<'d>(
    device: &'d dyn BlockDevice,
    list: &AsyncIoList<'d>,
    byte_off: u64,
    buf: &mut [u8],
    mode: IoMode,
) -> CoreResult<()> {
    match mode {
        IoMode::Sync => device.read_at(byte_off, buf).map_err(|_| CoreError::IoError),
        IoMode::Async => {
            list.enqueue(
                device,
                PendingOp::Read {
                    byte_off,
                    len: buf.len(),
                },
            );
            Ok(())
        }
    }
}

/// Block-granularity write: multiplies `block_off`/`num_blocks` by the
/// block size before calling [`bdev_write`].
pub fn bdev_write_block<'d>(
    device: &'d dyn BlockDevice,
    list: &AsyncIoList<'d>,
    block_off: u64,
    buf: &[u8],
    mode: IoMode,
) -> CoreResult<()> {
    bdev_write(
        device,
        list,
        block_off * crate::block::IO_BLOCK_SIZE,
        buf,
        mode,
    )
}

/// Block-granularity read, see [`bdev_write_block`].
pub fn bdev_read_block<'d>(
    device: &'d dyn BlockDevice,
    list: &AsyncIoList<'d>,
    block_off: u64,
    buf: &mut [u8],
    mode: IoMode,
) -> CoreResult<()> {
    bdev_read(
        device,
        list,
        block_off * crate::block::IO_BLOCK_SIZE,
        buf,
        mode,
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::MemoryBlockDevice;
    use super::*;

    #[test]
    fn sync_write_then_read_round_trips() {
        let dev = MemoryBlockDevice::new(4096);
        let list = AsyncIoList::new();
        bdev_write(&dev, &list, 0, &[1, 2, 3, 4], IoMode::Sync).unwrap();
        let mut buf = [0u8; 4];
        bdev_read(&dev, &list, 0, &mut buf, IoMode::Sync).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn async_write_is_deferred_until_flush() {
        let dev = MemoryBlockDevice::new(4096);
        let list = AsyncIoList::new();
        bdev_write(&dev, &list, 0, &[9, 9, 9, 9], IoMode::Async).unwrap();
        assert_eq!(&dev.snapshot()[0..4], &[0, 0, 0, 0]);
        list.flush_async().unwrap();
        assert_eq!(&dev.snapshot()[0..4], &[9, 9, 9, 9]);
    }

    #[test]
    fn bdev_record_round_trips_through_bytes() {
        let info = BdevInfo::new(
            Tier::Bdev(1),
            alloc::boxed::Box::new(MemoryBlockDevice::new(4096)),
            1_000_000,
            3,
        );
        let record = info.to_record("/dev/sdb1", 8, 17, 2_000_000);
        assert_eq!(record.path_str(), "/dev/sdb1");

        let bytes = record.as_bytes().to_vec();
        let parsed = BdevRecord::from_bytes(&bytes).unwrap();
        assert_eq!(*parsed, record);
        assert_eq!(parsed.capacity_page, 1_000_000);
        assert_eq!(parsed.opt_size_bit, 3);
        assert_eq!(parsed.tier_code, 2);
    }

    #[test]
    fn out_of_range_io_is_io_error() {
        let dev = MemoryBlockDevice::new(16);
        let list = AsyncIoList::new();
        let err = bdev_write(&dev, &list, 10, &[0u8; 16], IoMode::Sync).unwrap_err();
        assert_eq!(err, CoreError::IoError);
    }
}
