//! Crate-wide error taxonomy.
//!
//! Every fallible operation exposed by this crate returns a [`CoreResult`]
//! built from the closed [`CoreError`] set below. There is no automatic
//! retry beyond the cross-shard steal in [`crate::tier_alloc`]; corruption
//! at a single range node is not fatal on its own (see [`CoreError::Corrupt`]).

use alloc::boxed::Box;
use core::fmt;

/// Result alias used throughout the crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Common trait for an external collaborator's own error type (e.g. a
/// caller's [`crate::io::BlockDevice`] implementation), used to wrap a
/// lowest-level error behind a trait object without this crate depending
/// on that error's concrete type.
pub trait BaseError: fmt::Debug {}

/// The closed error taxonomy returned by this crate's public operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// Bad arguments: zero-length request, a block number outside every
    /// tier's window, or similar caller error.
    Invalid,
    /// The allocator cannot satisfy a contiguous request within the tier.
    OutOfSpace,
    /// The range-node pool is exhausted.
    OutOfMemory,
    /// A block-device submission failed, or a free request referenced a
    /// range outside its owning shard's window.
    IoError,
    /// The migration target entry is already undergoing migration, or is
    /// locked by a concurrent reader/writer.
    Busy,
    /// The requested tier pair has no copy primitive (e.g. PMEM to PMEM
    /// through the block-device path).
    Unsupported,
    /// A range-node checksum mismatch was observed; the node was skipped.
    Corrupt,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CoreError::Invalid => "invalid argument",
            CoreError::OutOfSpace => "out of space",
            CoreError::OutOfMemory => "out of memory",
            CoreError::IoError => "I/O error",
            CoreError::Busy => "resource busy",
            CoreError::Unsupported => "unsupported operation",
            CoreError::Corrupt => "corrupt range node",
        };
        f.write_str(msg)
    }
}

/// Wraps a boxed [`BaseError`] from an external collaborator (most often a
/// [`crate::io::BlockDevice`] implementation) as an `IoError`, logging the
/// source so a host can still correlate the failure without this crate's
/// public error taxonomy growing a case per downstream device crate.
impl From<Box<dyn BaseError>> for CoreError {
    fn from(source: Box<dyn BaseError>) -> Self {
        log::error!("core: I/O shim wrapping external device error: {source:?}");
        CoreError::IoError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeDeviceFault;
    impl BaseError for FakeDeviceFault {}

    #[test]
    fn boxed_base_error_converts_to_io_error() {
        let boxed: Box<dyn BaseError> = Box::new(FakeDeviceFault);
        let err: CoreError = boxed.into();
        assert_eq!(err, CoreError::IoError);
    }

    #[test]
    fn display_is_stable_for_every_kind() {
        let kinds = [
            CoreError::Invalid,
            CoreError::OutOfSpace,
            CoreError::OutOfMemory,
            CoreError::IoError,
            CoreError::Busy,
            CoreError::Unsupported,
            CoreError::Corrupt,
        ];
        for kind in kinds {
            assert!(!kind.to_string().is_empty());
        }
    }
}
