use std::fmt::{Display, Formatter};

/// The operation a [`Progress`] is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Repair,
    Merge,
    Pack,
    Unpack,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Repair => "repair",
            Self::Merge => "merge",
            Self::Pack => "pack",
            Self::Unpack => "unpack",
        })
    }
}

/// Trait for receiving progress updates from long-running operations.
///
/// All methods take `&self` and default to doing nothing.
pub trait Progress {
    /// Called once the amount of work is known.
    ///
    /// `total` is the number of blocks that will be scanned (repair) or
    /// transferred (merge, pack, unpack).
    fn start(&self, _operation: Operation, _total: u64) {}

    /// Called after each block has been scanned or transferred.
    fn block_done(&self, _block: u64) {}

    /// Called when repair sets a bitmap bit that was missing.
    ///
    /// `data_offset` is the offset of the block within the data region.
    fn block_corrected(&self, _block: u64, _data_offset: u64) {}

    /// Called when the operation has finished successfully.
    fn finish(&self) {}
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl Progress for SilentProgress {}
