//! Bitmap repair after an unclean shutdown.
//!
//! Every data block that holds anything but zeroes must be marked in the
//! bitmap. Repair scans the data region in block order, sets the bits that are
//! missing, recomputes `cowused` and clears the dirty flag.

use crate::bitmap::{self, Bitmap};
use crate::header::{self, CowHeader, StateError};
use crate::io::read_full;
use crate::progress::{Operation, Progress};
use snafu::{ResultExt, Snafu};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Errors when repairing a cowfile.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RepairError {
    #[snafu(display("cannot open {}", path.display()))]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot load header of {}", path.display()))]
    LoadHeader {
        path: PathBuf,
        source: header::LoadError,
    },

    #[snafu(display("cannot repair {}", path.display()))]
    InvalidState { path: PathBuf, source: StateError },

    #[snafu(display("cannot load bitmap of {}", path.display()))]
    LoadBitmap {
        path: PathBuf,
        source: bitmap::LoadError,
    },

    #[snafu(display("cannot read data block #{block} of {}", path.display()))]
    ReadBlock {
        path: PathBuf,
        block: u64,
        source: std::io::Error,
    },

    #[snafu(display("cannot rewrite bitmap of {}", path.display()))]
    WriteBitmap {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot rewrite header of {}", path.display()))]
    WriteHeader {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Switches for [`repair()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RepairOptions {
    /// Repair a cowfile that is not marked dirty.
    pub force: bool,

    /// Scan and report without modifying the cowfile.
    pub dry_run: bool,
}

/// A data block that was not marked in the bitmap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Correction {
    pub block: u64,
    /// Offset of the block within the data region.
    pub data_offset: u64,
}

/// Outcome of [`repair()`].
#[derive(Debug)]
pub struct RepairReport {
    pub corrections: Vec<Correction>,
    /// `cowused` as stored before the repair.
    pub previous_cowused: u64,
    /// Number of bits set in the repaired bitmap.
    pub cowused: u64,
    /// Blocks read from the data region.
    pub scanned: u64,
    /// `true` if nothing was written.
    pub dry_run: bool,
}

/// Repairs the bitmap of the cowfile at `path`.
///
/// The file must be dirty unless [`RepairOptions::force`] is set, and must
/// not be packed. With [`RepairOptions::dry_run`] the file is opened read-only
/// and the report tells what would have been corrected.
pub fn repair(
    path: &Path,
    options: RepairOptions,
    progress: &dyn Progress,
) -> Result<RepairReport, RepairError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(!options.dry_run)
        .open(path)
        .context(OpenSnafu { path })?;

    let mut header = header::read_from(&mut file).context(LoadHeaderSnafu { path })?;

    tracing::debug!(?header, "loaded header");

    header
        .validate_for_repair(options.force)
        .context(InvalidStateSnafu { path })?;

    let mut bitmap = bitmap::load(&mut file, &header).context(LoadBitmapSnafu { path })?;

    let (corrections, scanned) = scan(&mut file, path, &header, &mut bitmap, progress)?;

    let previous_cowused = header.cowused();
    let cowused = bitmap.count_set_bits();

    if !options.dry_run {
        if !corrections.is_empty() {
            bitmap::store(&mut file, &header, &bitmap).context(WriteBitmapSnafu { path })?;
        }

        header.set_cowused(cowused);
        header.set_dirty(false);

        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(header.as_bytes()))
            .and_then(|_| file.sync_data())
            .context(WriteHeaderSnafu { path })?;
    }

    progress.finish();

    tracing::info!(
        path = %path.display(),
        corrections = corrections.len(),
        cowused,
        dry_run = options.dry_run,
        "repair finished"
    );

    Ok(RepairReport {
        corrections,
        previous_cowused,
        cowused,
        scanned,
        dry_run: options.dry_run,
    })
}

/// Reads the data region block by block and marks every non-zero block.
fn scan(
    file: &mut File,
    path: &Path,
    header: &CowHeader,
    bitmap: &mut Bitmap,
    progress: &dyn Progress,
) -> Result<(Vec<Correction>, u64), RepairError> {
    let block_size = header.block_size();
    let blocks = header.rdoblocks();
    let zeroes = vec![0u8; block_size];
    let mut buf = vec![0u8; block_size];
    let mut corrections = Vec::new();

    file.seek(SeekFrom::Start(header.doffset()))
        .context(ReadBlockSnafu { path, block: 0u64 })?;

    progress.start(Operation::Repair, blocks);

    let mut block = 0;

    while block < blocks {
        let n = read_full(file, &mut buf).context(ReadBlockSnafu { path, block })?;

        if n == 0 {
            break;
        }

        if n < block_size {
            tracing::warn!(block, len = n, "data region ends with a partial block");
            buf[n..].fill(0);
        }

        // Zeroes are either never written or explicitly zeroed; both are fine unmarked.
        if buf != zeroes && bitmap.set(block) {
            let correction = Correction {
                block,
                data_offset: block * header.mapunit(),
            };

            tracing::debug!(block, data_offset = correction.data_offset, "block not marked in bitmap");
            progress.block_corrected(correction.block, correction.data_offset);
            corrections.push(correction);
        }

        progress.block_done(block);
        block += 1;

        if n < block_size {
            break;
        }
    }

    Ok((corrections, block))
}
