//! Conversion between the raw cowfile layout and the packed layout.
//!
//! A raw cowfile has one slot per block of the base file. A packed cowfile
//! keeps the same header and bitmap but stores only the marked blocks, back to
//! back in block order, optionally inside a gzip stream.
//!
//! Both directions walk the bitmap once. The gap since the previously
//! transferred block is skipped with a single relative seek on the raw side,
//! so a fully populated bitmap is copied without any seek at all.

use crate::bitmap::{AllocError, Bitmap};
use crate::fal::{self, FalError, FalFile, Mode};
use crate::header::{self, CowHeader, HEADER_SIZE, StateError};
use crate::progress::{Operation, Progress};
use snafu::{ResultExt, Snafu, ensure};
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

/// Errors when packing or unpacking a cowfile.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum PackError {
    #[snafu(display("source and destination are both {}", path.display()))]
    SameFile { path: PathBuf },

    #[snafu(display("cannot open source {}", path.display()))]
    OpenSource { path: PathBuf, source: FalError },

    #[snafu(display("cannot read header of {}", path.display()))]
    ReadHeader { path: PathBuf, source: FalError },

    #[snafu(display("invalid header in {}", path.display()))]
    ParseHeader {
        path: PathBuf,
        source: header::ReadError,
    },

    #[snafu(display("cannot {operation} {}", path.display()))]
    InvalidState {
        path: PathBuf,
        operation: Operation,
        source: StateError,
    },

    #[snafu(transparent)]
    Allocate { source: AllocError },

    #[snafu(display("cannot read bitmap of {}", path.display()))]
    ReadBitmap { path: PathBuf, source: FalError },

    #[snafu(display("block #{block} of {} is beyond the {rdoblocks} blocks of the base file", path.display()))]
    BlockOutOfRange {
        path: PathBuf,
        block: u64,
        rdoblocks: u64,
    },

    #[snafu(display("cannot inspect source {}", path.display()))]
    InspectSource {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("source {} holds {len} bytes but its data region starts at {required}", path.display()))]
    SourceTooShort {
        path: PathBuf,
        len: u64,
        required: u64,
    },

    #[snafu(display("cannot open destination {}", path.display()))]
    OpenDestination { path: PathBuf, source: FalError },

    #[snafu(display("cannot write header and bitmap to {}", path.display()))]
    WriteMetadata { path: PathBuf, source: FalError },

    #[snafu(display("cannot read block #{block} from {}", path.display()))]
    ReadBlock {
        path: PathBuf,
        block: u64,
        source: FalError,
    },

    #[snafu(display("cannot write block #{block} to {}", path.display()))]
    WriteBlock {
        path: PathBuf,
        block: u64,
        source: FalError,
    },

    #[snafu(display("cannot close {}", path.display()))]
    CloseSource { path: PathBuf, source: FalError },

    #[snafu(display("cannot close {}", path.display()))]
    CloseDestination { path: PathBuf, source: FalError },

    #[snafu(display("cannot extend {} to {len} bytes", path.display()))]
    Resize {
        path: PathBuf,
        len: u64,
        source: std::io::Error,
    },
}

/// Switches for [`pack()`] and [`unpack()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PackOptions {
    /// The packed side is a gzip stream.
    pub compressed: bool,
}

/// Outcome of [`pack()`] or [`unpack()`].
#[derive(Clone, Copy, Debug)]
pub struct TransferReport {
    /// Header as written to the destination.
    pub header: CowHeader,
    /// Blocks copied.
    pub blocks: u64,
    /// Relative seeks done while copying blocks.
    pub seeks: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Pack,
    Unpack,
}

impl Direction {
    fn operation(self) -> Operation {
        match self {
            Self::Pack => Operation::Pack,
            Self::Unpack => Operation::Unpack,
        }
    }
}

/// Packs the raw cowfile `source` into `dest`.
///
/// `dest` is created or truncated, but only after `source` has been fully
/// validated.
pub fn pack(
    source: &Path,
    dest: &Path,
    options: PackOptions,
    progress: &dyn Progress,
) -> Result<TransferReport, PackError> {
    transfer(Direction::Pack, source, dest, options, progress)
}

/// Unpacks the packed cowfile `source` into the raw cowfile `dest`.
///
/// The result is extended to its full raw size.
pub fn unpack(
    source: &Path,
    dest: &Path,
    options: PackOptions,
    progress: &dyn Progress,
) -> Result<TransferReport, PackError> {
    let report = transfer(Direction::Unpack, source, dest, options, progress)?;
    let len = report.header.raw_len();

    let file = OpenOptions::new()
        .write(true)
        .open(dest)
        .context(ResizeSnafu { path: dest, len })?;

    let current = file
        .metadata()
        .context(ResizeSnafu { path: dest, len })?
        .len();

    if current < len {
        file.set_len(len)
            .and_then(|_| file.sync_data())
            .context(ResizeSnafu { path: dest, len })?;
    }

    Ok(report)
}

fn transfer(
    direction: Direction,
    source_path: &Path,
    dest_path: &Path,
    options: PackOptions,
    progress: &dyn Progress,
) -> Result<TransferReport, PackError> {
    let operation = direction.operation();
    let (source_compressed, dest_compressed) = match direction {
        Direction::Pack => (false, options.compressed),
        Direction::Unpack => (options.compressed, false),
    };

    ensure!(
        !same_file(source_path, dest_path),
        SameFileSnafu { path: source_path }
    );

    let mut source = fal::open(source_path, Mode::Read, source_compressed)
        .context(OpenSourceSnafu { path: source_path })?;

    let mut raw = [0u8; HEADER_SIZE];

    source
        .read(&mut raw)
        .context(ReadHeaderSnafu { path: source_path })?;

    let mut header = CowHeader::from_bytes(&raw).context(ParseHeaderSnafu { path: source_path })?;

    tracing::debug!(?header, %operation, "loaded header");

    match direction {
        Direction::Pack => header.validate_for_pack(),
        Direction::Unpack => header.validate_for_unpack(),
    }
    .context(InvalidStateSnafu {
        path: source_path,
        operation,
    })?;

    let mut bitmap = Bitmap::zeroed(header.mapsize())?;

    source
        .seek(SeekFrom::Start(header.bitmap_offset()))
        .and_then(|_| source.read(bitmap.as_mut_bytes()))
        .context(ReadBitmapSnafu { path: source_path })?;

    if let Some(block) = bitmap.last_set() {
        ensure!(
            block < header.rdoblocks(),
            BlockOutOfRangeSnafu {
                path: source_path,
                block,
                rdoblocks: header.rdoblocks(),
            }
        );
    }

    if direction == Direction::Pack {
        let metadata =
            std::fs::metadata(source_path).context(InspectSourceSnafu { path: source_path })?;

        // Devices report no length.
        if metadata.is_file() {
            ensure!(
                metadata.len() >= header.doffset(),
                SourceTooShortSnafu {
                    path: source_path,
                    len: metadata.len(),
                    required: header.doffset(),
                }
            );
        }
    }

    header.set_packed(direction == Direction::Pack);

    let mut dest = fal::open(dest_path, Mode::Write, dest_compressed)
        .context(OpenDestinationSnafu { path: dest_path })?;

    write_metadata(dest.as_mut(), &header, &bitmap)
        .context(WriteMetadataSnafu { path: dest_path })?;

    source
        .seek(SeekFrom::Start(header.doffset()))
        .context(ReadBlockSnafu {
            path: source_path,
            block: 0u64,
        })?;

    let total = bitmap.count_set_bits();
    let mapunit = header.mapunit();
    let mut buf = vec![0u8; header.block_size()];
    let mut next = 0;
    let mut seeks = 0;

    progress.start(operation, total);

    for block in bitmap.iter_set() {
        let shift = block - next;

        if shift > 0 {
            // Only the raw side has slots for unmarked blocks.
            let delta = SeekFrom::Current((shift * mapunit) as i64);

            tracing::trace!(block, shift, "skipping unmarked blocks");

            match direction {
                Direction::Pack => source.seek(delta).context(ReadBlockSnafu {
                    path: source_path,
                    block,
                })?,
                Direction::Unpack => dest.seek(delta).context(WriteBlockSnafu {
                    path: dest_path,
                    block,
                })?,
            };

            seeks += 1;
        }

        source.read(&mut buf).context(ReadBlockSnafu {
            path: source_path,
            block,
        })?;

        dest.write(&buf).context(WriteBlockSnafu {
            path: dest_path,
            block,
        })?;

        progress.block_done(block);
        next = block + 1;
    }

    source
        .close()
        .context(CloseSourceSnafu { path: source_path })?;

    dest.flush()
        .and_then(|_| dest.close())
        .context(CloseDestinationSnafu { path: dest_path })?;

    progress.finish();

    tracing::info!(
        source = %source_path.display(),
        dest = %dest_path.display(),
        %operation,
        blocks = total,
        seeks,
        compressed = options.compressed,
        "transfer finished"
    );

    Ok(TransferReport {
        header,
        blocks: total,
        seeks,
    })
}

/// Returns `true` if both paths name the same existing file.
fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Writes the header and bitmap, then pads up to the data region.
fn write_metadata(
    dest: &mut dyn FalFile,
    header: &CowHeader,
    bitmap: &Bitmap,
) -> Result<(), FalError> {
    dest.write(header.as_bytes())?;
    dest.seek(SeekFrom::Start(header.bitmap_offset()))?;
    dest.write(bitmap.as_bytes())?;

    // Written rather than seeked so an empty packed file still ends at doffset.
    let zeroes = vec![0u8; header.block_size()];
    let mut position = dest.position();

    while position < header.doffset() {
        let n = (header.doffset() - position).min(header.mapunit());

        dest.write(&zeroes[..n as usize])?;
        position += n;
    }

    Ok(())
}
