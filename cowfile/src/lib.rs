//! A library for maintaining copy-on-write block overlay files ("cowfiles").
//!
//! A cowfile sits on top of a read-only base file. It records which
//! fixed-size blocks of the base file have been rewritten in a bitmap and
//! keeps their new contents in a data region, leaving the base file itself
//! untouched.
//!
//! # Layout
//!
//! | Offset      | Contents                                           |
//! |-------------|----------------------------------------------------|
//! | `0`         | [`CowHeader`] (56 bytes, little endian)            |
//! | `mapunit`   | bitmap, one bit per base block, LSB first          |
//! | `doffset`   | data region, one `mapunit` slot per base block     |
//!
//! A packed cowfile keeps the header and bitmap but stores only the marked
//! blocks, contiguously and optionally gzip-compressed.
//!
//! # Operations
//!
//! - [`create()`](create::create) a clean cowfile for a base file
//! - [`repair()`](repair::repair) the bitmap after an unclean shutdown
//! - [`merge()`](merge::merge) the rewritten blocks back into the base file
//! - [`pack()`](pack::pack) and [`unpack()`](pack::unpack) a cowfile
//!
//! # Example
//!
//! ```no_run
//! use cowfile::{PackOptions, SilentProgress};
//! use std::path::Path;
//!
//! let report = cowfile::pack(
//!     Path::new("disk.cow"),
//!     Path::new("disk.cow.gz"),
//!     PackOptions { compressed: true },
//!     &SilentProgress,
//! )
//! .unwrap();
//!
//! println!("{} blocks packed", report.blocks);
//! ```

use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};

pub mod bitmap;
pub mod create;
pub mod fal;
pub mod fingerprint;
pub mod header;
mod io;
pub mod merge;
pub mod pack;
pub mod progress;
pub mod repair;

pub use self::bitmap::Bitmap;
pub use self::create::{CreateError, DEFAULT_MAPUNIT, create};
pub use self::header::{CowHeader, HeaderFlags};
pub use self::merge::{MergeError, MergePlan, MergeReport, merge};
pub use self::pack::{PackError, PackOptions, TransferReport, pack, unpack};
pub use self::progress::{Operation, Progress, SilentProgress};
pub use self::repair::{Correction, RepairError, RepairOptions, RepairReport, repair};

/// Errors when reading the header of a cowfile from disk.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadHeaderError {
    #[snafu(display("cannot open {}", path.display()))]
    Open {
        path: PathBuf,
        source: fal::FalError,
    },

    #[snafu(display("cannot read header of {}", path.display()))]
    Read {
        path: PathBuf,
        source: fal::FalError,
    },

    #[snafu(display("invalid header in {}", path.display()))]
    Parse {
        path: PathBuf,
        source: header::ReadError,
    },
}

/// Reads the header of a raw or packed cowfile.
///
/// Set `compressed` for a gzip-compressed packed cowfile.
pub fn read_header(path: &Path, compressed: bool) -> Result<CowHeader, ReadHeaderError> {
    let mut file = fal::open(path, fal::Mode::Read, compressed).context(OpenSnafu { path })?;
    let mut raw = [0u8; header::HEADER_SIZE];

    file.read(&mut raw).context(ReadSnafu { path })?;

    CowHeader::from_bytes(&raw).context(ParseSnafu { path })
}
