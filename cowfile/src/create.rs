//! Creating an empty cowfile for a base file.

use crate::fingerprint::fingerprint;
use crate::header::{self, CowHeader};
use snafu::{ResultExt, Snafu};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Block size used when the caller does not choose one.
pub const DEFAULT_MAPUNIT: u64 = 1024;

/// Errors when creating a cowfile.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CreateError {
    #[snafu(display("cannot open base file {}", path.display()))]
    OpenBase {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot compute fingerprint of {}", path.display()))]
    ComputeFingerprint {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot describe base file {}", path.display()))]
    Geometry {
        path: PathBuf,
        source: header::ReadError,
    },

    #[snafu(display("cannot create cowfile {}", path.display()))]
    CreateOverlay {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot write cowfile {}", path.display()))]
    WriteOverlay {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Creates a clean, empty cowfile at `overlay` for the base file `base`.
///
/// The base file is only read. A trailing partial block of the base file is
/// not covered. `overlay` must not exist yet.
pub fn create(base: &Path, overlay: &Path, mapunit: u64) -> Result<CowHeader, CreateError> {
    let mut file = File::open(base).context(OpenBaseSnafu { path: base })?;

    let len = file
        .seek(SeekFrom::End(0))
        .and_then(|len| file.rewind().map(|_| len))
        .context(OpenBaseSnafu { path: base })?;

    // Checked before the fingerprint so a bad mapunit fails fast.
    let mut header = CowHeader::for_base(mapunit, len / mapunit.max(1), 0)
        .context(GeometrySnafu { path: base })?;

    let rdofingerprint = fingerprint(&mut file, header.block_size())
        .context(ComputeFingerprintSnafu { path: base })?;

    header = CowHeader::for_base(mapunit, header.rdoblocks(), rdofingerprint)
        .context(GeometrySnafu { path: base })?;

    tracing::debug!(?header, base = %base.display(), "creating cowfile");

    let mut out = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(overlay)
        .context(CreateOverlaySnafu { path: overlay })?;

    // Bitmap and data region are sparse zeroes.
    out.write_all(header.as_bytes())
        .and_then(|_| out.set_len(header.raw_len()))
        .and_then(|_| out.sync_all())
        .context(WriteOverlaySnafu { path: overlay })?;

    tracing::info!(
        overlay = %overlay.display(),
        rdoblocks = header.rdoblocks(),
        mapunit,
        "cowfile created"
    );

    Ok(header)
}
