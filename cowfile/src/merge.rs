//! Writing the blocks of a cowfile back into its base file.

use crate::bitmap::{self, Bitmap};
use crate::fingerprint::fingerprint;
use crate::header::{self, CowHeader, StateError};
use crate::progress::{Operation, Progress};
use snafu::{ResultExt, Snafu, ensure};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Upper bound for a single read/write pair when copying a run of blocks.
const MAX_CHUNK: u64 = 1 << 20;

/// Errors when merging a cowfile into its base file.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum MergeError {
    #[snafu(display("cannot open cowfile {}", path.display()))]
    OpenOverlay {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("cannot load header of {}", path.display()))]
    LoadHeader {
        path: PathBuf,
        source: header::LoadError,
    },

    #[snafu(display("cannot merge {}", path.display()))]
    InvalidState { path: PathBuf, source: StateError },

    #[snafu(display("cannot load bitmap of {}", path.display()))]
    LoadBitmap {
        path: PathBuf,
        source: bitmap::LoadError,
    },

    #[snafu(display("block #{block} of {} is beyond the {rdoblocks} blocks of the base file", path.display()))]
    BlockOutOfRange {
        path: PathBuf,
        block: u64,
        rdoblocks: u64,
    },

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

    #[snafu(display(
        "fingerprint of {} ({actual:#010x}) does not correspond with {} ({expected:#010x})",
        base.display(),
        overlay.display()
    ))]
    FingerprintMismatch {
        base: PathBuf,
        overlay: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[snafu(display("base file {} holds {len} bytes but {required} are needed", path.display()))]
    BaseTooSmall {
        path: PathBuf,
        len: u64,
        required: u64,
    },

    #[snafu(display("merge was not confirmed"))]
    NotConfirmed,

    #[snafu(display("cannot read block #{block} from {}", path.display()))]
    ReadOverlay {
        path: PathBuf,
        block: u64,
        source: std::io::Error,
    },

    #[snafu(display("cannot write block #{block} to {}", path.display()))]
    WriteBase {
        path: PathBuf,
        block: u64,
        source: std::io::Error,
    },

    #[snafu(display("cannot sync {}", path.display()))]
    SyncBase {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Outcome of a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeReport {
    /// Number of blocks written to the base file.
    pub blocks: u64,
}

/// A validated merge that has not touched the base file yet.
///
/// [`prepare()`](Self::prepare) performs every check, including the
/// fingerprint comparison, so the caller can ask for confirmation before
/// calling [`apply()`](Self::apply).
pub struct MergePlan {
    overlay_path: PathBuf,
    base_path: PathBuf,
    overlay: File,
    base: File,
    header: CowHeader,
    bitmap: Bitmap,
}

impl std::fmt::Debug for MergePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergePlan")
            .field("overlay", &self.overlay_path)
            .field("base", &self.base_path)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl MergePlan {
    /// Opens both files and checks that `overlay` can be merged into `base`.
    pub fn prepare(overlay_path: &Path, base_path: &Path) -> Result<Self, MergeError> {
        let mut overlay = File::open(overlay_path).context(OpenOverlaySnafu {
            path: overlay_path,
        })?;

        let header = header::read_from(&mut overlay).context(LoadHeaderSnafu {
            path: overlay_path,
        })?;

        header.validate_for_merge().context(InvalidStateSnafu {
            path: overlay_path,
        })?;

        let bitmap = bitmap::load(&mut overlay, &header).context(LoadBitmapSnafu {
            path: overlay_path,
        })?;

        if let Some(block) = bitmap.last_set() {
            ensure!(
                block < header.rdoblocks(),
                BlockOutOfRangeSnafu {
                    path: overlay_path,
                    block,
                    rdoblocks: header.rdoblocks(),
                }
            );
        }

        // The base file is written in place.
        let mut base = OpenOptions::new()
            .read(true)
            .write(true)
            .open(base_path)
            .context(OpenBaseSnafu { path: base_path })?;

        let actual = fingerprint(&mut base, header.block_size())
            .context(ComputeFingerprintSnafu { path: base_path })?;

        ensure!(
            actual == header.rdofingerprint(),
            FingerprintMismatchSnafu {
                base: base_path,
                overlay: overlay_path,
                expected: header.rdofingerprint(),
                actual,
            }
        );

        // Works for block devices too, where metadata reports no length.
        let len = base
            .seek(SeekFrom::End(0))
            .context(OpenBaseSnafu { path: base_path })?;
        let required = header.rdoblocks() * header.mapunit();

        ensure!(
            len >= required,
            BaseTooSmallSnafu {
                path: base_path,
                len,
                required,
            }
        );

        tracing::debug!(
            overlay = %overlay_path.display(),
            base = %base_path.display(),
            fingerprint = format_args!("{actual:#010x}"),
            "merge prepared"
        );

        Ok(Self {
            overlay_path: overlay_path.to_path_buf(),
            base_path: base_path.to_path_buf(),
            overlay,
            base,
            header,
            bitmap,
        })
    }

    pub fn header(&self) -> &CowHeader {
        &self.header
    }

    /// Returns the number of blocks that will be written.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.bitmap.count_set_bits()
    }

    /// Writes every marked block into the base file, in ascending order.
    ///
    /// Runs of consecutive blocks are copied with as few calls as possible.
    /// An error leaves the base file partially updated.
    pub fn apply(mut self, progress: &dyn Progress) -> Result<MergeReport, MergeError> {
        let mapunit = self.header.mapunit();
        let chunk_blocks = (MAX_CHUNK / mapunit).max(1);
        let mut buf = vec![0u8; (chunk_blocks * mapunit) as usize];
        let mut merged = 0;

        progress.start(Operation::Merge, self.block_count());

        for (first, count) in self.bitmap.runs() {
            let mut block = first;
            let end = first + count;

            while block < end {
                let n = chunk_blocks.min(end - block);
                let len = (n * mapunit) as usize;

                self.overlay
                    .seek(SeekFrom::Start(self.header.block_offset(block)))
                    .and_then(|_| self.overlay.read_exact(&mut buf[..len]))
                    .context(ReadOverlaySnafu {
                        path: &self.overlay_path,
                        block,
                    })?;

                self.base
                    .seek(SeekFrom::Start(block * mapunit))
                    .and_then(|_| self.base.write_all(&buf[..len]))
                    .context(WriteBaseSnafu {
                        path: &self.base_path,
                        block,
                    })?;

                for done in block..block + n {
                    progress.block_done(done);
                }

                merged += n;
                block += n;
            }
        }

        self.base.sync_data().context(SyncBaseSnafu {
            path: &self.base_path,
        })?;

        progress.finish();

        tracing::info!(
            base = %self.base_path.display(),
            blocks = merged,
            "merge finished"
        );

        Ok(MergeReport { blocks: merged })
    }
}

/// Merges `overlay` into `base`.
///
/// Merging overwrites the base file in place, so the caller must pass
/// `confirmed = true` once the user has agreed. Nothing is written otherwise.
pub fn merge(
    overlay: &Path,
    base: &Path,
    confirmed: bool,
    progress: &dyn Progress,
) -> Result<MergeReport, MergeError> {
    let plan = MergePlan::prepare(overlay, base)?;

    ensure!(confirmed, NotConfirmedSnafu);

    plan.apply(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;
    use tempfile::{TempDir, tempdir};

    const MAPUNIT: u64 = 512;

    /// Base file of 8 blocks, block `b` filled with `b + 1`.
    fn base_data() -> Vec<u8> {
        (0..8u8).flat_map(|b| [b + 1; MAPUNIT as usize]).collect()
    }

    /// Writes a base file and a cowfile that rewrites `blocks` with `0xEE`.
    fn setup(blocks: &[u64]) -> (TempDir, PathBuf, PathBuf) {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        let overlay = dir.path().join("cow");
        let data = base_data();

        std::fs::write(&base, &data).unwrap();

        let fp = fingerprint(&mut data.as_slice(), MAPUNIT as usize).unwrap();
        let mut header = CowHeader::for_base(MAPUNIT, 8, fp).unwrap();
        header.set_cowused(blocks.len() as u64);

        let mut cow = vec![0u8; header.raw_len() as usize];
        cow[..header.as_bytes().len()].copy_from_slice(header.as_bytes());

        for &block in blocks {
            cow[MAPUNIT as usize] |= 1 << block;

            let offset = header.block_offset(block) as usize;
            cow[offset..offset + MAPUNIT as usize].fill(0xEE);
        }

        std::fs::write(&overlay, cow).unwrap();

        (dir, base, overlay)
    }

    #[test]
    fn writes_marked_blocks_only() {
        let (_dir, base, overlay) = setup(&[1, 2, 3, 6]);

        let report = merge(&overlay, &base, true, &SilentProgress).unwrap();
        assert_eq!(report.blocks, 4);

        let merged = std::fs::read(&base).unwrap();
        let original = base_data();

        for block in 0..8 {
            let range = (block * MAPUNIT) as usize..((block + 1) * MAPUNIT) as usize;

            if [1, 2, 3, 6].contains(&block) {
                assert!(merged[range].iter().all(|&b| b == 0xEE), "block {block}");
            } else {
                assert_eq!(merged[range.clone()], original[range], "block {block}");
            }
        }
    }

    #[test]
    fn unconfirmed_merge_writes_nothing() {
        let (_dir, base, overlay) = setup(&[0]);

        let err = merge(&overlay, &base, false, &SilentProgress).unwrap_err();

        assert!(matches!(err, MergeError::NotConfirmed));
        assert_eq!(std::fs::read(&base).unwrap(), base_data());
    }

    #[test]
    fn plan_reports_block_count() {
        let (_dir, base, overlay) = setup(&[4, 5]);

        let plan = MergePlan::prepare(&overlay, &base).unwrap();

        assert_eq!(plan.block_count(), 2);
        assert_eq!(plan.header().rdoblocks(), 8);
    }

    #[test]
    fn dirty_cowfile_is_rejected() {
        let (_dir, base, overlay) = setup(&[0]);

        let mut cow = std::fs::read(&overlay).unwrap();
        let mut header = CowHeader::from_bytes(&cow).unwrap();
        header.set_dirty(true);
        cow[..header.as_bytes().len()].copy_from_slice(header.as_bytes());
        std::fs::write(&overlay, cow).unwrap();

        let err = merge(&overlay, &base, true, &SilentProgress).unwrap_err();

        assert!(matches!(
            err,
            MergeError::InvalidState {
                source: StateError::Dirty,
                ..
            }
        ));
        assert_eq!(std::fs::read(&base).unwrap(), base_data());
    }

    #[test]
    fn short_base_is_rejected() {
        let (_dir, base, overlay) = setup(&[0]);

        // Same first blocks, so the fingerprint still matches.
        std::fs::write(&base, &base_data()[..6 * MAPUNIT as usize]).unwrap();

        let err = merge(&overlay, &base, true, &SilentProgress).unwrap_err();

        assert!(matches!(
            err,
            MergeError::BaseTooSmall {
                len: 3072,
                required: 4096,
                ..
            }
        ));
    }
}
