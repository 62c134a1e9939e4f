//! File abstraction layer used by pack and unpack.
//!
//! [`open()`] hands out a [`FalFile`] that is either a raw file with a
//! write-coalescing buffer or a gzip stream. Both are driven through the same
//! calls so the copy loop does not care which side is compressed.
//!
//! Every failure comes back as a [`FalError`] that records whether the OS or
//! the codec reported it.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use snafu::{ResultExt, Snafu};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Buffer size used when the filesystem does not report one.
const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Errors from the file abstraction layer.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum FalError {
    #[snafu(display("{op} failed"))]
    Os {
        op: &'static str,
        source: io::Error,
    },

    #[snafu(display("compressed stream {op} failed"))]
    Codec {
        op: &'static str,
        source: io::Error,
    },

    #[snafu(display("compressed stream at {position} cannot seek to {target:?}"))]
    UnsupportedSeek { position: u64, target: SeekFrom },
}

impl FalError {
    /// Returns `true` if the error was reported by the compression codec.
    #[must_use]
    pub fn is_codec(&self) -> bool {
        matches!(self, Self::Codec { .. } | Self::UnsupportedSeek { .. })
    }
}

/// How a file is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Read,
    /// Creates or truncates the file.
    Write,
}

/// Uniform sequential access to a raw or compressed file.
pub trait FalFile: std::fmt::Debug {
    /// Reads exactly `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), FalError>;

    /// Writes all of `buf`.
    fn write(&mut self, buf: &[u8]) -> Result<(), FalError>;

    /// Moves the logical position and returns the new one.
    ///
    /// Compressed files only move forward. Skipped bytes are discarded when
    /// reading and written as zeroes when writing.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, FalError>;

    /// Pushes pending data to the backing store.
    fn flush(&mut self) -> Result<(), FalError>;

    /// Flushes and releases the file.
    fn close(self: Box<Self>) -> Result<(), FalError>;

    /// Returns the logical position.
    fn position(&self) -> u64;

    fn is_compressed(&self) -> bool;
}

/// Opens `path` as a raw or compressed file.
pub fn open(path: &Path, mode: Mode, compressed: bool) -> Result<Box<dyn FalFile>, FalError> {
    let file = open_file(path, mode).context(OsSnafu { op: "open" })?;

    tracing::debug!(path = %path.display(), ?mode, compressed, "opening file");

    if compressed {
        Ok(Box::new(CompressedFile::new(file, mode)))
    } else {
        Ok(Box::new(RawFile::new(file, mode).context(OsSnafu { op: "stat" })?))
    }
}

fn open_file(path: &Path, mode: Mode) -> io::Result<File> {
    let mut opts = OpenOptions::new();

    match mode {
        Mode::Read => {
            opts.read(true);
        }
        Mode::Write => {
            opts.write(true).create(true).truncate(true);

            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
        }
    }

    opts.open(path)
}

fn preferred_block_size(file: &File) -> io::Result<usize> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        match file.metadata()?.blksize() {
            0 => Ok(DEFAULT_BLOCK_SIZE),
            n => Ok(n as usize),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(DEFAULT_BLOCK_SIZE)
    }
}

/// Raw file with a write buffer sized to the preferred I/O block size.
///
/// Writes collect in the buffer and go out as one call when the next write
/// would not fit, before any seek, on flush and on close.
pub struct RawFile {
    file: File,
    pending: Vec<u8>,
    capacity: usize,
    position: u64,
}

impl std::fmt::Debug for RawFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFile")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending.len())
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl RawFile {
    fn new(file: File, mode: Mode) -> io::Result<Self> {
        let capacity = match mode {
            Mode::Read => 0,
            Mode::Write => preferred_block_size(&file)?,
        };

        Ok(Self {
            file,
            pending: Vec::with_capacity(capacity),
            capacity,
            position: 0,
        })
    }

    fn write_pending(&mut self) -> Result<(), FalError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let result = self.file.write_all(&self.pending);
        self.pending.clear();

        result.context(OsSnafu { op: "write" })
    }
}

impl FalFile for RawFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), FalError> {
        debug_assert!(self.pending.is_empty());

        self.file.read_exact(buf).context(OsSnafu { op: "read" })?;
        self.position += buf.len() as u64;

        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), FalError> {
        if self.pending.len() + buf.len() > self.capacity {
            self.write_pending()?;
        }

        if buf.len() >= self.capacity {
            self.file.write_all(buf).context(OsSnafu { op: "write" })?;
        } else {
            self.pending.extend_from_slice(buf);
        }

        self.position += buf.len() as u64;

        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, FalError> {
        self.write_pending()?;
        self.position = self.file.seek(pos).context(OsSnafu { op: "seek" })?;

        Ok(self.position)
    }

    fn flush(&mut self) -> Result<(), FalError> {
        self.write_pending()?;
        self.file.sync_data().context(OsSnafu { op: "sync" })
    }

    fn close(mut self: Box<Self>) -> Result<(), FalError> {
        self.write_pending()
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_compressed(&self) -> bool {
        false
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        if let Err(e) = self.write_pending() {
            tracing::warn!(error = %e, "cannot write buffered data on drop");
        }
    }
}

enum Codec {
    Reader(GzDecoder<File>),
    Writer(GzEncoder<File>),
}

/// Gzip stream opened for either reading or writing.
pub struct CompressedFile {
    codec: Codec,
    position: u64,
}

impl std::fmt::Debug for CompressedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.codec {
            Codec::Reader(_) => Mode::Read,
            Codec::Writer(_) => Mode::Write,
        };

        f.debug_struct("CompressedFile")
            .field("mode", &mode)
            .field("position", &self.position)
            .finish()
    }
}

impl CompressedFile {
    fn new(file: File, mode: Mode) -> Self {
        let codec = match mode {
            Mode::Read => Codec::Reader(GzDecoder::new(file)),
            Mode::Write => Codec::Writer(GzEncoder::new(file, Compression::best())),
        };

        Self { codec, position: 0 }
    }
}

/// Tells OS failures apart from malformed or truncated compressed data.
fn codec_error(op: &'static str, source: io::Error) -> FalError {
    if source.raw_os_error().is_some() {
        FalError::Os { op, source }
    } else {
        FalError::Codec { op, source }
    }
}

impl FalFile for CompressedFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<(), FalError> {
        let Codec::Reader(reader) = &mut self.codec else {
            return Err(FalError::Codec {
                op: "read",
                source: io::ErrorKind::Unsupported.into(),
            });
        };

        reader.read_exact(buf).map_err(|e| codec_error("read", e))?;
        self.position += buf.len() as u64;

        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), FalError> {
        let Codec::Writer(writer) = &mut self.codec else {
            return Err(FalError::Codec {
                op: "write",
                source: io::ErrorKind::Unsupported.into(),
            });
        };

        writer.write_all(buf).map_err(|e| codec_error("write", e))?;
        self.position += buf.len() as u64;

        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, FalError> {
        let position = self.position;
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => position.checked_add_signed(delta),
            SeekFrom::End(_) => None,
        };

        let Some(target) = target.filter(|&t| t >= position) else {
            return UnsupportedSeekSnafu {
                position,
                target: pos,
            }
            .fail();
        };

        let gap = target - position;

        if gap == 0 {
            return Ok(position);
        }

        let moved = match &mut self.codec {
            Codec::Reader(reader) => io::copy(&mut Read::by_ref(reader).take(gap), &mut io::sink()),
            Codec::Writer(writer) => io::copy(&mut io::repeat(0).take(gap), writer),
        }
        .map_err(|e| codec_error("seek", e))?;

        self.position += moved;

        if moved < gap {
            return Err(FalError::Codec {
                op: "seek",
                source: io::ErrorKind::UnexpectedEof.into(),
            });
        }

        Ok(self.position)
    }

    fn flush(&mut self) -> Result<(), FalError> {
        match &mut self.codec {
            Codec::Reader(_) => Ok(()),
            Codec::Writer(writer) => writer.flush().map_err(|e| codec_error("flush", e)),
        }
    }

    fn close(self: Box<Self>) -> Result<(), FalError> {
        match self.codec {
            Codec::Reader(_) => Ok(()),
            Codec::Writer(writer) => {
                let file = writer.finish().map_err(|e| codec_error("close", e))?;
                file.sync_data().context(OsSnafu { op: "sync" })
            }
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_compressed(&self) -> bool {
        true
    }
}
