use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use std::fmt::{Display, Formatter};
use std::io::{self, Read};

use snafu::{ResultExt, Snafu, ensure};

/// Errors when parsing a cowfile header from bytes.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("source buffer is too short to read the header"))]
    TooSmall,

    #[snafu(display("not a valid cowfile (wrong magic {magic:#010x})"))]
    InvalidMagic { magic: u32 },

    #[snafu(display("cowfile version {version} not supported"))]
    UnsupportedVersion { version: u16 },

    #[snafu(display("invalid mapunit {mapunit}"))]
    InvalidMapUnit { mapunit: u64 },

    #[snafu(display("bitmap of {mapsize} bytes exceeds the maximum of {MAX_MAPSIZE} bytes"))]
    BitmapTooLarge { mapsize: u64 },

    #[snafu(display("bitmap of {mapsize} bytes cannot cover {rdoblocks} blocks"))]
    BitmapTooSmall { mapsize: u64, rdoblocks: u64 },

    #[snafu(display("data offset {doffset} is outside {min}..={max}"))]
    InvalidDataOffset { doffset: u64, min: u64, max: u64 },
}

/// Errors when the header flags forbid an operation.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum StateError {
    #[snafu(display("cowfile is packed (unpack needed)"))]
    Packed,

    #[snafu(display("cowfile is not packed"))]
    NotPacked,

    #[snafu(display("cowfile is dirty (repair needed)"))]
    Dirty,

    #[snafu(display("cowfile is not dirty"))]
    NotDirty,
}

/// Errors when loading a header from a file.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LoadError {
    #[snafu(display("cannot read header"))]
    ReadHeaderFailed { source: io::Error },

    #[snafu(transparent)]
    Parse { source: ReadError },
}

use zerocopy::byteorder::little_endian::{U16, U32, U64};

/// Magic number at offset 0 of every cowfile.
pub const MAGIC: u32 = 0x574F_4C44;

/// The only header layout this crate reads and writes.
pub const VERSION: u16 = 1;

/// The size of the header on disk. The rest of the first mapunit is unused.
pub const HEADER_SIZE: usize = size_of::<CowHeaderRaw>();

pub const MIN_MAPUNIT: u64 = 512;
pub const MAX_MAPUNIT: u64 = 1 << 20;

/// Upper bound for the bitmap (8 Gi blocks).
pub const MAX_MAPSIZE: u64 = 1 << 30;

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct CowHeaderRaw {
    magic: U32,          // 0x00
    version: U16,        // 0x04
    flags: U16,          // 0x06
    mapunit: U64,        // 0x08 - block size
    mapsize: U64,        // 0x10 - bitmap size in bytes
    doffset: U64,        // 0x18 - start of the data region
    rdoblocks: U64,      // 0x20 - blocks in the base file
    cowused: U64,        // 0x28 - bits set in the bitmap
    rdofingerprint: U32, // 0x30
    reserved: U32,       // 0x34
}

bitflags::bitflags! {
    /// State flags stored in the header.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u16 {
        /// The bitmap may not reflect the data region (unclean shutdown).
        const DIRTY = 0x0001;
        /// The file is in the compact representation.
        const PACKED = 0x0002;
    }
}

impl Display for HeaderFlags {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        if self.contains(Self::DIRTY) {
            f.write_str("dirty")?;
        } else {
            f.write_str("clean")?;
        }

        if self.contains(Self::PACKED) {
            f.write_str(" packed")?;
        }

        Ok(())
    }
}

/// Parsed cowfile header.
///
/// The header lives at offset 0, the bitmap at offset `mapunit` and the data
/// region at `doffset`. Geometry fields are bounds-checked when the header is
/// parsed, so offsets derived from them never overflow and allocations sized
/// by them stay sane.
#[derive(Clone, Copy)]
#[must_use]
pub struct CowHeader {
    raw: CowHeaderRaw,
}

impl std::fmt::Debug for CowHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CowHeader")
            .field("version", &self.version())
            .field("flags", &self.flags())
            .field("mapunit", &self.mapunit())
            .field("mapsize", &self.mapsize())
            .field("doffset", &self.doffset())
            .field("rdoblocks", &self.rdoblocks())
            .field("cowused", &self.cowused())
            .field("rdofingerprint", &format_args!("{:#010x}", self.rdofingerprint()))
            .finish()
    }
}

impl CowHeader {
    /// Builds a clean header for a new cowfile.
    ///
    /// The bitmap is rounded up to whole mapunits and the data region follows
    /// it directly.
    pub fn new(
        mapunit: u64,
        mapsize: u64,
        rdoblocks: u64,
        rdofingerprint: u32,
    ) -> Result<Self, ReadError> {
        ensure!(valid_mapunit(mapunit), InvalidMapUnitSnafu { mapunit });
        ensure!(mapsize <= MAX_MAPSIZE, BitmapTooLargeSnafu { mapsize });

        let doffset = mapunit + mapsize.div_ceil(mapunit) * mapunit;

        let raw = CowHeaderRaw {
            magic: U32::new(MAGIC),
            version: U16::new(VERSION),
            flags: U16::new(0),
            mapunit: U64::new(mapunit),
            mapsize: U64::new(mapsize),
            doffset: U64::new(doffset),
            rdoblocks: U64::new(rdoblocks),
            cowused: U64::new(0),
            rdofingerprint: U32::new(rdofingerprint),
            reserved: U32::new(0),
        };

        check_geometry(&raw)?;

        Ok(Self { raw })
    }

    /// Builds a clean header sized for a base file of `rdoblocks` blocks.
    pub fn for_base(mapunit: u64, rdoblocks: u64, rdofingerprint: u32) -> Result<Self, ReadError> {
        Self::new(mapunit, rdoblocks.div_ceil(8), rdoblocks, rdofingerprint)
    }

    /// Parses the header from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ReadError> {
        let (raw, _) =
            CowHeaderRaw::read_from_prefix(data).map_err(|_| TooSmallSnafu.build())?;

        let magic = raw.magic.get();
        ensure!(magic == MAGIC, InvalidMagicSnafu { magic });

        let version = raw.version.get();
        ensure!(version == VERSION, UnsupportedVersionSnafu { version });

        check_geometry(&raw)?;

        Ok(Self { raw })
    }

    /// Returns the on-disk representation.
    pub fn as_bytes(&self) -> &[u8] {
        self.raw.as_bytes()
    }

    #[must_use]
    pub fn version(&self) -> u16 {
        self.raw.version.get()
    }

    /// Unknown bits are retained so a rewrite never clears them.
    #[must_use]
    pub fn flags(&self) -> HeaderFlags {
        HeaderFlags::from_bits_retain(self.raw.flags.get())
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(HeaderFlags::DIRTY)
    }

    #[must_use]
    pub fn is_packed(&self) -> bool {
        self.flags().contains(HeaderFlags::PACKED)
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.set_flag(HeaderFlags::DIRTY, dirty);
    }

    pub fn set_packed(&mut self, packed: bool) {
        self.set_flag(HeaderFlags::PACKED, packed);
    }

    fn set_flag(&mut self, flag: HeaderFlags, value: bool) {
        let mut flags = self.flags();
        flags.set(flag, value);
        self.raw.flags.set(flags.bits());
    }

    /// Block size in bytes.
    #[must_use]
    pub fn mapunit(&self) -> u64 {
        self.raw.mapunit.get()
    }

    /// Block size as a buffer length.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.mapunit() as usize
    }

    /// Bitmap size in bytes.
    #[must_use]
    pub fn mapsize(&self) -> u64 {
        self.raw.mapsize.get()
    }

    /// Offset of the bitmap, which always starts at the second mapunit.
    #[must_use]
    pub fn bitmap_offset(&self) -> u64 {
        self.mapunit()
    }

    #[must_use]
    pub fn doffset(&self) -> u64 {
        self.raw.doffset.get()
    }

    #[must_use]
    pub fn rdoblocks(&self) -> u64 {
        self.raw.rdoblocks.get()
    }

    #[must_use]
    pub fn cowused(&self) -> u64 {
        self.raw.cowused.get()
    }

    pub fn set_cowused(&mut self, cowused: u64) {
        self.raw.cowused.set(cowused);
    }

    #[must_use]
    pub fn rdofingerprint(&self) -> u32 {
        self.raw.rdofingerprint.get()
    }

    /// Gets the offset of `block` in the raw data region.
    #[must_use]
    pub fn block_offset(&self, block: u64) -> u64 {
        self.doffset() + block * self.mapunit()
    }

    /// Gets the size of the fully populated raw layout.
    #[must_use]
    pub fn raw_len(&self) -> u64 {
        self.block_offset(self.rdoblocks())
    }

    /// Gets the size of an uncompressed packed file holding `blocks` blocks.
    #[must_use]
    pub fn packed_len(&self, blocks: u64) -> u64 {
        self.block_offset(blocks)
    }

    /// Repair only makes sense after an unclean shutdown unless forced.
    pub fn validate_for_repair(&self, force: bool) -> Result<(), StateError> {
        ensure!(!self.is_packed(), PackedSnafu);
        ensure!(force || self.is_dirty(), NotDirtySnafu);

        Ok(())
    }

    pub fn validate_for_merge(&self) -> Result<(), StateError> {
        ensure!(!self.is_packed(), PackedSnafu);
        ensure!(!self.is_dirty(), DirtySnafu);

        Ok(())
    }

    pub fn validate_for_pack(&self) -> Result<(), StateError> {
        ensure!(!self.is_dirty(), DirtySnafu);
        ensure!(!self.is_packed(), PackedSnafu);

        Ok(())
    }

    pub fn validate_for_unpack(&self) -> Result<(), StateError> {
        ensure!(!self.is_dirty(), DirtySnafu);
        ensure!(self.is_packed(), NotPackedSnafu);

        Ok(())
    }
}

/// Reads and parses the header from the current position of `reader`.
pub fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<CowHeader, LoadError> {
    let mut buf = [0u8; HEADER_SIZE];

    reader.read_exact(&mut buf).context(ReadHeaderFailedSnafu)?;

    Ok(CowHeader::from_bytes(&buf)?)
}

fn valid_mapunit(mapunit: u64) -> bool {
    mapunit.is_power_of_two() && (MIN_MAPUNIT..=MAX_MAPUNIT).contains(&mapunit)
}

fn check_geometry(raw: &CowHeaderRaw) -> Result<(), ReadError> {
    let mapunit = raw.mapunit.get();
    let mapsize = raw.mapsize.get();
    let doffset = raw.doffset.get();
    let rdoblocks = raw.rdoblocks.get();

    ensure!(valid_mapunit(mapunit), InvalidMapUnitSnafu { mapunit });
    ensure!(mapsize <= MAX_MAPSIZE, BitmapTooLargeSnafu { mapsize });
    ensure!(
        mapsize * 8 >= rdoblocks,
        BitmapTooSmallSnafu { mapsize, rdoblocks }
    );

    // At most one maximum-size mapunit of padding after the bitmap. With the bounds
    // above this keeps every data offset well inside i64 for relative seeks.
    let min = mapunit + mapsize;
    let max = mapunit + mapsize.next_multiple_of(mapunit) + MAX_MAPUNIT;

    ensure!(
        (min..=max).contains(&doffset),
        InvalidDataOffsetSnafu { doffset, min, max }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> CowHeader {
        CowHeader::new(4096, 16, 128, 0x1234_5678).unwrap()
    }

    #[test]
    fn layout_is_fixed() {
        assert_eq!(HEADER_SIZE, 56);

        let bytes = header().as_bytes().to_vec();

        assert_eq!(&bytes[..4], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[0x30..0x34], &0x1234_5678u32.to_le_bytes());
    }

    #[test]
    fn new_places_data_after_bitmap() {
        let h = header();

        assert_eq!(h.bitmap_offset(), 4096);
        assert_eq!(h.doffset(), 8192);
        assert_eq!(h.block_offset(2), 8192 + 2 * 4096);
        assert_eq!(h.raw_len(), 8192 + 128 * 4096);

        let h = CowHeader::for_base(1024, 10_000, 0).unwrap();

        assert_eq!(h.mapsize(), 1250);
        assert_eq!(h.doffset(), 1024 + 2048);
    }

    #[test]
    fn parse_accepts_written_header() {
        let mut h = header();
        h.set_dirty(true);
        h.set_cowused(5);

        let parsed = CowHeader::from_bytes(h.as_bytes()).unwrap();

        assert!(parsed.is_dirty());
        assert!(!parsed.is_packed());
        assert_eq!(parsed.cowused(), 5);
        assert_eq!(parsed.rdofingerprint(), 0x1234_5678);
    }

    #[test]
    fn parse_rejects_bad_magic_and_version() {
        let mut bytes = header().as_bytes().to_vec();
        bytes[0] ^= 0xFF;

        assert!(matches!(
            CowHeader::from_bytes(&bytes),
            Err(ReadError::InvalidMagic { .. })
        ));

        let mut bytes = header().as_bytes().to_vec();
        bytes[4] = 7;

        assert!(matches!(
            CowHeader::from_bytes(&bytes),
            Err(ReadError::UnsupportedVersion { version: 7 })
        ));

        assert!(matches!(
            CowHeader::from_bytes(&bytes[..10]),
            Err(ReadError::TooSmall)
        ));
    }

    #[test]
    fn parse_rejects_insane_geometry() {
        let good = header();

        let patch = |offset: usize, value: u64| {
            let mut bytes = good.as_bytes().to_vec();
            bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            CowHeader::from_bytes(&bytes)
        };

        assert!(matches!(patch(0x08, 3000), Err(ReadError::InvalidMapUnit { .. })));
        assert!(matches!(patch(0x08, 256), Err(ReadError::InvalidMapUnit { .. })));
        assert!(matches!(
            patch(0x10, u64::MAX),
            Err(ReadError::BitmapTooLarge { .. })
        ));
        assert!(matches!(
            patch(0x20, 129),
            Err(ReadError::BitmapTooSmall { .. })
        ));
        assert!(matches!(
            patch(0x18, 4096),
            Err(ReadError::InvalidDataOffset { .. })
        ));
        assert!(matches!(
            patch(0x18, 64 << 20),
            Err(ReadError::InvalidDataOffset {
                min: 4112,
                max: 1_056_768,
                ..
            })
        ));
        assert!(matches!(
            patch(0x18, u64::MAX - 10),
            Err(ReadError::InvalidDataOffset { .. })
        ));
        assert!(patch(0x18, 8192 + (1 << 20)).is_ok());
    }

    #[test]
    fn flag_checks_do_not_mutate() {
        let mut h = header();
        h.set_dirty(true);
        h.set_packed(true);

        // Unknown bits survive flag updates.
        h.raw.flags.set(h.raw.flags.get() | 0x0100);

        assert!(h.validate_for_merge().is_err());
        assert!(h.validate_for_pack().is_err());
        assert!(h.validate_for_repair(true).is_err());

        assert!(h.is_dirty());
        assert!(h.is_packed());

        h.set_dirty(false);
        assert!(h.validate_for_unpack().is_ok());
        assert_eq!(h.flags().bits(), 0x0102);
    }

    #[test]
    fn repair_requires_dirty_unless_forced() {
        let mut h = header();

        assert!(matches!(
            h.validate_for_repair(false),
            Err(StateError::NotDirty)
        ));
        assert!(h.validate_for_repair(true).is_ok());

        h.set_dirty(true);
        assert!(h.validate_for_repair(false).is_ok());
        assert!(matches!(h.validate_for_merge(), Err(StateError::Dirty)));
        assert!(matches!(h.validate_for_unpack(), Err(StateError::Dirty)));
    }

    #[test]
    fn read_from_reports_short_file() {
        let bytes = header().as_bytes().to_vec();

        assert!(read_from(&mut bytes.as_slice()).is_ok());
        assert!(matches!(
            read_from(&mut &bytes[..20]),
            Err(LoadError::ReadHeaderFailed { .. })
        ));
    }

    #[test]
    fn flags_display() {
        assert_eq!(HeaderFlags::empty().to_string(), "clean");
        assert_eq!(
            (HeaderFlags::DIRTY | HeaderFlags::PACKED).to_string(),
            "dirty packed"
        );
    }
}
