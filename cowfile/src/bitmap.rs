use crate::header::CowHeader;
use snafu::Snafu;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Error when the bitmap cannot be allocated.
#[derive(Debug, Snafu)]
#[snafu(display("cannot allocate {len} bytes for the bitmap"))]
pub struct AllocError {
    len: u64,
}

/// In-memory copy of the cowfile bitmap.
///
/// Bit `b` of byte `i` (least significant bit first) stands for block
/// `i * 8 + b`. A set bit means the data region holds the authoritative copy
/// of that block.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.bytes.len())
            .field("set", &self.count_set_bits())
            .finish()
    }
}

impl Bitmap {
    /// Allocates an all-clear bitmap of `len` bytes.
    pub fn zeroed(len: u64) -> Result<Self, AllocError> {
        let size = usize::try_from(len).map_err(|_| AllocSnafu { len }.build())?;
        let mut bytes = Vec::new();

        bytes
            .try_reserve_exact(size)
            .map_err(|_| AllocSnafu { len }.build())?;
        bytes.resize(size, 0);

        Ok(Self { bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Returns the number of blocks the bitmap can describe.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.bytes.len() as u64 * 8
    }

    #[must_use]
    pub fn is_set(&self, block: u64) -> bool {
        let (byte, bit) = position(block);

        self.bytes
            .get(byte)
            .is_some_and(|&value| value & (1 << bit) != 0)
    }

    /// Sets the bit for `block`, returning `true` if it was clear before.
    ///
    /// # Panics
    ///
    /// Panics if `block` is outside [`capacity()`](Self::capacity).
    pub fn set(&mut self, block: u64) -> bool {
        let (byte, bit) = position(block);
        let value = &mut self.bytes[byte];
        let was_clear = *value & (1 << bit) == 0;

        *value |= 1 << bit;

        was_clear
    }

    /// Counts the set bits, which is the true value of `cowused`.
    #[must_use]
    pub fn count_set_bits(&self) -> u64 {
        self.bytes.iter().map(|b| u64::from(b.count_ones())).sum()
    }

    /// Returns the highest set block number, if any.
    #[must_use]
    pub fn last_set(&self) -> Option<u64> {
        let (index, &byte) = self.bytes.iter().enumerate().rev().find(|(_, b)| **b != 0)?;

        Some(index as u64 * 8 + u64::from(7 - byte.leading_zeros()))
    }

    /// Iterates over set block numbers in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        self.bytes
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte != 0)
            .flat_map(|(index, &byte)| {
                (0..8u64)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| index as u64 * 8 + bit)
            })
    }

    /// Iterates over runs of consecutive set blocks as `(first, count)`.
    pub fn runs(&self) -> Runs<'_> {
        Runs {
            inner: Box::new(self.iter_set()),
            pending: None,
        }
    }
}

/// Iterator returned by [`Bitmap::runs()`].
pub struct Runs<'a> {
    inner: Box<dyn Iterator<Item = u64> + 'a>,
    pending: Option<u64>,
}

impl Iterator for Runs<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.pending.take().or_else(|| self.inner.next())?;
        let mut count = 1;

        for block in self.inner.by_ref() {
            if block == first + count {
                count += 1;
            } else {
                self.pending = Some(block);
                break;
            }
        }

        Some((first, count))
    }
}

fn position(block: u64) -> (usize, u32) {
    ((block / 8) as usize, (block % 8) as u32)
}

/// Reads the whole bitmap of `header` from `file`.
pub fn load<F: Read + Seek>(file: &mut F, header: &CowHeader) -> Result<Bitmap, LoadError> {
    let mut bitmap = Bitmap::zeroed(header.mapsize())?;

    file.seek(SeekFrom::Start(header.bitmap_offset()))
        .and_then(|_| file.read_exact(bitmap.as_mut_bytes()))
        .map_err(|e| LoadError::Read { source: e })?;

    Ok(bitmap)
}

/// Writes `bitmap` back to its fixed offset.
pub fn store<F: Write + Seek>(file: &mut F, header: &CowHeader, bitmap: &Bitmap) -> io::Result<()> {
    debug_assert_eq!(bitmap.as_bytes().len() as u64, header.mapsize());

    file.seek(SeekFrom::Start(header.bitmap_offset()))?;
    file.write_all(bitmap.as_bytes())
}

/// Errors when loading a bitmap.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum LoadError {
    #[snafu(transparent)]
    Allocate { source: AllocError },

    #[snafu(display("cannot read bitmap"))]
    Read { source: io::Error },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn bitmap_with(blocks: &[u64], len: u64) -> Bitmap {
        let mut bitmap = Bitmap::zeroed(len).unwrap();

        for &block in blocks {
            bitmap.set(block);
        }

        bitmap
    }

    #[test]
    fn bits_are_lsb_first() {
        let bitmap = bitmap_with(&[0, 9, 15], 2);

        assert_eq!(bitmap.as_bytes(), &[0b0000_0001, 0b1000_0010]);
        assert!(bitmap.is_set(9));
        assert!(!bitmap.is_set(8));
        assert!(!bitmap.is_set(1000));
    }

    #[test]
    fn set_reports_previous_state() {
        let mut bitmap = Bitmap::zeroed(1).unwrap();
        assert_eq!(bitmap.capacity(), 8);

        assert!(bitmap.set(5));
        assert!(!bitmap.set(5));
        assert_eq!(bitmap.count_set_bits(), 1);
    }

    #[test]
    fn iterates_in_ascending_order() {
        let blocks = [0, 1, 2, 50, 127];
        let bitmap = bitmap_with(&blocks, 16);

        assert_eq!(bitmap.iter_set().collect::<Vec<_>>(), blocks);
        assert_eq!(bitmap.count_set_bits(), 5);
        assert_eq!(bitmap.last_set(), Some(127));
        assert_eq!(Bitmap::zeroed(16).unwrap().last_set(), None);
    }

    #[test]
    fn groups_runs() {
        let bitmap = bitmap_with(&[0, 1, 2, 7, 8, 9, 10, 50, 127], 16);

        assert_eq!(
            bitmap.runs().collect::<Vec<_>>(),
            [(0, 3), (7, 4), (50, 1), (127, 1)]
        );
    }

    #[test]
    fn load_and_store_use_bitmap_offset() {
        let header = CowHeader::new(512, 4, 32, 0).unwrap();
        let mut file = Cursor::new(vec![0u8; header.doffset() as usize]);
        let bitmap = bitmap_with(&[3, 31], 4);

        store(&mut file, &header, &bitmap).unwrap();

        assert_eq!(file.get_ref()[512], 0b0000_1000);
        assert_eq!(file.get_ref()[515], 0b1000_0000);
        assert_eq!(load(&mut file, &header).unwrap(), bitmap);
    }

    #[test]
    fn load_fails_on_truncated_file() {
        let header = CowHeader::new(512, 4, 32, 0).unwrap();
        let mut file = Cursor::new(vec![0u8; 514]);

        assert!(matches!(
            load(&mut file, &header),
            Err(LoadError::Read { .. })
        ));
    }
}
