#![allow(dead_code)]

use cowfile::CowHeader;
use std::path::Path;

/// Content written to slot `block` when it is marked.
pub fn block_byte(block: u64) -> u8 {
    (block % 251) as u8 + 1
}

/// Describes a raw cowfile to write for a test.
pub struct RawCowfile {
    pub mapunit: u64,
    pub mapsize: u64,
    pub rdoblocks: u64,
    pub fingerprint: u32,
    pub dirty: bool,
    /// Blocks marked in the bitmap, filled with [`block_byte()`].
    pub marked: Vec<u64>,
    /// Blocks filled with data but left unmarked.
    pub unmarked: Vec<u64>,
}

impl RawCowfile {
    pub fn new(mapunit: u64, mapsize: u64, rdoblocks: u64) -> Self {
        Self {
            mapunit,
            mapsize,
            rdoblocks,
            fingerprint: 0,
            dirty: false,
            marked: Vec::new(),
            unmarked: Vec::new(),
        }
    }

    pub fn marked(mut self, blocks: &[u64]) -> Self {
        self.marked = blocks.to_vec();
        self
    }

    pub fn unmarked(mut self, blocks: &[u64]) -> Self {
        self.unmarked = blocks.to_vec();
        self
    }

    pub fn dirty(mut self) -> Self {
        self.dirty = true;
        self
    }

    pub fn fingerprint(mut self, fingerprint: u32) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn write(&self, path: &Path) -> CowHeader {
        let mut header =
            CowHeader::new(self.mapunit, self.mapsize, self.rdoblocks, self.fingerprint).unwrap();
        header.set_dirty(self.dirty);
        header.set_cowused(self.marked.len() as u64);

        let mapunit = self.mapunit as usize;
        let mut data = vec![0u8; header.raw_len() as usize];
        data[..header.as_bytes().len()].copy_from_slice(header.as_bytes());

        for &block in &self.marked {
            data[mapunit + (block / 8) as usize] |= 1 << (block % 8);

            let offset = header.block_offset(block) as usize;
            data[offset..offset + mapunit].fill(block_byte(block));
        }

        for &block in &self.unmarked {
            let offset = header.block_offset(block) as usize;
            data[offset..offset + mapunit].fill(0xA5);
        }

        std::fs::write(path, data).unwrap();
        header
    }
}

/// Returns the contents of slot `block` in a raw cowfile.
pub fn slot<'a>(data: &'a [u8], header: &CowHeader, block: u64) -> &'a [u8] {
    let offset = header.block_offset(block) as usize;
    &data[offset..offset + header.block_size()]
}

/// Returns the bitmap bytes of a raw or uncompressed packed cowfile.
pub fn bitmap<'a>(data: &'a [u8], header: &CowHeader) -> &'a [u8] {
    let start = header.bitmap_offset() as usize;
    &data[start..start + header.mapsize() as usize]
}
