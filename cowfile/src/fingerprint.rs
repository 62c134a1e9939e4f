//! Weak content signature binding a cowfile to its base file.
//!
//! The fingerprint is the byte-wise sum (mod 256) of the first four blocks
//! whose sum is non-zero, packed into a `u32` with the first such block in the
//! lowest byte. It only detects gross mismatches: different fingerprints prove
//! the files differ, equal ones merely suggest the same base file.

use crate::io::read_full;
use std::io::{self, Read};

/// Number of non-trivial block sums folded into a fingerprint.
const SUMS: u32 = 4;

/// Computes the fingerprint of the data read from `reader`.
///
/// Reading stops after four non-zero block sums or at end of input. A final
/// partial block is ignored.
pub fn fingerprint<R: Read>(reader: &mut R, mapunit: usize) -> io::Result<u32> {
    let mut block = vec![0u8; mapunit];
    let mut fingerprint = 0u32;
    let mut found = 0;

    while found < SUMS {
        if read_full(reader, &mut block)? < mapunit {
            break;
        }

        let sum = block.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));

        // Probably zeroes, which says nothing about the file.
        if sum == 0 {
            continue;
        }

        fingerprint |= u32::from(sum) << (found * 8);
        found += 1;
    }

    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocks(sums: &[u8], size: usize) -> Vec<u8> {
        let mut data = vec![0u8; sums.len() * size];

        for (i, &sum) in sums.iter().enumerate() {
            data[i * size] = sum;
        }

        data
    }

    #[test]
    fn packs_first_four_sums() {
        let data = blocks(&[0x11, 0, 0x22, 0x33, 0, 0x44, 0x55], 512);

        assert_eq!(fingerprint(&mut data.as_slice(), 512).unwrap(), 0x4433_2211);
    }

    #[test]
    fn sums_wrap_around() {
        let mut data = vec![0u8; 512];
        data[0] = 0xFF;
        data[1] = 0x02;

        assert_eq!(fingerprint(&mut data.as_slice(), 512).unwrap(), 0x01);

        // 0x80 + 0x80 wraps to zero and is skipped.
        data[0] = 0x80;
        data[1] = 0x80;

        assert_eq!(fingerprint(&mut data.as_slice(), 512).unwrap(), 0);
    }

    #[test]
    fn short_input_leaves_high_bytes_clear() {
        let mut data = blocks(&[0x07, 0x09], 512);
        data.extend_from_slice(&[0xAA; 100]);

        assert_eq!(fingerprint(&mut data.as_slice(), 512).unwrap(), 0x0907);
    }

    #[test]
    fn is_order_sensitive() {
        let a = blocks(&[1, 2, 3, 4], 1024);
        let b = blocks(&[2, 1, 3, 4], 1024);

        assert_ne!(
            fingerprint(&mut a.as_slice(), 1024).unwrap(),
            fingerprint(&mut b.as_slice(), 1024).unwrap()
        );
        assert_eq!(
            fingerprint(&mut a.as_slice(), 1024).unwrap(),
            fingerprint(&mut a.clone().as_slice(), 1024).unwrap()
        );
    }
}
