use std::io::{self, Read};

/// Reads until `buf` is full or the source is exhausted.
///
/// Returns the number of bytes read. A short count means end of file.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;

    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most three bytes per call.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.0.len()).min(3);

            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];

            Ok(n)
        }
    }

    #[test]
    fn fills_across_short_reads() {
        let mut buf = [0u8; 8];

        assert_eq!(read_full(&mut Trickle(b"0123456789"), &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"01234567");
    }

    #[test]
    fn reports_short_count_at_eof() {
        let mut buf = [0u8; 8];

        assert_eq!(read_full(&mut Trickle(b"abc12"), &mut buf).unwrap(), 5);
    }
}
