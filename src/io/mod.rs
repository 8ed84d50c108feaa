mod local;
mod memory;

pub use local::LocalSource;
pub use memory::MemorySource;

use std::io::{self, Read};
use std::sync::Arc;

/// Trait for random access reading from a data source.
///
/// All content streams opened against one mounted archive share a single
/// source through this trait, so implementations must not keep per-call
/// cursor state.
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer.
    ///
    /// Returns the number of bytes read, which may be short at end of source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Get the total size of the data source.
    fn size(&self) -> u64;
}

/// Fill `buf` completely from `offset` or fail with `UnexpectedEof`.
pub fn read_fully_at<R: ReadAt + ?Sized>(
    reader: &R,
    mut offset: u64,
    mut buf: &mut [u8],
) -> io::Result<()> {
    while !buf.is_empty() {
        let n = reader.read_at(offset, buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of source",
            ));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

/// A bounded, sequential view of a byte range in a shared source.
///
/// Used for preamble/postamble access and for compressed entry data: many
/// slices can be open at once without a dedicated OS handle per stream.
pub struct SourceSlice {
    source: Arc<dyn ReadAt>,
    start: u64,
    end: u64,
    pos: u64,
}

impl SourceSlice {
    pub fn new(source: Arc<dyn ReadAt>, start: u64, len: u64) -> Self {
        Self {
            source,
            start,
            end: start + len,
            pos: start,
        }
    }

    /// Bytes remaining before the end of the slice.
    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl Read for SourceSlice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end {
            return Ok(0);
        }
        let want = buf.len().min((self.end - self.pos) as usize);
        let n = self.source.read_at(self.pos, &mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_is_bounded() {
        let src = Arc::new(MemorySource::new(b"0123456789".to_vec()));
        let mut slice = SourceSlice::new(src, 2, 5);
        let mut out = Vec::new();
        slice.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"23456");
    }

    #[test]
    fn read_fully_at_hits_eof() {
        let src = MemorySource::new(b"abc".to_vec());
        let mut buf = [0u8; 4];
        let err = read_fully_at(&src, 1, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
