//! Process-wide pool of deflate decompressor state.
//!
//! Allocating the decompression state is the expensive part of opening an
//! inflating stream, so released instances are kept on a shared free list.
//! Acquiring removes an instance from the pool, so one is never used by two
//! streams at once; releasing resets it before returning it.

use flate2::Decompress;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

const MAX_POOLED: usize = 16;

static POOL: Mutex<Vec<Decompress>> = Mutex::new(Vec::new());

/// A decompressor borrowed from the pool; returned on drop.
pub struct PooledInflater {
    inner: Option<Decompress>,
}

pub fn allocate() -> PooledInflater {
    let inner = POOL
        .lock()
        .pop()
        // ZIP entries hold raw deflate streams without a zlib header.
        .unwrap_or_else(|| Decompress::new(false));
    PooledInflater { inner: Some(inner) }
}

impl Deref for PooledInflater {
    type Target = Decompress;

    fn deref(&self) -> &Decompress {
        self.inner.as_ref().expect("taken only on drop")
    }
}

impl DerefMut for PooledInflater {
    fn deref_mut(&mut self) -> &mut Decompress {
        self.inner.as_mut().expect("taken only on drop")
    }
}

impl Drop for PooledInflater {
    fn drop(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.reset(false);
            let mut pool = POOL.lock();
            if pool.len() < MAX_POOLED {
                pool.push(inner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::FlushDecompress;

    #[test]
    fn released_inflater_is_reset_for_reuse() {
        let compressed = {
            use flate2::{Compress, Compression, FlushCompress};
            let mut c = Compress::new(Compression::default(), false);
            let mut out = vec![0u8; 64];
            c.compress(b"hello", &mut out, FlushCompress::Finish).unwrap();
            out.truncate(c.total_out() as usize);
            out
        };

        for _ in 0..3 {
            let mut inflater = allocate();
            let mut out = vec![0u8; 16];
            inflater
                .decompress(&compressed, &mut out, FlushDecompress::Finish)
                .unwrap();
            assert_eq!(&out[..5], b"hello");
            assert_eq!(inflater.total_out(), 5);
        }
    }
}
