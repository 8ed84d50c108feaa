use flate2::{Crc, FlushDecompress, Status};
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::ZipError;
use super::inflater::{self, PooledInflater};
use crate::io::SourceSlice;

/// Decrements the parent codec's open-stream count when dropped, so a codec
/// can tell whether it is busy.
pub(super) struct OpenGuard {
    counter: Arc<AtomicUsize>,
}

impl OpenGuard {
    pub(super) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Inflates a raw deflate stream through a pooled decompressor.
struct InflateReader {
    slice: SourceSlice,
    inflater: PooledInflater,
    in_buf: Vec<u8>,
    in_pos: usize,
    in_end: usize,
    done: bool,
}

impl InflateReader {
    fn new(slice: SourceSlice) -> Self {
        Self {
            slice,
            inflater: inflater::allocate(),
            in_buf: vec![0u8; 16 * 1024],
            in_pos: 0,
            in_end: 0,
            done: false,
        }
    }

    fn read_inflated(&mut self, out: &mut [u8]) -> Result<usize, ZipError> {
        if self.done || out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.in_pos == self.in_end && self.slice.remaining() > 0 {
                let n = self.slice.read(&mut self.in_buf)?;
                self.in_pos = 0;
                self.in_end = n;
            }
            let input = &self.in_buf[self.in_pos..self.in_end];
            let flush = if input.is_empty() {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let before_in = self.inflater.total_in();
            let before_out = self.inflater.total_out();
            let status = self
                .inflater
                .decompress(input, out, flush)
                .map_err(|e| ZipError::Inflate(e.to_string()))?;
            self.in_pos += (self.inflater.total_in() - before_in) as usize;
            let produced = (self.inflater.total_out() - before_out) as usize;
            match status {
                Status::StreamEnd => {
                    self.done = true;
                    return Ok(produced);
                }
                Status::Ok | Status::BufError => {
                    if produced > 0 {
                        return Ok(produced);
                    }
                    if input.is_empty() && self.slice.remaining() == 0 {
                        return Err(ZipError::Inflate("unexpected end of stream".into()));
                    }
                }
            }
        }
    }
}

enum Mode {
    /// Stored entry, or raw access to a stored entry: bytes pass through.
    Stored(SourceSlice),
    /// Deflated entry read through the inflater; decompressed bytes are
    /// exposed to the caller.
    Inflate(InflateReader),
    /// Deflated entry exposed compressed, but still verified: the bytes
    /// handed out are also pushed through an internal inflater whose output
    /// feeds the checksum and is never exposed.
    RawVerified {
        slice: SourceSlice,
        inflater: PooledInflater,
        scratch: Vec<u8>,
        drained: bool,
    },
    /// Deflated entry exposed compressed, unverified.
    Raw(SourceSlice),
}

/// A content stream for one archive entry.
///
/// The stream shares the codec's underlying source; closing it (explicitly
/// or by drop) releases the codec's busy accounting. With verification
/// enabled, the CRC-32 is checked when the end of the stream is reached,
/// and [`EntryStream::close`] drains any unread remainder first so an early
/// close still validates the whole entry.
pub struct EntryStream {
    name: String,
    declared_crc: u32,
    verify: bool,
    crc: Crc,
    mode: Mode,
    file_closed: Arc<AtomicBool>,
    finished: bool,
    _guard: OpenGuard,
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStream")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl EntryStream {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn stored(
        name: String,
        declared_crc: u32,
        verify: bool,
        slice: SourceSlice,
        file_closed: Arc<AtomicBool>,
        guard: OpenGuard,
    ) -> Self {
        Self {
            name,
            declared_crc,
            verify,
            crc: Crc::new(),
            mode: Mode::Stored(slice),
            file_closed,
            finished: false,
            _guard: guard,
        }
    }

    pub(super) fn deflated(
        name: String,
        declared_crc: u32,
        verify: bool,
        inflate: bool,
        slice: SourceSlice,
        file_closed: Arc<AtomicBool>,
        guard: OpenGuard,
    ) -> Self {
        let mode = if inflate {
            Mode::Inflate(InflateReader::new(slice))
        } else if verify {
            Mode::RawVerified {
                slice,
                inflater: inflater::allocate(),
                scratch: vec![0u8; 16 * 1024],
                drained: false,
            }
        } else {
            Mode::Raw(slice)
        };
        Self {
            name,
            declared_crc,
            verify,
            crc: Crc::new(),
            mode,
            file_closed,
            finished: false,
            _guard: guard,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// CRC-32 declared for this entry (central directory, local header or
    /// data descriptor, whichever was authoritative at open time).
    pub fn declared_crc32(&self) -> u32 {
        self.declared_crc
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, ZipError> {
        if self.file_closed.load(Ordering::SeqCst) {
            return Err(ZipError::Closed);
        }
        if self.finished || buf.is_empty() {
            return Ok(0);
        }
        let n = match &mut self.mode {
            Mode::Stored(slice) | Mode::Raw(slice) => slice.read(buf)?,
            Mode::Inflate(reader) => reader.read_inflated(buf)?,
            Mode::RawVerified {
                slice,
                inflater,
                scratch,
                drained,
            } => {
                let n = slice.read(buf)?;
                if n > 0 {
                    pump(inflater, &buf[..n], scratch, &mut self.crc)?;
                } else if !*drained {
                    finish_pump(inflater, scratch, &mut self.crc)?;
                    *drained = true;
                }
                n
            }
        };
        if n == 0 {
            self.finish()?;
        } else if self.verify && matches!(self.mode, Mode::Stored(_) | Mode::Inflate(_)) {
            self.crc.update(&buf[..n]);
        }
        Ok(n)
    }

    fn finish(&mut self) -> Result<(), ZipError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if self.verify {
            let actual = self.crc.sum();
            if actual != self.declared_crc {
                return Err(ZipError::Crc32Mismatch {
                    expected: self.declared_crc,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Close the stream, draining any unread remainder so that checksum
    /// verification covers the whole entry even on an early close.
    pub fn close(&mut self) -> Result<(), ZipError> {
        let mut sink = [0u8; 8 * 1024];
        while !self.finished {
            if self.read_some(&mut sink)? == 0 {
                break;
            }
        }
        Ok(())
    }
}

impl Read for EntryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_some(buf).map_err(|e| match e {
            ZipError::Io(io) => io,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}

/// Push `input` through the verification inflater, folding all decompressed
/// output into the checksum.
fn pump(
    inflater: &mut PooledInflater,
    mut input: &[u8],
    scratch: &mut [u8],
    crc: &mut Crc,
) -> Result<(), ZipError> {
    while !input.is_empty() {
        let before_in = inflater.total_in();
        let before_out = inflater.total_out();
        let status = inflater
            .decompress(input, scratch, FlushDecompress::None)
            .map_err(|e| ZipError::Inflate(e.to_string()))?;
        let consumed = (inflater.total_in() - before_in) as usize;
        let produced = (inflater.total_out() - before_out) as usize;
        crc.update(&scratch[..produced]);
        input = &input[consumed..];
        if let Status::StreamEnd = status {
            break;
        }
        if consumed == 0 && produced == 0 {
            return Err(ZipError::Inflate("stalled deflate stream".into()));
        }
    }
    Ok(())
}

/// Flush the verification inflater at end of input.
fn finish_pump(
    inflater: &mut PooledInflater,
    scratch: &mut [u8],
    crc: &mut Crc,
) -> Result<(), ZipError> {
    loop {
        let before_out = inflater.total_out();
        let status = inflater
            .decompress(&[], scratch, FlushDecompress::Finish)
            .map_err(|e| ZipError::Inflate(e.to_string()))?;
        let produced = (inflater.total_out() - before_out) as usize;
        crc.update(&scratch[..produced]);
        match status {
            Status::StreamEnd => return Ok(()),
            _ if produced == 0 => {
                return Err(ZipError::Inflate("unexpected end of stream".into()));
            }
            _ => {}
        }
    }
}
