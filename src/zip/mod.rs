//! ZIP archive codec.
//!
//! This module reads and writes the ZIP family's on-disk layout, supporting
//! both standard ZIP format and ZIP64 extensions for large archives.
//!
//! ## Architecture
//!
//! - [`structures`]: data structures for ZIP format elements (EOCD, ZIP64
//!   records, header signatures)
//! - [`entry`]: the published, read-only archive entry snapshot
//! - [`raw`]: [`RawZipFile`], the central-directory mount state machine
//! - [`stream`]: verified/unverified decompressing content streams
//! - [`writer`]: [`RawZipOutput`], the archive writer used on the sync path
//! - [`dostime`]: DOS date/time conversion with explicit timezone profiles
//! - [`inflater`]: process-wide pool of decompressor state
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! This implementation reads the EOCD first (from the end of the file), then
//! the Central Directory. Self-extracting preambles and trailing postambles
//! are tolerated; a constant-bias offset mapper copes with archives whose
//! byte layout shifted after creation (e.g. re-signed self-extracting
//! executables).
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk (split) archive support
//! - STORED and DEFLATE are the only supported compression methods

pub mod dostime;
mod entry;
mod inflater;
mod raw;
mod stream;
mod structures;
mod writer;

pub use entry::{EntryType, ZipEntry};
pub use raw::{RawZipFile, ZipConfig};
pub use stream::EntryStream;
pub use structures::CompressionMethod;
pub use writer::RawZipOutput;

use std::io;
use thiserror::Error;

/// Errors raised by the ZIP codec.
///
/// Malformed structures and checksum mismatches are kept apart so callers
/// can tell "this is not (or no longer) a valid archive" from "this archive
/// is valid but its content is corrupt". I/O failures on the underlying
/// source pass through unchanged.
#[derive(Debug, Error)]
pub enum ZipError {
    /// The end of central directory record could not be located.
    #[error("not a ZIP archive (end of central directory signature not found)")]
    NoEocd,

    /// A source declared free of preambles does not start with a ZIP
    /// signature.
    #[error("not a ZIP archive (no local file header or end of central directory at offset 0)")]
    NoLeadingSignature,

    /// A record did not carry the signature required at its position.
    #[error("expected {expected} signature at offset {offset:#x}")]
    WrongSignature {
        expected: &'static str,
        offset: u64,
    },

    /// Archives split across multiple volumes are never supported.
    #[error("split (multi-volume) archives are not supported")]
    SplitArchive,

    /// Only STORED and DEFLATED entries can be read.
    #[error("unsupported compression method {0} for entry {1:?}")]
    UnsupportedMethod(u16, String),

    /// The central directory held a different number of entries than the
    /// end record declared (compared modulo 65536 for legacy archives).
    #[error("central directory declares {declared} entries but holds {parsed}")]
    EntryCountMismatch { declared: u64, parsed: u64 },

    /// An entry name flagged as UTF-8 was not valid UTF-8.
    #[error("malformed UTF-8 entry name")]
    MalformedName,

    /// A fixed-size record was cut short by the end of the source.
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// Declared and actual CRC-32 values disagree. Raised both for a
    /// central-vs-local header mismatch and for corrupt entry content.
    #[error("CRC-32 mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Crc32Mismatch { expected: u32, actual: u32 },

    /// A timestamp cannot be represented as a DOS date/time.
    #[error("timestamp out of range for DOS date/time")]
    TimestampOutOfRange,

    /// The codec (or a stream sharing its source) was used after close.
    #[error("ZIP file is closed")]
    Closed,

    /// Decompression failed; the deflate stream is corrupt.
    #[error("corrupt deflate stream: {0}")]
    Inflate(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ZipError {
    /// True for checksum errors as opposed to generic format errors.
    pub fn is_checksum(&self) -> bool {
        matches!(self, ZipError::Crc32Mismatch { .. })
    }
}
