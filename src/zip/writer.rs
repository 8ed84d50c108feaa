use byteorder::{LittleEndian, WriteBytesExt};
use flate2::{Compression, Crc, write::DeflateEncoder};
use std::io::Write;

use super::ZipError;
use super::structures::*;

const VERSION_ZIP32: u16 = 20;
const VERSION_ZIP64: u16 = 45;
const U32_MAX: u64 = 0xFFFF_FFFF;

struct CdRecord {
    name: String,
    method: CompressionMethod,
    dos_time: u32,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    offset: u64,
}

impl CdRecord {
    fn needs_zip64(&self) -> bool {
        self.compressed_size >= U32_MAX
            || self.uncompressed_size >= U32_MAX
            || self.offset >= U32_MAX
    }
}

/// Writes a ZIP archive entry by entry.
///
/// Sizes and checksums are computed before the local header is emitted, so
/// no data descriptors are written and the output needs no seeking. ZIP64
/// records kick in automatically when any count, size or offset overflows
/// its 32-bit field.
pub struct RawZipOutput<W: Write> {
    out: W,
    offset: u64,
    dir: Vec<CdRecord>,
    comment: Vec<u8>,
}

impl<W: Write> RawZipOutput<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            offset: 0,
            dir: Vec::new(),
            comment: Vec::new(),
        }
    }

    pub fn set_comment(&mut self, comment: Vec<u8>) {
        self.comment = comment;
    }

    /// Number of entries written so far.
    pub fn len(&self) -> usize {
        self.dir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dir.is_empty()
    }

    /// Append one entry. Directory entries follow the ZIP convention of a
    /// trailing '/' and empty content.
    pub fn put(
        &mut self,
        name: &str,
        method: CompressionMethod,
        dos_time: u32,
        data: &[u8],
    ) -> Result<(), ZipError> {
        let mut crc = Crc::new();
        crc.update(data);
        let crc32 = crc.sum();

        let deflated;
        let compressed: &[u8] = match method {
            CompressionMethod::Stored => data,
            CompressionMethod::Deflated => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                deflated = encoder.finish()?;
                &deflated
            }
            CompressionMethod::Unknown(m) => {
                return Err(ZipError::UnsupportedMethod(m, name.to_string()));
            }
        };

        let record = CdRecord {
            name: name.to_string(),
            method,
            dos_time,
            crc32,
            compressed_size: compressed.len() as u64,
            uncompressed_size: data.len() as u64,
            offset: self.offset,
        };

        let zip64 = record.needs_zip64();
        let extra_len: u16 = if zip64 { 4 + 16 } else { 0 };

        self.out.write_all(LFH_SIGNATURE)?;
        self.out.write_u16::<LittleEndian>(if zip64 {
            VERSION_ZIP64
        } else {
            VERSION_ZIP32
        })?;
        // Entry names are Rust strings, hence always UTF-8.
        self.out.write_u16::<LittleEndian>(GPF_UTF8)?;
        self.out.write_u16::<LittleEndian>(method.as_u16())?;
        self.out.write_u16::<LittleEndian>(dos_time as u16)?;
        self.out.write_u16::<LittleEndian>((dos_time >> 16) as u16)?;
        self.out.write_u32::<LittleEndian>(crc32)?;
        self.out
            .write_u32::<LittleEndian>(record.compressed_size.min(U32_MAX) as u32)?;
        self.out
            .write_u32::<LittleEndian>(record.uncompressed_size.min(U32_MAX) as u32)?;
        self.out.write_u16::<LittleEndian>(name.len() as u16)?;
        self.out.write_u16::<LittleEndian>(extra_len)?;
        self.out.write_all(name.as_bytes())?;
        if zip64 {
            self.out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
            self.out.write_u16::<LittleEndian>(16)?;
            self.out
                .write_u64::<LittleEndian>(record.uncompressed_size)?;
            self.out.write_u64::<LittleEndian>(record.compressed_size)?;
        }
        self.out.write_all(compressed)?;

        self.offset +=
            LFH_SIZE as u64 + name.len() as u64 + extra_len as u64 + record.compressed_size;
        self.dir.push(record);
        Ok(())
    }

    /// Write the central directory and end records, returning the sink.
    pub fn finish(mut self) -> Result<W, ZipError> {
        let cd_offset = self.offset;
        let mut cd_size = 0u64;
        let mut any_zip64 = false;

        for record in &self.dir {
            let zip64 = record.needs_zip64();
            any_zip64 |= zip64;
            let extra_len: u16 = if zip64 { 4 + 24 } else { 0 };

            self.out.write_all(CDFH_SIGNATURE)?;
            let version = if zip64 { VERSION_ZIP64 } else { VERSION_ZIP32 };
            self.out.write_u16::<LittleEndian>(version)?; // version made by
            self.out.write_u16::<LittleEndian>(version)?; // version needed
            self.out.write_u16::<LittleEndian>(GPF_UTF8)?;
            self.out.write_u16::<LittleEndian>(record.method.as_u16())?;
            self.out.write_u16::<LittleEndian>(record.dos_time as u16)?;
            self.out
                .write_u16::<LittleEndian>((record.dos_time >> 16) as u16)?;
            self.out.write_u32::<LittleEndian>(record.crc32)?;
            self.out
                .write_u32::<LittleEndian>(record.compressed_size.min(U32_MAX) as u32)?;
            self.out
                .write_u32::<LittleEndian>(record.uncompressed_size.min(U32_MAX) as u32)?;
            self.out.write_u16::<LittleEndian>(record.name.len() as u16)?;
            self.out.write_u16::<LittleEndian>(extra_len)?;
            self.out.write_u16::<LittleEndian>(0)?; // comment length
            self.out.write_u16::<LittleEndian>(0)?; // disk number start
            self.out.write_u16::<LittleEndian>(0)?; // internal attributes
            self.out.write_u32::<LittleEndian>(0)?; // external attributes
            self.out
                .write_u32::<LittleEndian>(record.offset.min(U32_MAX) as u32)?;
            self.out.write_all(record.name.as_bytes())?;
            if zip64 {
                self.out.write_u16::<LittleEndian>(ZIP64_EXTRA_ID)?;
                self.out.write_u16::<LittleEndian>(24)?;
                self.out
                    .write_u64::<LittleEndian>(record.uncompressed_size)?;
                self.out
                    .write_u64::<LittleEndian>(record.compressed_size)?;
                self.out.write_u64::<LittleEndian>(record.offset)?;
            }
            cd_size += CDFH_MIN_SIZE as u64 + record.name.len() as u64 + extra_len as u64;
        }

        let count = self.dir.len() as u64;
        let need_zip64 =
            any_zip64 || count > 0xFFFF || cd_size >= U32_MAX || cd_offset >= U32_MAX;

        if need_zip64 {
            let eocd64_offset = cd_offset + cd_size;
            self.out.write_all(Zip64Eocd::SIGNATURE)?;
            self.out.write_u64::<LittleEndian>(44)?; // size of remainder
            self.out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
            self.out.write_u16::<LittleEndian>(VERSION_ZIP64)?;
            self.out.write_u32::<LittleEndian>(0)?; // disk number
            self.out.write_u32::<LittleEndian>(0)?; // disk with cd
            self.out.write_u64::<LittleEndian>(count)?;
            self.out.write_u64::<LittleEndian>(count)?;
            self.out.write_u64::<LittleEndian>(cd_size)?;
            self.out.write_u64::<LittleEndian>(cd_offset)?;

            self.out.write_all(Zip64EocdLocator::SIGNATURE)?;
            self.out.write_u32::<LittleEndian>(0)?; // disk with zip64 eocd
            self.out.write_u64::<LittleEndian>(eocd64_offset)?;
            self.out.write_u32::<LittleEndian>(1)?; // total disks
        }

        self.out.write_all(EndOfCentralDirectory::SIGNATURE)?;
        self.out.write_u16::<LittleEndian>(0)?; // disk number
        self.out.write_u16::<LittleEndian>(0)?; // disk with cd
        self.out
            .write_u16::<LittleEndian>(count.min(0xFFFF) as u16)?;
        self.out
            .write_u16::<LittleEndian>(count.min(0xFFFF) as u16)?;
        self.out
            .write_u32::<LittleEndian>(cd_size.min(U32_MAX) as u32)?;
        self.out
            .write_u32::<LittleEndian>(cd_offset.min(U32_MAX) as u32)?;
        self.out
            .write_u16::<LittleEndian>(self.comment.len() as u16)?;
        self.out.write_all(&self.comment)?;
        Ok(self.out)
    }
}
