use super::structures::CompressionMethod;

/// Logical type of an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryType {
    File,
    Directory,
    /// Anything that is neither plain content nor a directory (device nodes
    /// and the like, as far as archive metadata can express them).
    Special,
}

/// One entry of a mounted archive.
///
/// Entries are shared, read-only snapshots once published into the codec's
/// directory map; mutation happens by staging replacement content in the
/// controller layer, never in place.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    name: String,
    method: CompressionMethod,
    /// DOS date in the high half, DOS time in the low half.
    dos_time: u32,
    crc32: u32,
    compressed_size: u64,
    uncompressed_size: u64,
    /// Local header position as recorded in the central directory, before
    /// offset mapping.
    raw_offset: u64,
    general_flags: u16,
}

impl ZipEntry {
    pub fn new(
        name: String,
        method: CompressionMethod,
        dos_time: u32,
        crc32: u32,
        compressed_size: u64,
        uncompressed_size: u64,
        raw_offset: u64,
        general_flags: u16,
    ) -> Self {
        Self {
            name,
            method,
            dos_time,
            crc32,
            compressed_size,
            uncompressed_size,
            raw_offset,
            general_flags,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory entries end with '/' by ZIP convention.
    pub fn kind(&self) -> EntryType {
        if self.name.ends_with('/') {
            EntryType::Directory
        } else {
            EntryType::File
        }
    }

    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// Combined DOS date/time (date in the high 16 bits).
    pub fn dos_time(&self) -> u32 {
        self.dos_time
    }

    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed_size
    }

    /// Central-directory-recorded local header offset. Resolve through the
    /// codec's offset mapper before seeking.
    pub fn raw_offset(&self) -> u64 {
        self.raw_offset
    }

    /// Whether CRC-32 and sizes were deferred to a trailing data descriptor.
    pub fn has_data_descriptor(&self) -> bool {
        self.general_flags & super::structures::GPF_DATA_DESCRIPTOR != 0
    }
}
