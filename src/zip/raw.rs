use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::ZipError;
use super::entry::ZipEntry;
use super::stream::{EntryStream, OpenGuard};
use super::structures::*;
use crate::io::{ReadAt, SourceSlice, read_fully_at};

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// Bounds the backward search for the end of central directory unless
/// postambles of unbounded size are explicitly allowed.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Mount-time options for [`RawZipFile`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipConfig {
    /// The source is known to carry a preamble (e.g. a self-extracting
    /// stub), so the leading-signature sanity check is skipped.
    pub preambled: bool,
    /// Allow postambles larger than a ZIP comment, turning the bounded
    /// backward search for the end record into a full scan.
    pub postambled: bool,
}

/// Maps an offset recorded in the central directory to an absolute byte
/// position in the source.
///
/// The irregular variant applies a constant bias for archives whose byte
/// layout shifted after creation, e.g. re-signed self-extracting
/// executables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffsetMapper {
    Identity,
    Irregular { bias: i64 },
}

impl OffsetMapper {
    fn map(&self, offset: u64) -> u64 {
        match self {
            OffsetMapper::Identity => offset,
            OffsetMapper::Irregular { bias } => offset.wrapping_add_signed(*bias),
        }
    }
}

/// Declared entry counts may wrap at 65536 in legacy archives, so the
/// parsed count is compared modulo 65536 unless ZIP64 records were used.
fn count_matches(declared: u64, parsed: u64, zip64: bool) -> bool {
    if zip64 {
        declared == parsed
    } else {
        declared % 65536 == parsed % 65536
    }
}

/// A mounted ZIP archive over a random-access byte source.
///
/// Mounting locates and parses the central directory; afterwards entries
/// can be looked up by name in O(1) while iteration preserves the central
/// directory's insertion order. All content streams share the underlying
/// source, and the number of currently open streams is tracked so callers
/// can detect busy archives.
pub struct RawZipFile {
    source: Arc<dyn ReadAt>,
    order: Vec<String>,
    index: HashMap<String, Arc<ZipEntry>>,
    comment: Vec<u8>,
    redundant: bool,
    mapper: OffsetMapper,
    preamble_len: u64,
    postamble_ofs: u64,
    postamble_len: u64,
    open_streams: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for RawZipFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawZipFile")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl RawZipFile {
    /// Mount the archive, parsing and validating its central directory.
    pub fn mount(source: Arc<dyn ReadAt>, config: ZipConfig) -> Result<Self, ZipError> {
        let size = source.size();

        if !config.preambled {
            if size < 4 {
                return Err(ZipError::NoEocd);
            }
            let mut sig = [0u8; 4];
            read_fully_at(&*source, 0, &mut sig)?;
            if sig != LFH_SIGNATURE
                && sig != EndOfCentralDirectory::SIGNATURE
                && sig != Zip64Eocd::SIGNATURE
            {
                return Err(ZipError::NoLeadingSignature);
            }
        }

        let (eocd, eocd_pos) = Self::find_eocd(&*source, size, config)?;

        let mut comment = vec![0u8; eocd.comment_len as usize];
        read_fully_at(
            &*source,
            eocd_pos + EndOfCentralDirectory::SIZE as u64,
            &mut comment,
        )?;
        let postamble_ofs = eocd_pos + EndOfCentralDirectory::SIZE as u64 + comment.len() as u64;
        let postamble_len = size - postamble_ofs;

        // A ZIP64 locator immediately precedes the end record when present.
        let locator = Self::read_zip64_locator(&*source, eocd_pos)?;

        let (cd_offset, cd_size, declared, cd_end_pos, zip64) = match locator {
            Some(locator) => {
                if locator.total_disks > 1 || locator.disk_with_eocd64 != 0 {
                    return Err(ZipError::SplitArchive);
                }
                let mut buf = vec![0u8; Zip64Eocd::MIN_SIZE];
                read_fully_at(&*source, locator.eocd64_offset, &mut buf)?;
                let eocd64 = Zip64Eocd::from_bytes(&buf).map_err(|_| ZipError::WrongSignature {
                    expected: "ZIP64 end of central directory",
                    offset: locator.eocd64_offset,
                })?;
                if eocd64.is_split() {
                    return Err(ZipError::SplitArchive);
                }
                (
                    eocd64.cd_offset,
                    eocd64.cd_size,
                    eocd64.total_entries,
                    locator.eocd64_offset,
                    true,
                )
            }
            None => {
                if eocd.is_split() {
                    return Err(ZipError::SplitArchive);
                }
                (
                    eocd.cd_offset as u64,
                    eocd.cd_size as u64,
                    eocd.total_entries as u64,
                    eocd_pos,
                    false,
                )
            }
        };

        if cd_size > cd_end_pos {
            return Err(ZipError::Truncated("central directory"));
        }
        // Where the central directory actually starts, measured from the
        // end record; disagrees with the declared offset in shifted
        // archives.
        let measured_start = cd_end_pos - cd_size;

        let mapper = Self::resolve_mapper(&*source, size, cd_offset, measured_start, declared)?;
        let cd_start = mapper.map(cd_offset);

        let mut cd_data = vec![0u8; cd_size as usize];
        read_fully_at(&*source, cd_start, &mut cd_data)?;

        let mut order = Vec::new();
        let mut index: HashMap<String, Arc<ZipEntry>> = HashMap::new();
        let mut cursor = Cursor::new(&cd_data);
        let mut parsed = 0u64;
        let mut min_offset = u64::MAX;
        let mut redundant = false;

        while cd_data.len() as u64 - cursor.position() >= 4 {
            let mut sig = [0u8; 4];
            cursor.read_exact(&mut sig)?;
            if sig != CDFH_SIGNATURE {
                // Any foreign signature terminates the central directory.
                break;
            }
            let entry = parse_cdfh(&mut cursor)?;
            parsed += 1;
            min_offset = min_offset.min(mapper.map(entry.raw_offset()));
            let name = entry.name().to_string();
            // Redundant entries are tolerated, last write wins, but the
            // first appearance keeps its position in iteration order.
            if index.insert(name.clone(), Arc::new(entry)).is_none() {
                order.push(name);
            } else {
                redundant = true;
            }
        }

        if !count_matches(declared, parsed, zip64) {
            return Err(ZipError::EntryCountMismatch { declared, parsed });
        }

        Ok(Self {
            source,
            order,
            index,
            comment,
            redundant,
            mapper,
            preamble_len: if min_offset == u64::MAX { 0 } else { min_offset },
            postamble_ofs,
            postamble_len,
            open_streams: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Scan backward from the end of the source for the end of central
    /// directory record.
    fn find_eocd(
        source: &dyn ReadAt,
        size: u64,
        config: ZipConfig,
    ) -> Result<(EndOfCentralDirectory, u64), ZipError> {
        let record = EndOfCentralDirectory::SIZE as u64;
        if size < record {
            return Err(ZipError::NoEocd);
        }
        let scan_len = if config.postambled {
            size
        } else {
            (MAX_COMMENT_SIZE + record).min(size)
        };
        let scan_start = size - scan_len;
        let mut buf = vec![0u8; scan_len as usize];
        read_fully_at(source, scan_start, &mut buf)?;

        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] != EndOfCentralDirectory::SIGNATURE {
                continue;
            }
            // The comment length must account for the remaining bytes,
            // or at least fit into them when a postamble may follow.
            let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
            let remaining = buf.len() - i - EndOfCentralDirectory::SIZE;
            let plausible = if config.postambled {
                comment_len <= remaining
            } else {
                comment_len == remaining
            };
            if plausible {
                let eocd =
                    EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
                return Ok((eocd, scan_start + i as u64));
            }
        }
        Err(ZipError::NoEocd)
    }

    /// Probe for a ZIP64 end of central directory locator before the end
    /// record; absence means the archive is ZIP32-only.
    fn read_zip64_locator(
        source: &dyn ReadAt,
        eocd_pos: u64,
    ) -> Result<Option<Zip64EocdLocator>, ZipError> {
        if eocd_pos < Zip64EocdLocator::SIZE as u64 {
            return Ok(None);
        }
        let mut buf = vec![0u8; Zip64EocdLocator::SIZE];
        read_fully_at(source, eocd_pos - Zip64EocdLocator::SIZE as u64, &mut buf)?;
        if &buf[0..4] != Zip64EocdLocator::SIGNATURE {
            return Ok(None);
        }
        Ok(Some(Zip64EocdLocator::from_bytes(&buf)?))
    }

    /// Re-seek to the first central file header; when it is not at the
    /// declared position, fall back to a constant-bias mapper computed from
    /// the measured central directory start.
    fn resolve_mapper(
        source: &dyn ReadAt,
        size: u64,
        declared_offset: u64,
        measured_start: u64,
        declared_count: u64,
    ) -> Result<OffsetMapper, ZipError> {
        if declared_count == 0 {
            return Ok(OffsetMapper::Identity);
        }
        if declared_offset + 4 <= size {
            let mut sig = [0u8; 4];
            read_fully_at(source, declared_offset, &mut sig)?;
            if sig == CDFH_SIGNATURE {
                return Ok(OffsetMapper::Identity);
            }
        }
        let bias = measured_start as i64 - declared_offset as i64;
        let mut sig = [0u8; 4];
        read_fully_at(source, measured_start, &mut sig)?;
        if sig != CDFH_SIGNATURE {
            return Err(ZipError::WrongSignature {
                expected: "central file header",
                offset: measured_start,
            });
        }
        Ok(OffsetMapper::Irregular { bias })
    }

    /// Number of entries in the archive.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Look up an entry by name.
    pub fn entry(&self, name: &str) -> Option<&Arc<ZipEntry>> {
        self.index.get(name)
    }

    /// Iterate entries in central directory insertion order.
    pub fn entries(&self) -> impl Iterator<Item = &Arc<ZipEntry>> {
        self.order.iter().map(|name| &self.index[name])
    }

    /// The archive comment bytes.
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// True when the central directory held several records for one name
    /// (last record wins, first appearance keeps its position).
    pub fn has_redundant_entries(&self) -> bool {
        self.redundant
    }

    /// Length of any self-extracting stub or other data preceding the
    /// first entry.
    pub fn preamble_len(&self) -> u64 {
        self.preamble_len
    }

    pub fn postamble_len(&self) -> u64 {
        self.postamble_len
    }

    /// Bounded stream over the preamble, sharing the archive's source.
    pub fn preamble(&self) -> SourceSlice {
        SourceSlice::new(Arc::clone(&self.source), 0, self.preamble_len)
    }

    /// Bounded stream over the postamble, sharing the archive's source.
    pub fn postamble(&self) -> SourceSlice {
        SourceSlice::new(Arc::clone(&self.source), self.postamble_ofs, self.postamble_len)
    }

    /// True while any content stream is open.
    pub fn busy(&self) -> bool {
        self.open_streams.load(Ordering::SeqCst) > 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the codec. Open streams sharing the source are invalidated;
    /// the source itself is released once the last stream drops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Open a content stream for the named entry.
    ///
    /// With `verify`, the local header (or, with the deferred-CRC flag, the
    /// data descriptor trailing the compressed data) is cross-checked
    /// against the central directory at open time, and the stream checks
    /// the content CRC-32 when it is read or drained to its end. Without
    /// `inflate`, compressed bytes are exposed as stored; verification then
    /// decompresses internally without exposing inflated bytes.
    pub fn open(
        &self,
        name: &str,
        verify: bool,
        inflate: bool,
    ) -> Result<Option<EntryStream>, ZipError> {
        if self.is_closed() {
            return Err(ZipError::Closed);
        }
        let Some(entry) = self.index.get(name) else {
            return Ok(None);
        };

        let lfh_pos = self.mapper.map(entry.raw_offset());
        let mut lfh = [0u8; LFH_SIZE];
        read_fully_at(&*self.source, lfh_pos, &mut lfh)?;
        if &lfh[0..4] != LFH_SIGNATURE {
            return Err(ZipError::WrongSignature {
                expected: "local file header",
                offset: lfh_pos,
            });
        }

        let name_len = u16::from_le_bytes([lfh[26], lfh[27]]) as u64;
        let extra_len = u16::from_le_bytes([lfh[28], lfh[29]]) as u64;
        let data_ofs = lfh_pos + LFH_SIZE as u64 + name_len + extra_len;

        let declared = entry.crc32();
        if verify {
            let local_crc = if entry.has_data_descriptor() {
                self.read_descriptor_crc(data_ofs + entry.compressed_size())?
            } else {
                u32::from_le_bytes([lfh[14], lfh[15], lfh[16], lfh[17]])
            };
            if local_crc != declared {
                return Err(ZipError::Crc32Mismatch {
                    expected: declared,
                    actual: local_crc,
                });
            }
        }

        let slice = SourceSlice::new(Arc::clone(&self.source), data_ofs, entry.compressed_size());
        let guard = OpenGuard::new(Arc::clone(&self.open_streams));
        let closed = Arc::clone(&self.closed);

        let stream = match entry.method() {
            CompressionMethod::Stored => {
                EntryStream::stored(name.to_string(), declared, verify, slice, closed, guard)
            }
            CompressionMethod::Deflated => EntryStream::deflated(
                name.to_string(),
                declared,
                verify,
                inflate,
                slice,
                closed,
                guard,
            ),
            CompressionMethod::Unknown(m) => {
                // Ruled out at mount time.
                return Err(ZipError::UnsupportedMethod(m, name.to_string()));
            }
        };
        Ok(Some(stream))
    }

    /// Read the CRC-32 from an 8-byte (or, with its optional signature,
    /// 12-byte) data descriptor window following the compressed data.
    fn read_descriptor_crc(&self, pos: u64) -> Result<u32, ZipError> {
        let mut buf = [0u8; 8];
        read_fully_at(&*self.source, pos, &mut buf)?;
        if &buf[0..4] == DATA_DESCRIPTOR_SIGNATURE {
            Ok(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]))
        } else {
            Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
        }
    }
}

/// Parse one central file header; the cursor is positioned right after the
/// signature.
fn parse_cdfh(cursor: &mut Cursor<&Vec<u8>>) -> Result<ZipEntry, ZipError> {
    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>()? as u64;

    let mut file_name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut file_name_bytes)?;
    // The UTF-8 general purpose flag overrides the archive-wide encoding
    // for this entry only; other entries decode tolerantly.
    let file_name = if flags & GPF_UTF8 != 0 {
        String::from_utf8(file_name_bytes).map_err(|_| ZipError::MalformedName)?
    } else {
        String::from_utf8_lossy(&file_name_bytes).to_string()
    };

    let method = match CompressionMethod::from_u16(method) {
        CompressionMethod::Unknown(m) => {
            return Err(ZipError::UnsupportedMethod(m, file_name));
        }
        m => m,
    };

    // ZIP64 extended information, extra field ID 0x0001. Fields are
    // present only when the corresponding 32-bit field is saturated.
    let extra_field_end = cursor.position() + extra_field_length as u64;
    while cursor.position() + 4 <= extra_field_end {
        let header_id = cursor.read_u16::<LittleEndian>()?;
        let field_size = cursor.read_u16::<LittleEndian>()?;
        if header_id == ZIP64_EXTRA_ID {
            if uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= extra_field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= extra_field_end {
                compressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if lfh_offset == 0xFFFFFFFF && cursor.position() + 8 <= extra_field_end {
                lfh_offset = cursor.read_u64::<LittleEndian>()?;
            }
            let remaining = extra_field_end.saturating_sub(cursor.position());
            cursor.set_position(cursor.position() + remaining);
        } else {
            cursor.set_position(cursor.position() + field_size as u64);
        }
    }
    cursor.set_position(extra_field_end);

    // Skip over the file comment (we don't use it)
    cursor.set_position(cursor.position() + file_comment_length as u64);

    let dos_time = ((last_mod_date as u32) << 16) | last_mod_time as u32;
    Ok(ZipEntry::new(
        file_name,
        method,
        dos_time,
        crc32,
        compressed_size,
        uncompressed_size,
        lfh_offset,
        flags,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_entry_counts_wrap_at_65536() {
        assert!(count_matches(2, 2, false));
        assert!(count_matches(2, 65538, false));
        assert!(!count_matches(2, 3, false));
        // ZIP64 records carry exact counts.
        assert!(count_matches(70000, 70000, true));
        assert!(!count_matches(2, 65538, true));
    }

    #[test]
    fn irregular_mapper_applies_constant_bias() {
        let mapper = OffsetMapper::Irregular { bias: 100 };
        assert_eq!(mapper.map(0), 100);
        assert_eq!(mapper.map(42), 142);
        let negative = OffsetMapper::Irregular { bias: -10 };
        assert_eq!(negative.map(50), 40);
        assert_eq!(OffsetMapper::Identity.map(7), 7);
    }

    #[test]
    fn redundant_names_keep_the_last_record() {
        use crate::io::MemorySource;
        use crate::zip::RawZipOutput;

        let mut out = RawZipOutput::new(Cursor::new(Vec::new()));
        out.put("a.txt", CompressionMethod::Stored, 0x0021 << 16, b"first")
            .unwrap();
        out.put("b.txt", CompressionMethod::Stored, 0x0021 << 16, b"other")
            .unwrap();
        out.put("a.txt", CompressionMethod::Stored, 0x0021 << 16, b"second")
            .unwrap();
        let bytes = out.finish().unwrap().into_inner();

        let zip = RawZipFile::mount(
            Arc::new(MemorySource::new(bytes)),
            ZipConfig::default(),
        )
        .unwrap();

        assert!(zip.has_redundant_entries());
        assert_eq!(zip.len(), 2);
        let names: Vec<_> = zip.entries().map(|e| e.name().to_string()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);

        let mut stream = zip.open("a.txt", true, true).unwrap().unwrap();
        let mut content = Vec::new();
        stream.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"second");
    }
}
