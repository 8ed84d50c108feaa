use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::Arc;

use super::driver::ZipDriver;
use super::entry::{CovariantEntry, FsEntryData};
use super::error::{FsError, OpError, OpResult, Retry};
use super::model::FsModel;
use crate::io::MemorySource;
use crate::zip::dostime::{dos_to_unix_millis, unix_millis_to_dos};
use crate::zip::{CompressionMethod, EntryStream, EntryType, RawZipFile, RawZipOutput, ZipError};

/// Result of a stat operation: the selected type plus every type the
/// covariant entry currently realizes.
#[derive(Debug, Clone)]
pub struct EntryStat {
    pub kind: EntryType,
    pub size: u64,
    pub mtime: Option<i64>,
    pub types: Vec<EntryType>,
}

/// A readable entry content stream with explicit close-for-verification.
///
/// Dropping without closing is tolerated; the finalize decorator then
/// force-closes and logs instead of surfacing the error.
pub trait EntryReader: Read + Send {
    fn close(&mut self) -> OpResult<()>;
}

/// Reader over staged in-memory content.
pub struct VecReader {
    data: Arc<Vec<u8>>,
    pos: usize,
}

impl VecReader {
    pub fn new(data: Arc<Vec<u8>>) -> Self {
        Self { data, pos: 0 }
    }
}

impl Read for VecReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl EntryReader for VecReader {
    fn close(&mut self) -> OpResult<()> {
        Ok(())
    }
}

/// Adapts a codec content stream to the controller stream contract.
pub struct ZipStreamReader {
    stream: EntryStream,
}

impl Read for ZipStreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl EntryReader for ZipStreamReader {
    fn close(&mut self) -> OpResult<()> {
        self.stream.close().map_err(|e| FsError::Zip(e).into())
    }
}

/// The file operations of one (possibly federated) file system.
///
/// Paths are slash-separated and relative to the file system root; the
/// empty path addresses the virtual root entry itself.
pub trait FsController: Send + Sync {
    fn model(&self) -> &Arc<FsModel>;

    fn stat(&self, path: &str) -> OpResult<Option<EntryStat>>;

    /// Member names of a directory entry, in insertion order.
    fn list(&self, path: &str) -> OpResult<Vec<String>>;

    fn read(&self, path: &str) -> OpResult<Box<dyn EntryReader>>;

    /// Stage full replacement content for an entry.
    fn write(&self, path: &str, data: Vec<u8>, mtime: Option<i64>) -> OpResult<()>;

    fn make_dir(&self, path: &str) -> OpResult<()>;

    fn unlink(&self, path: &str) -> OpResult<()>;

    /// Returns true if the time was applied.
    fn set_mtime(&self, path: &str, mtime: i64) -> OpResult<bool>;

    /// Flush pending state to the parent file system and release resources.
    fn sync(&self) -> OpResult<()>;

    /// Drop cached state without flushing, so a later access can re-probe
    /// whether the underlying target is still an archive.
    fn reset(&self) -> OpResult<()>;
}

/// Plain pass-through decorator; the base other decorators are measured
/// against, and handy for instrumenting a controller in tests.
pub struct FsDecoratingController<C: FsController> {
    inner: C,
}

impl<C: FsController> FsDecoratingController<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: FsController> FsController for FsDecoratingController<C> {
    fn model(&self) -> &Arc<FsModel> {
        self.inner.model()
    }

    fn stat(&self, path: &str) -> OpResult<Option<EntryStat>> {
        self.inner.stat(path)
    }

    fn list(&self, path: &str) -> OpResult<Vec<String>> {
        self.inner.list(path)
    }

    fn read(&self, path: &str) -> OpResult<Box<dyn EntryReader>> {
        self.inner.read(path)
    }

    fn write(&self, path: &str, data: Vec<u8>, mtime: Option<i64>) -> OpResult<()> {
        self.inner.write(path, data, mtime)
    }

    fn make_dir(&self, path: &str) -> OpResult<()> {
        self.inner.make_dir(path)
    }

    fn unlink(&self, path: &str) -> OpResult<()> {
        self.inner.unlink(path)
    }

    fn set_mtime(&self, path: &str, mtime: i64) -> OpResult<bool> {
        self.inner.set_mtime(path, mtime)
    }

    fn sync(&self) -> OpResult<()> {
        self.inner.sync()
    }

    fn reset(&self) -> OpResult<()> {
        self.inner.reset()
    }
}

/// In-memory image of a mounted archive file system.
struct ArchiveFs {
    codec: Option<Arc<RawZipFile>>,
    tree: BTreeMap<String, CovariantEntry>,
}

impl ArchiveFs {
    fn empty() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert(
            String::new(),
            CovariantEntry::new(
                String::new(),
                EntryType::Directory,
                FsEntryData::Virtual { mtime: None },
            ),
        );
        Self { codec: None, tree }
    }

    fn from_codec(codec: Arc<RawZipFile>, driver: &ZipDriver) -> Self {
        let mut fs = Self::empty();
        for entry in codec.entries() {
            let kind = entry.kind();
            let Ok(path) = driver.validate_name(entry.name().trim_end_matches('/')) else {
                log::warn!("skipping archive entry with unusable name {:?}", entry.name());
                continue;
            };
            if path.is_empty() {
                continue;
            }
            fs.insert(
                &path,
                kind,
                FsEntryData::Published {
                    entry: Arc::clone(entry),
                    mtime_override: None,
                },
            );
        }
        fs.codec = Some(codec);
        fs
    }

    fn split(path: &str) -> (&str, &str) {
        match path.rsplit_once('/') {
            Some((parent, base)) => (parent, base),
            None => ("", path),
        }
    }

    /// Make sure every ancestor of `path` exists as a directory and knows
    /// its child member.
    fn ensure_ancestors(&mut self, path: &str) {
        let (parent, base) = Self::split(path);
        if !parent.is_empty() {
            self.ensure_ancestors_dir(parent);
        }
        if let Some(members) = self
            .tree
            .get_mut(parent)
            .and_then(CovariantEntry::members_mut)
        {
            members.insert(base);
        }
    }

    fn ensure_ancestors_dir(&mut self, path: &str) {
        if let Some(entry) = self.tree.get_mut(path) {
            if !entry.has(EntryType::Directory) {
                entry.put(EntryType::Directory, FsEntryData::Virtual { mtime: None });
            }
        } else {
            self.ensure_ancestors(path);
            self.tree.insert(
                path.to_string(),
                CovariantEntry::new(
                    path.to_string(),
                    EntryType::Directory,
                    FsEntryData::Virtual { mtime: None },
                ),
            );
            return;
        }
        self.ensure_ancestors(path);
    }

    fn insert(&mut self, path: &str, kind: EntryType, data: FsEntryData) {
        self.ensure_ancestors(path);
        match self.tree.get_mut(path) {
            Some(entry) => entry.put(kind, data),
            None => {
                self.tree
                    .insert(path.to_string(), CovariantEntry::new(path.to_string(), kind, data));
            }
        }
    }

    fn remove(&mut self, path: &str) {
        self.tree.remove(path);
        let (parent, base) = Self::split(path);
        if let Some(members) = self
            .tree
            .get_mut(parent)
            .and_then(CovariantEntry::members_mut)
        {
            members.remove(base);
        }
    }
}

/// The driver-specific base controller of an archive file system.
///
/// Mounts the archive lazily through the codec, keeps a covariant entry
/// tree, stages mutations in memory, and flushes them into the parent file
/// system as a freshly written archive on sync. Locking is the lock
/// decorator's job; this controller only guards its own mount state.
pub struct ArchiveController {
    model: Arc<FsModel>,
    driver: ZipDriver,
    parent: Arc<dyn FsController>,
    state: Mutex<Option<ArchiveFs>>,
}

impl ArchiveController {
    pub fn new(model: Arc<FsModel>, driver: ZipDriver, parent: Arc<dyn FsController>) -> Self {
        Self {
            model,
            driver,
            parent,
            state: Mutex::new(None),
        }
    }

    fn member(&self) -> &str {
        self.model
            .mount_point()
            .member()
            .expect("archive file systems always have a parent")
    }

    /// Mount if necessary. Returns false when the archive does not exist
    /// in the parent and `create` was not requested.
    fn ensure_mounted(&self, state: &mut Option<ArchiveFs>, create: bool) -> OpResult<bool> {
        if let Some(fs) = state {
            if fs.codec.as_ref().is_some_and(|c| c.is_closed()) {
                // Invalidated under us; must be synchronized before remount.
                return Err(OpError::Retry(Retry::NeedsSync));
            }
            return Ok(true);
        }
        let member = self.member();
        match self.parent.stat(member)? {
            None => {
                if create {
                    *state = Some(ArchiveFs::empty());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(stat) if stat.kind == EntryType::Directory => {
                Err(FsError::NotAFile(member.to_string()).into())
            }
            Some(stat) => {
                let mut reader = self.parent.read(member)?;
                // The image is owned by the codec's source for the whole
                // mount, so it is not drawn from the staging pool.
                let mut buf = Vec::with_capacity(stat.size as usize);
                reader.read_to_end(&mut buf).map_err(FsError::Io)?;
                reader.close()?;
                let source = Arc::new(MemorySource::new(buf));
                match RawZipFile::mount(source, self.driver.zip_config()) {
                    Ok(codec) => {
                        if codec.has_redundant_entries() && self.driver.tolerates_redundancy() {
                            log::debug!("redundant entries in {member:?}, keeping last records");
                        }
                        *state = Some(ArchiveFs::from_codec(Arc::new(codec), &self.driver));
                        Ok(true)
                    }
                    Err(ZipError::Io(e)) => Err(FsError::Io(e).into()),
                    Err(cause) => Err(FsError::FalsePositive {
                        path: member.to_string(),
                        cause,
                    }
                    .into()),
                }
            }
        }
    }

    fn entry_mtime(&self, data: &FsEntryData) -> Option<i64> {
        match data {
            FsEntryData::Published {
                entry,
                mtime_override,
            } => Some(mtime_override.unwrap_or_else(|| {
                dos_to_unix_millis(entry.dos_time(), self.driver.tz_profile())
            })),
            FsEntryData::Staged { mtime, .. } => *mtime,
            FsEntryData::Virtual { mtime } => *mtime,
        }
    }

    /// The DOS timestamp an entry gets when written out.
    fn entry_dos_time(&self, data: &FsEntryData) -> Result<u32, ZipError> {
        match data {
            FsEntryData::Published {
                entry,
                mtime_override: None,
            } => Ok(entry.dos_time()),
            other => {
                let millis = self
                    .entry_mtime(other)
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                unix_millis_to_dos(millis, self.driver.tz_profile())
            }
        }
    }

    /// Read an entry's full content into `buf` for re-archiving.
    fn content_into(&self, fs: &ArchiveFs, data: &FsEntryData, buf: &mut Vec<u8>) -> OpResult<()> {
        match data {
            FsEntryData::Staged { data, .. } => {
                buf.extend_from_slice(data);
                Ok(())
            }
            FsEntryData::Published { entry, .. } => {
                let codec = fs
                    .codec
                    .as_ref()
                    .expect("published entries imply a mounted codec");
                let mut stream = codec
                    .open(entry.name(), true, true)?
                    .ok_or_else(|| FsError::NotFound(entry.name().to_string()))?;
                stream.read_to_end(buf).map_err(FsError::Io)?;
                stream.close().map_err(FsError::Zip)?;
                Ok(())
            }
            FsEntryData::Virtual { .. } => Ok(()),
        }
    }

    fn unlink_root(&self, state: &mut Option<ArchiveFs>) -> OpResult<()> {
        if self.model.is_touched() {
            return Err(OpError::Retry(Retry::NeedsSync));
        }
        if let Some(fs) = state {
            if fs.codec.as_ref().is_some_and(|c| c.busy()) {
                return Err(OpError::Retry(Retry::NeedsSync));
            }
        }
        self.parent.unlink(self.member())
    }
}

impl FsController for ArchiveController {
    fn model(&self) -> &Arc<FsModel> {
        &self.model
    }

    fn stat(&self, path: &str) -> OpResult<Option<EntryStat>> {
        let path = self.driver.validate_name(path)?;
        let mut state = self.state.lock();
        if !self.ensure_mounted(&mut state, false)? {
            return Ok(None);
        }
        let fs = state.as_ref().expect("just mounted");
        Ok(fs.tree.get(&path).map(|entry| {
            let data = entry.data();
            EntryStat {
                kind: entry.key(),
                size: data.size(),
                mtime: self.entry_mtime(data),
                types: entry.types(),
            }
        }))
    }

    fn list(&self, path: &str) -> OpResult<Vec<String>> {
        let path = self.driver.validate_name(path)?;
        let mut state = self.state.lock();
        if !self.ensure_mounted(&mut state, false)? {
            return Err(FsError::NotFound(path).into());
        }
        let fs = state.as_ref().expect("just mounted");
        let entry = fs
            .tree
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        match entry.members() {
            Some(members) => Ok(members.iter().map(str::to_string).collect()),
            None => Err(FsError::NotADirectory(path).into()),
        }
    }

    fn read(&self, path: &str) -> OpResult<Box<dyn EntryReader>> {
        let path = self.driver.validate_name(path)?;
        let mut state = self.state.lock();
        if !self.ensure_mounted(&mut state, false)? {
            return Err(FsError::NotFound(path).into());
        }
        let fs = state.as_ref().expect("just mounted");
        let entry = fs
            .tree
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        let data = entry
            .get(EntryType::File)
            .ok_or_else(|| FsError::NotAFile(path.clone()))?;
        match data {
            FsEntryData::Staged { data, .. } => Ok(Box::new(VecReader::new(Arc::clone(data)))),
            FsEntryData::Published { entry, .. } => {
                let codec = fs
                    .codec
                    .as_ref()
                    .expect("published entries imply a mounted codec");
                let stream = codec
                    .open(entry.name(), true, true)?
                    .ok_or_else(|| FsError::NotFound(path.clone()))?;
                Ok(Box::new(ZipStreamReader { stream }))
            }
            FsEntryData::Virtual { .. } => Ok(Box::new(VecReader::new(Arc::new(Vec::new())))),
        }
    }

    fn write(&self, path: &str, data: Vec<u8>, mtime: Option<i64>) -> OpResult<()> {
        let path = self.driver.validate_name(path)?;
        if path.is_empty() {
            return Err(FsError::NotAFile(path).into());
        }
        let mut state = self.state.lock();
        self.ensure_mounted(&mut state, true)?;
        let fs = state.as_mut().expect("just mounted");
        fs.insert(
            &path,
            EntryType::File,
            FsEntryData::Staged {
                data: Arc::new(data),
                mtime,
            },
        );
        self.model.set_touched(true);
        Ok(())
    }

    fn make_dir(&self, path: &str) -> OpResult<()> {
        let path = self.driver.validate_name(path)?;
        if path.is_empty() {
            return Err(FsError::AlreadyExists(path).into());
        }
        let mut state = self.state.lock();
        self.ensure_mounted(&mut state, true)?;
        let fs = state.as_mut().expect("just mounted");
        if fs.tree.get(&path).is_some_and(|e| e.has(EntryType::Directory)) {
            return Err(FsError::AlreadyExists(path).into());
        }
        let (parent, _) = ArchiveFs::split(&path);
        match fs.tree.get(parent) {
            Some(entry) if entry.has(EntryType::Directory) => {}
            Some(_) => return Err(FsError::NotADirectory(parent.to_string()).into()),
            None => return Err(FsError::NotFound(parent.to_string()).into()),
        }
        fs.insert(
            &path,
            EntryType::Directory,
            FsEntryData::Virtual {
                mtime: Some(chrono::Utc::now().timestamp_millis()),
            },
        );
        self.model.set_touched(true);
        Ok(())
    }

    fn unlink(&self, path: &str) -> OpResult<()> {
        let path = self.driver.validate_name(path)?;
        let mut state = self.state.lock();
        if path.is_empty() {
            return self.unlink_root(&mut state);
        }
        if !self.ensure_mounted(&mut state, false)? {
            return Err(FsError::NotFound(path).into());
        }
        let fs = state.as_mut().expect("just mounted");
        let entry = fs
            .tree
            .get(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if entry.members().is_some_and(|m| !m.is_empty()) {
            return Err(FsError::DirectoryNotEmpty(path).into());
        }
        let published = matches!(
            entry.get(EntryType::File),
            Some(FsEntryData::Published { .. })
        );
        if published && fs.codec.as_ref().is_some_and(|c| c.busy()) {
            return Err(FsError::Busy(path).into());
        }
        fs.remove(&path);
        self.model.set_touched(true);
        Ok(())
    }

    fn set_mtime(&self, path: &str, mtime: i64) -> OpResult<bool> {
        let path = self.driver.validate_name(path)?;
        let mut state = self.state.lock();
        if !self.ensure_mounted(&mut state, false)? {
            return Err(FsError::NotFound(path).into());
        }
        let fs = state.as_mut().expect("just mounted");
        let entry = fs
            .tree
            .get_mut(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        let key = entry.key();
        match entry.get_mut(key) {
            Some(FsEntryData::Published { mtime_override, .. }) => *mtime_override = Some(mtime),
            Some(FsEntryData::Staged { mtime: m, .. }) | Some(FsEntryData::Virtual { mtime: m }) => {
                *m = Some(mtime)
            }
            None => return Ok(false),
        }
        self.model.set_touched(true);
        Ok(true)
    }

    fn sync(&self) -> OpResult<()> {
        let mut state = self.state.lock();
        let Some(fs) = state.as_ref() else {
            self.model.set_touched(false);
            return Ok(());
        };
        if !self.model.is_touched() {
            return Ok(());
        }
        if fs.codec.as_ref().is_some_and(|c| c.busy()) {
            return Err(FsError::Busy(self.model.mount_point().to_string()).into());
        }

        let pool = self.driver.pool();
        let mut staging = pool.allocate();
        let mut out = RawZipOutput::new(pool.allocate());
        for (path, entry) in &fs.tree {
            if path.is_empty() {
                continue;
            }
            for kind in entry.types() {
                let data = entry.get(kind).expect("type listed by types()");
                let dos_time = self.entry_dos_time(data).map_err(FsError::Zip)?;
                match kind {
                    EntryType::Directory => {
                        out.put(&format!("{path}/"), CompressionMethod::Stored, dos_time, &[])
                            .map_err(FsError::Zip)?;
                    }
                    EntryType::File => {
                        staging.clear();
                        self.content_into(fs, data, &mut staging)?;
                        out.put(path, self.driver.method(), dos_time, &staging)
                            .map_err(FsError::Zip)?;
                    }
                    EntryType::Special => {
                        // No archive representation; dropped on sync.
                        log::warn!("dropping special entry {path:?} on sync");
                    }
                }
            }
        }
        pool.release(staging);
        let image = out.finish().map_err(FsError::Zip)?;

        self.parent.write(self.member(), image, None)?;
        if let Some(codec) = state.take().and_then(|fs| fs.codec) {
            codec.close();
        }
        self.model.set_touched(false);
        Ok(())
    }

    fn reset(&self) -> OpResult<()> {
        let mut state = self.state.lock();
        if let Some(codec) = state.take().and_then(|fs| fs.codec) {
            codec.close();
        }
        self.model.set_touched(false);
        Ok(())
    }
}
