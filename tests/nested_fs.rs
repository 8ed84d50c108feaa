//! End-to-end tests of the federated file system over nested archives on
//! disk.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use nestzip::fs::{
    EntryReader, EntryStat, FsCompositeDriver, FsController, FsDriver, FsError, FsManager,
    HostDriver, MountPoint, OpResult, ZipDriver,
};
use nestzip::io::MemorySource;
use nestzip::zip::{CompressionMethod, EntryType, RawZipFile, RawZipOutput, ZipConfig};

fn inner_zip() -> Vec<u8> {
    let mut out = RawZipOutput::new(Vec::new());
    out.put(
        "greeting.txt",
        CompressionMethod::Deflated,
        0x2100,
        b"hello from the inside",
    )
    .unwrap();
    out.finish().unwrap()
}

fn outer_zip() -> Vec<u8> {
    let mut out = RawZipOutput::new(Vec::new());
    out.put("readme.txt", CompressionMethod::Stored, 0x2100, b"read me")
        .unwrap();
    out.put("inner.zip", CompressionMethod::Stored, 0x2100, &inner_zip())
        .unwrap();
    out.finish().unwrap()
}

fn manager_for(root: &Path) -> FsManager {
    let mut composite = FsCompositeDriver::new();
    composite.register("zip", Arc::new(ZipDriver::new()));
    FsManager::new(composite, HostDriver::new(root.to_path_buf())).unwrap()
}

fn read_all(manager: &FsManager, ctrl: &Arc<dyn FsController>, path: &str) -> Vec<u8> {
    let mut reader = manager.with_retry(|| ctrl.read(path)).unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).unwrap();
    reader.close().unwrap();
    buf
}

#[test]
fn reads_entries_across_two_nesting_levels() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("outer.zip"), outer_zip()).unwrap();
    let manager = manager_for(dir.path());

    let host = MountPoint::host();
    let outer = MountPoint::nested(&host, "outer.zip", "zip");
    let inner = MountPoint::nested(&outer, "inner.zip", "zip");

    let outer_ctrl = manager.controller(&outer).unwrap();
    assert_eq!(read_all(&manager, &outer_ctrl, "readme.txt"), b"read me");
    let names = manager.with_retry(|| outer_ctrl.list("")).unwrap();
    assert_eq!(names, vec!["readme.txt", "inner.zip"]);

    let inner_ctrl = manager.controller(&inner).unwrap();
    assert_eq!(
        read_all(&manager, &inner_ctrl, "greeting.txt"),
        b"hello from the inside"
    );

    let stat = manager
        .with_retry(|| inner_ctrl.stat("greeting.txt"))
        .unwrap()
        .unwrap();
    assert_eq!(stat.kind, EntryType::File);
    assert_eq!(stat.size, 21);
}

#[test]
fn equivalent_addresses_share_one_controller() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("outer.zip"), outer_zip()).unwrap();
    let manager = manager_for(dir.path());

    let host = MountPoint::host();
    let a = MountPoint::nested(&host, "outer.zip", "zip");
    let b = MountPoint::nested(&host, "./outer.zip", "zip");
    let ctrl_a = manager.controller(&a).unwrap();
    let ctrl_b = manager.controller(&b).unwrap();
    assert!(Arc::ptr_eq(&ctrl_a, &ctrl_b));
    assert_eq!(manager.len(), 1);
}

#[test]
fn writes_flush_through_every_enclosing_archive() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("outer.zip"), outer_zip()).unwrap();

    {
        let manager = manager_for(dir.path());
        let host = MountPoint::host();
        let outer = MountPoint::nested(&host, "outer.zip", "zip");
        let inner = MountPoint::nested(&outer, "inner.zip", "zip");
        let inner_ctrl = manager.controller(&inner).unwrap();

        manager
            .with_retry(|| {
                inner_ctrl.write("added/note.txt", b"staged then synced".to_vec(), None)
            })
            .unwrap();
        // Staged content is visible before any sync.
        assert_eq!(
            read_all(&manager, &inner_ctrl, "added/note.txt"),
            b"staged then synced"
        );
        manager.sync_all().unwrap();
    }

    // A fresh federation sees the change persisted on disk.
    let manager = manager_for(dir.path());
    let host = MountPoint::host();
    let outer = MountPoint::nested(&host, "outer.zip", "zip");
    let inner = MountPoint::nested(&outer, "inner.zip", "zip");
    let inner_ctrl = manager.controller(&inner).unwrap();
    assert_eq!(
        read_all(&manager, &inner_ctrl, "added/note.txt"),
        b"staged then synced"
    );
    assert_eq!(
        read_all(&manager, &inner_ctrl, "greeting.txt"),
        b"hello from the inside"
    );
    let outer_ctrl = manager.controller(&outer).unwrap();
    assert_eq!(read_all(&manager, &outer_ctrl, "readme.txt"), b"read me");

    // And so does the raw codec, independent of the file system layer.
    let outer_bytes = std::fs::read(dir.path().join("outer.zip")).unwrap();
    let outer_raw =
        RawZipFile::mount(Arc::new(MemorySource::new(outer_bytes)), ZipConfig::default()).unwrap();
    let mut stream = outer_raw.open("inner.zip", true, true).unwrap().unwrap();
    let mut inner_bytes = Vec::new();
    stream.read_to_end(&mut inner_bytes).unwrap();
    stream.close().unwrap();
    let inner_raw =
        RawZipFile::mount(Arc::new(MemorySource::new(inner_bytes)), ZipConfig::default()).unwrap();
    assert!(inner_raw.entry("added/note.txt").is_some());
}

#[test]
fn touched_file_systems_survive_dropped_handles() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("outer.zip"), outer_zip()).unwrap();
    let manager = manager_for(dir.path());

    let host = MountPoint::host();
    let outer = MountPoint::nested(&host, "outer.zip", "zip");
    {
        let ctrl = manager.controller(&outer).unwrap();
        manager
            .with_retry(|| ctrl.write("pending.txt", b"pinned".to_vec(), None))
            .unwrap();
    }
    // The handle is gone, but the touched file system must still be there.
    let ctrl = manager.controller(&outer).unwrap();
    assert_eq!(read_all(&manager, &ctrl, "pending.txt"), b"pinned");
    manager.sync_all().unwrap();
}

#[test]
fn unlinking_a_touched_archive_requires_a_sync_first() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("outer.zip"), outer_zip()).unwrap();
    let manager = manager_for(dir.path());

    let host = MountPoint::host();
    let outer = MountPoint::nested(&host, "outer.zip", "zip");
    let inner = MountPoint::nested(&outer, "inner.zip", "zip");
    let inner_ctrl = manager.controller(&inner).unwrap();

    manager
        .with_retry(|| inner_ctrl.write("last.txt", b"x".to_vec(), None))
        .unwrap();

    // The retry boundary resolves the conflict by synchronizing, then the
    // root unlink deletes the nested archive from its parent.
    manager.with_retry(|| inner_ctrl.unlink("")).unwrap();
    manager.sync_all().unwrap();

    let manager = manager_for(dir.path());
    let outer_ctrl = manager.controller(&outer).unwrap();
    let names = manager.with_retry(|| outer_ctrl.list("")).unwrap();
    assert_eq!(names, vec!["readme.txt"]);
}

#[test]
fn directory_semantics_inside_archives() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("outer.zip"), outer_zip()).unwrap();
    let manager = manager_for(dir.path());

    let host = MountPoint::host();
    let outer = MountPoint::nested(&host, "outer.zip", "zip");
    let ctrl = manager.controller(&outer).unwrap();

    manager.with_retry(|| ctrl.make_dir("docs")).unwrap();
    assert!(matches!(
        manager.with_retry(|| ctrl.make_dir("docs")),
        Err(FsError::AlreadyExists(_))
    ));
    assert!(matches!(
        manager.with_retry(|| ctrl.make_dir("missing/sub")),
        Err(FsError::NotFound(_))
    ));

    manager
        .with_retry(|| ctrl.write("docs/a.txt", b"a".to_vec(), None))
        .unwrap();
    assert!(matches!(
        manager.with_retry(|| ctrl.unlink("docs")),
        Err(FsError::DirectoryNotEmpty(_))
    ));
    manager.with_retry(|| ctrl.unlink("docs/a.txt")).unwrap();
    manager.with_retry(|| ctrl.unlink("docs")).unwrap();
    manager.sync_all().unwrap();
}

#[test]
fn non_archives_are_false_positives() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fake.zip"), b"this is not an archive").unwrap();
    let manager = manager_for(dir.path());

    let host = MountPoint::host();
    let fake = MountPoint::nested(&host, "fake.zip", "zip");
    let ctrl = manager.controller(&fake).unwrap();
    assert!(matches!(
        manager.with_retry(|| ctrl.stat("anything")),
        Err(FsError::FalsePositive { .. })
    ));
}

#[test]
fn modification_times_round_trip_through_sync() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("outer.zip"), outer_zip()).unwrap();
    let manager = manager_for(dir.path());

    let host = MountPoint::host();
    let outer = MountPoint::nested(&host, "outer.zip", "zip");
    // 2020-02-02 12:00:00 UTC, an even-second time DOS can represent.
    let mtime = 1_580_644_800_000;
    {
        let ctrl = manager.controller(&outer).unwrap();
        manager
            .with_retry(|| ctrl.write("stamped.txt", b"t".to_vec(), Some(mtime)))
            .unwrap();
        manager.sync_all().unwrap();
    }

    let manager = manager_for(dir.path());
    let ctrl = manager.controller(&outer).unwrap();
    let stat = manager
        .with_retry(|| ctrl.stat("stamped.txt"))
        .unwrap()
        .unwrap();
    // DOS times are local and two-second granular; allow a day of slack for
    // the timezone profile without hiding gross errors.
    let delta = (stat.mtime.unwrap() - mtime).abs();
    assert!(delta < 24 * 3600 * 1000, "mtime drifted by {delta} ms");
}

/// Driver double that records every sync in federation order.
struct RecordingDriver {
    inner: ZipDriver,
    log: Arc<Mutex<Vec<String>>>,
}

struct RecordingController {
    inner: Arc<dyn FsController>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FsDriver for RecordingDriver {
    fn new_controller(
        &self,
        model: Arc<nestzip::fs::FsModel>,
        parent: Option<Arc<dyn FsController>>,
    ) -> Result<Arc<dyn FsController>, FsError> {
        let inner = self.inner.new_controller(model, parent)?;
        Ok(Arc::new(RecordingController {
            inner,
            log: Arc::clone(&self.log),
        }))
    }
}

impl FsController for RecordingController {
    fn model(&self) -> &Arc<nestzip::fs::FsModel> {
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
        self.log
            .lock()
            .push(self.inner.model().mount_point().to_string());
        self.inner.sync()
    }

    fn reset(&self) -> OpResult<()> {
        self.inner.reset()
    }
}

#[test]
fn sync_sweeps_children_before_parents() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("outer.zip"), outer_zip()).unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut composite = FsCompositeDriver::new();
    composite.register(
        "zip",
        Arc::new(RecordingDriver {
            inner: ZipDriver::new(),
            log: Arc::clone(&log),
        }),
    );
    let manager =
        FsManager::new(composite, HostDriver::new(dir.path().to_path_buf())).unwrap();

    let host = MountPoint::host();
    let outer = MountPoint::nested(&host, "outer.zip", "zip");
    let inner = MountPoint::nested(&outer, "inner.zip", "zip");
    let outer_ctrl = manager.controller(&outer).unwrap();
    let inner_ctrl = manager.controller(&inner).unwrap();

    manager
        .with_retry(|| outer_ctrl.write("o.txt", b"o".to_vec(), None))
        .unwrap();
    manager
        .with_retry(|| inner_ctrl.write("i.txt", b"i".to_vec(), None))
        .unwrap();

    log.lock().clear();
    manager.sync_all().unwrap();

    let order = log.lock().clone();
    let inner_pos = order.iter().position(|a| a.as_str() == inner.address());
    let outer_pos = order.iter().position(|a| a.as_str() == outer.address());
    assert!(inner_pos.is_some() && outer_pos.is_some(), "order: {order:?}");
    assert!(inner_pos < outer_pos, "order: {order:?}");
}
