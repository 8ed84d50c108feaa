use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::controller::{EntryReader, EntryStat, FsController};
use super::driver::FsDriver;
use super::error::{FsError, OpResult};
use super::model::FsModel;
use crate::zip::EntryType;

/// Controller for the outermost, non-federated file system, backed by the
/// platform file system below a root directory.
pub struct HostController {
    model: Arc<FsModel>,
    root: PathBuf,
}

impl HostController {
    pub fn new(model: Arc<FsModel>, root: PathBuf) -> Self {
        Self { model, root }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let mut resolved = self.root.clone();
        for seg in path.split('/') {
            match seg {
                "" | "." => continue,
                ".." => return Err(FsError::InvalidName(path.to_string())),
                _ => resolved.push(seg),
            }
        }
        Ok(resolved)
    }

    fn map_io(path: &str, e: io::Error) -> FsError {
        match e.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
            io::ErrorKind::NotADirectory => FsError::NotADirectory(path.to_string()),
            io::ErrorKind::DirectoryNotEmpty => FsError::DirectoryNotEmpty(path.to_string()),
            _ => FsError::Io(e),
        }
    }
}

fn system_time_to_millis(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn millis_to_system_time(millis: i64) -> SystemTime {
    if millis >= 0 {
        UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

fn kind_of(meta: &fs::Metadata) -> EntryType {
    if meta.is_dir() {
        EntryType::Directory
    } else if meta.is_file() {
        EntryType::File
    } else {
        EntryType::Special
    }
}

struct HostReader {
    file: fs::File,
}

impl Read for HostReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl EntryReader for HostReader {
    fn close(&mut self) -> OpResult<()> {
        Ok(())
    }
}

impl FsController for HostController {
    fn model(&self) -> &Arc<FsModel> {
        &self.model
    }

    fn stat(&self, path: &str) -> OpResult<Option<EntryStat>> {
        let target = self.resolve(path)?;
        match fs::metadata(&target) {
            Ok(meta) => {
                let kind = kind_of(&meta);
                Ok(Some(EntryStat {
                    kind,
                    size: meta.len(),
                    mtime: meta.modified().ok().map(system_time_to_millis),
                    types: vec![kind],
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::map_io(path, e).into()),
        }
    }

    fn list(&self, path: &str) -> OpResult<Vec<String>> {
        let target = self.resolve(path)?;
        let mut names = Vec::new();
        for dirent in fs::read_dir(&target).map_err(|e| Self::map_io(path, e))? {
            let dirent = dirent.map_err(FsError::Io)?;
            names.push(dirent.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, path: &str) -> OpResult<Box<dyn EntryReader>> {
        let target = self.resolve(path)?;
        let file = fs::File::open(&target).map_err(|e| Self::map_io(path, e))?;
        Ok(Box::new(HostReader { file }))
    }

    fn write(&self, path: &str, data: Vec<u8>, mtime: Option<i64>) -> OpResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            if parent.starts_with(&self.root) && parent != self.root {
                fs::create_dir_all(parent).map_err(|e| Self::map_io(path, e))?;
            }
        }
        fs::write(&target, &data).map_err(|e| Self::map_io(path, e))?;
        if let Some(millis) = mtime {
            set_file_mtime(&target, millis).map_err(|e| Self::map_io(path, e))?;
        }
        Ok(())
    }

    fn make_dir(&self, path: &str) -> OpResult<()> {
        let target = self.resolve(path)?;
        fs::create_dir(&target).map_err(|e| Self::map_io(path, e))?;
        Ok(())
    }

    fn unlink(&self, path: &str) -> OpResult<()> {
        if path.is_empty() {
            return Err(FsError::InvalidName(path.to_string()).into());
        }
        let target = self.resolve(path)?;
        let meta = fs::metadata(&target).map_err(|e| Self::map_io(path, e))?;
        if meta.is_dir() {
            fs::remove_dir(&target).map_err(|e| Self::map_io(path, e))?;
        } else {
            fs::remove_file(&target).map_err(|e| Self::map_io(path, e))?;
        }
        Ok(())
    }

    fn set_mtime(&self, path: &str, mtime: i64) -> OpResult<bool> {
        let target = self.resolve(path)?;
        match set_file_mtime(&target, mtime) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Unsupported => Ok(false),
            Err(e) => Err(Self::map_io(path, e).into()),
        }
    }

    fn sync(&self) -> OpResult<()> {
        Ok(())
    }

    fn reset(&self) -> OpResult<()> {
        Ok(())
    }
}

fn set_file_mtime(target: &Path, millis: i64) -> io::Result<()> {
    let file = fs::File::options().write(true).open(target)?;
    file.set_modified(millis_to_system_time(millis))
}

/// Driver producing [`HostController`]s rooted at a fixed directory.
pub struct HostDriver {
    root: PathBuf,
}

impl HostDriver {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl FsDriver for HostDriver {
    fn new_controller(
        &self,
        model: Arc<FsModel>,
        parent: Option<Arc<dyn FsController>>,
    ) -> Result<Arc<dyn FsController>, FsError> {
        debug_assert!(model.parent().is_none(), "the host file system has no parent");
        debug_assert!(parent.is_none());
        Ok(Arc::new(HostController::new(model, self.root.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mount::MountPoint;

    fn host(root: &Path) -> HostController {
        HostController::new(FsModel::new(MountPoint::host(), None), root.to_path_buf())
    }

    #[test]
    fn roundtrip_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = host(dir.path());
        ctrl.write("sub/file.txt", b"hello".to_vec(), Some(1_600_000_000_000))
            .unwrap();
        let stat = ctrl.stat("sub/file.txt").unwrap().unwrap();
        assert_eq!(stat.kind, EntryType::File);
        assert_eq!(stat.size, 5);
        assert_eq!(stat.mtime, Some(1_600_000_000_000));

        let mut reader = ctrl.read("sub/file.txt").unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        reader.close().unwrap();
        assert_eq!(buf, b"hello");

        assert_eq!(ctrl.list("sub").unwrap(), vec!["file.txt"]);
        assert!(ctrl.stat("missing").unwrap().is_none());
    }

    #[test]
    fn unlink_refuses_nonempty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = host(dir.path());
        ctrl.make_dir("d").unwrap();
        ctrl.write("d/x", b"1".to_vec(), None).unwrap();
        assert!(matches!(
            ctrl.unlink("d"),
            Err(crate::fs::error::OpError::Fail(FsError::DirectoryNotEmpty(_)))
        ));
        ctrl.unlink("d/x").unwrap();
        ctrl.unlink("d").unwrap();
        assert!(ctrl.stat("d").unwrap().is_none());
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = host(dir.path());
        assert!(matches!(
            ctrl.read("../etc/passwd"),
            Err(crate::fs::error::OpError::Fail(FsError::InvalidName(_)))
        ));
    }
}
