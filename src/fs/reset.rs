use std::sync::Arc;

use super::controller::{EntryReader, EntryStat, FsController};
use super::error::{FsError, OpError, OpResult};
use super::model::FsModel;

/// Decorator that drops cached archive state once the archive file itself
/// is gone.
///
/// Unlinking the root entry removes the archive file from the parent file
/// system; any mounted image kept beyond that would resurrect stale
/// content on the next access. The same applies when the target turned out
/// not to be an archive at all: resetting lets a later access re-probe it.
pub struct ResetController<C: FsController> {
    inner: C,
}

impl<C: FsController> ResetController<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: FsController> FsController for ResetController<C> {
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
        let result = self.inner.unlink(path);
        if path.is_empty() {
            match &result {
                Ok(()) | Err(OpError::Fail(FsError::FalsePositive { .. })) => {
                    self.inner.reset()?;
                }
                _ => {}
            }
        }
        result
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
