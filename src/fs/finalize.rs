use std::io::{self, Read};
use std::sync::Arc;

use super::controller::{EntryReader, EntryStat, FsController};
use super::error::{OpError, OpResult};
use super::model::FsModel;

/// Decorator that force-closes leaked entry streams.
///
/// A reader dropped without an explicit close still releases its codec
/// resources here; the outcome is logged instead of surfaced, since there
/// is no caller left to report to. Retry conditions raised by a close are
/// control flow, not failures, and are never logged as errors.
pub struct FinalizeController<C: FsController> {
    inner: C,
}

impl<C: FsController> FinalizeController<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: FsController> FsController for FinalizeController<C> {
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
        let inner = self.inner.read(path)?;
        Ok(Box::new(FinalizedReader {
            inner,
            path: path.to_string(),
            closed: false,
        }))
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

struct FinalizedReader {
    inner: Box<dyn EntryReader>,
    path: String,
    closed: bool,
}

impl Read for FinalizedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl EntryReader for FinalizedReader {
    fn close(&mut self) -> OpResult<()> {
        self.closed = true;
        self.inner.close()
    }
}

impl Drop for FinalizedReader {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match self.inner.close() {
            Ok(()) => log::debug!("finalized leaked stream for {:?}", self.path),
            Err(OpError::Retry(retry)) => {
                log::debug!("finalizing {:?} deferred on {retry:?}", self.path)
            }
            Err(OpError::Fail(e)) => {
                log::warn!("failed to finalize leaked stream for {:?}: {e}", self.path)
            }
        }
    }
}
