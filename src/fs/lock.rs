use parking_lot::RawRwLock;
use parking_lot::lock_api::{RawRwLock as _, RawRwLockRecursiveTimed, RawRwLockTimed};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::controller::{EntryReader, EntryStat, FsController};
use super::error::{FsError, OpError, OpResult, Retry};
use super::model::FsModel;

/// How long a single lock acquisition may block before the operation is
/// bounced back to the retry boundary.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);

/// Total time the retry boundary keeps re-running an operation before
/// giving up with [`FsError::RetryTimeout`].
pub const RETRY_TIMEOUT: Duration = Duration::from_secs(3);

/// The reentrant read/write lock of one file system model.
///
/// Reads are recursive; writes are reentrant for the owning thread only.
/// A thread holding the write lock may take further read or write sections
/// freely. A thread holding only a read section that asks for the write
/// lock cannot upgrade; the acquisition times out and the operation is
/// reported as needing a retry with the write lock taken up front.
pub struct ModelLock {
    raw: RawRwLock,
    writer: parking_lot::Mutex<Option<ThreadId>>,
}

impl ModelLock {
    pub fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            writer: parking_lot::Mutex::new(None),
        }
    }

    fn held_exclusively_by_me(&self) -> bool {
        *self.writer.lock() == Some(thread::current().id())
    }

    /// Run `f` under the shared lock.
    pub fn with_read<T>(&self, f: impl FnOnce() -> T) -> Result<T, Retry> {
        if self.held_exclusively_by_me() {
            // The write lock subsumes read access.
            return Ok(f());
        }
        if !self.raw.try_lock_shared_recursive_for(ACQUIRE_TIMEOUT) {
            // Plain contention with a writer; no upgrade is involved.
            return Err(Retry::NeedsLockRetry);
        }
        let _release = SharedGuard(&self.raw);
        Ok(f())
    }

    /// Run `f` under the exclusive lock.
    pub fn with_write<T>(&self, f: impl FnOnce() -> T) -> Result<T, Retry> {
        if self.held_exclusively_by_me() {
            return Ok(f());
        }
        if !self.raw.try_lock_exclusive_for(ACQUIRE_TIMEOUT) {
            return Err(Retry::NeedsWriteLock);
        }
        *self.writer.lock() = Some(thread::current().id());
        let _release = ExclusiveGuard {
            lock: &self.raw,
            writer: &self.writer,
        };
        Ok(f())
    }
}

impl Default for ModelLock {
    fn default() -> Self {
        Self::new()
    }
}

struct SharedGuard<'a>(&'a RawRwLock);

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        // Paired with the successful try_lock_shared_recursive_for above.
        unsafe { self.0.unlock_shared() };
    }
}

struct ExclusiveGuard<'a> {
    lock: &'a RawRwLock,
    writer: &'a parking_lot::Mutex<Option<ThreadId>>,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        *self.writer.lock() = None;
        // Paired with the successful try_lock_exclusive_for above.
        unsafe { self.lock.unlock_exclusive() };
    }
}

/// Decorator serializing access to the decorated controller through the
/// model's lock: shared for inspection, exclusive for mutation and for
/// sync/reset. Lock timeouts surface as retry conditions, never as errors.
pub struct LockController<C: FsController> {
    inner: C,
}

impl<C: FsController> LockController<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    fn shared<T>(&self, f: impl FnOnce() -> OpResult<T>) -> OpResult<T> {
        match self.inner.model().lock().with_read(f) {
            Ok(result) => result,
            Err(retry) => Err(OpError::Retry(retry)),
        }
    }

    fn exclusive<T>(&self, f: impl FnOnce() -> OpResult<T>) -> OpResult<T> {
        match self.inner.model().lock().with_write(f) {
            Ok(result) => result,
            Err(retry) => Err(OpError::Retry(retry)),
        }
    }
}

impl<C: FsController> FsController for LockController<C> {
    fn model(&self) -> &Arc<FsModel> {
        self.inner.model()
    }

    fn stat(&self, path: &str) -> OpResult<Option<EntryStat>> {
        self.shared(|| self.inner.stat(path))
    }

    fn list(&self, path: &str) -> OpResult<Vec<String>> {
        self.shared(|| self.inner.list(path))
    }

    fn read(&self, path: &str) -> OpResult<Box<dyn EntryReader>> {
        self.shared(|| self.inner.read(path))
    }

    fn write(&self, path: &str, data: Vec<u8>, mtime: Option<i64>) -> OpResult<()> {
        self.exclusive(|| self.inner.write(path, data, mtime))
    }

    fn make_dir(&self, path: &str) -> OpResult<()> {
        self.exclusive(|| self.inner.make_dir(path))
    }

    fn unlink(&self, path: &str) -> OpResult<()> {
        self.exclusive(|| self.inner.unlink(path))
    }

    fn set_mtime(&self, path: &str, mtime: i64) -> OpResult<bool> {
        self.exclusive(|| self.inner.set_mtime(path, mtime))
    }

    fn sync(&self) -> OpResult<()> {
        self.exclusive(|| self.inner.sync())
    }

    fn reset(&self) -> OpResult<()> {
        self.exclusive(|| self.inner.reset())
    }
}

/// The retry boundary: re-runs `op` while it reports retry conditions,
/// letting `handle` resolve each condition (e.g. by synchronizing a
/// conflicting mount) between attempts. All locks must be released when
/// `op` returns, so each attempt starts from a clean slate.
pub fn retry_loop<T>(
    timeout: Duration,
    mut op: impl FnMut() -> OpResult<T>,
    mut handle: impl FnMut(Retry) -> Result<(), FsError>,
) -> Result<T, FsError> {
    let deadline = Instant::now() + timeout;
    let mut backoff = Duration::from_millis(1);
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(OpError::Fail(e)) => return Err(e),
            Err(OpError::Retry(retry)) => {
                if Instant::now() >= deadline {
                    return Err(FsError::RetryTimeout(retry));
                }
                log::trace!("retrying after {retry:?}");
                handle(retry)?;
                thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(50));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn read_sections_are_recursive() {
        let lock = ModelLock::new();
        let nested = lock
            .with_read(|| lock.with_read(|| 7).map_err(|_| ()))
            .expect("outer read");
        assert_eq!(nested, Ok(7));
    }

    #[test]
    fn write_section_is_reentrant_for_owner() {
        let lock = ModelLock::new();
        let out = lock
            .with_write(|| {
                let inner = lock.with_write(|| 1).expect("reentrant write");
                let read = lock.with_read(|| 2).expect("read under write");
                inner + read
            })
            .expect("outer write");
        assert_eq!(out, 3);
    }

    #[test]
    fn upgrade_attempt_times_out_as_retry() {
        let lock = ModelLock::new();
        let result = lock.with_read(|| lock.with_write(|| ())).expect("read");
        assert_eq!(result, Err(Retry::NeedsWriteLock));
    }

    #[test]
    fn contended_write_times_out_as_retry() {
        let lock = Arc::new(ModelLock::new());
        let held = Arc::clone(&lock);
        let (tx, rx) = std::sync::mpsc::channel();
        let holder = thread::spawn(move || {
            held.with_write(|| {
                tx.send(()).unwrap();
                thread::sleep(ACQUIRE_TIMEOUT * 3);
            })
            .unwrap();
        });
        rx.recv().unwrap();
        assert_eq!(lock.with_write(|| ()), Err(Retry::NeedsWriteLock));
        holder.join().unwrap();
    }

    #[test]
    fn contended_read_times_out_as_plain_retry() {
        let lock = Arc::new(ModelLock::new());
        let held = Arc::clone(&lock);
        let (tx, rx) = std::sync::mpsc::channel();
        let holder = thread::spawn(move || {
            held.with_write(|| {
                tx.send(()).unwrap();
                thread::sleep(ACQUIRE_TIMEOUT * 3);
            })
            .unwrap();
        });
        rx.recv().unwrap();
        // Not an upgrade: this thread holds nothing, the lock is merely
        // contended, so the condition must not demand the write lock.
        assert_eq!(lock.with_read(|| ()), Err(Retry::NeedsLockRetry));
        holder.join().unwrap();
    }

    #[test]
    fn retry_loop_resolves_conditions() {
        let attempts = AtomicUsize::new(0);
        let handled = AtomicUsize::new(0);
        let result = retry_loop(
            Duration::from_secs(1),
            || {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OpError::Retry(Retry::NeedsSync))
                } else {
                    Ok(42)
                }
            },
            |retry| {
                assert_eq!(retry, Retry::NeedsSync);
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(handled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retry_loop_times_out() {
        let result: Result<(), _> = retry_loop(
            Duration::from_millis(20),
            || Err(OpError::Retry(Retry::NeedsWriteLock)),
            |_| Ok(()),
        );
        assert!(matches!(result, Err(FsError::RetryTimeout(Retry::NeedsWriteLock))));
    }
}
