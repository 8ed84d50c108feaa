use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::chain::{PRIORITY_ERROR, PRIORITY_WARN, SyncError};
use crate::zip::ZipError;

/// Errors raised by file system operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry: {0:?}")]
    NotFound(String),

    #[error("entry already exists: {0:?}")]
    AlreadyExists(String),

    #[error("not a directory: {0:?}")]
    NotADirectory(String),

    #[error("not a file: {0:?}")]
    NotAFile(String),

    #[error("directory not empty: {0:?}")]
    DirectoryNotEmpty(String),

    #[error("invalid entry name: {0:?}")]
    InvalidName(String),

    /// The entry (or the whole archive) has open streams.
    #[error("entry is busy: {0:?}")]
    Busy(String),

    #[error("file system is closed")]
    Closed,

    /// No driver is registered for the mount point's scheme. This is a
    /// configuration error, not a per-call condition.
    #[error("no driver registered for scheme {0:?}")]
    NoDriver(String),

    /// The target matched an archive naming convention but its content is
    /// not a valid archive.
    #[error("{path:?} is not a valid archive")]
    FalsePositive {
        path: String,
        #[source]
        cause: ZipError,
    },

    #[error(transparent)]
    Zip(#[from] ZipError),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// Aggregated failures from a manager-wide synchronization sweep.
    #[error("synchronization failed: {0}")]
    Sync(Arc<SyncError>),

    /// A retry condition persisted past the bounded retry loop's timeout.
    #[error("operation timed out retrying on {0:?}")]
    RetryTimeout(Retry),
}

impl FsError {
    /// Priority used when this error is recorded into a sync error chain.
    /// Busy archives were merely skipped and can be synchronized later.
    pub fn priority(&self) -> i32 {
        match self {
            FsError::Busy(_) => PRIORITY_WARN,
            _ => PRIORITY_ERROR,
        }
    }
}

/// Control-flow conditions consumed by the retry loop at the call boundary.
///
/// These are not failures: they signal that the operation must be retried
/// after locks have been released (and possibly after a sync), and they
/// must never be logged as errors or leak past the retry boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// A conflicting in-flight mount must be synchronized first.
    NeedsSync,
    /// The operation needs the model's write lock, typically while the
    /// current thread still holds only the read lock.
    NeedsWriteLock,
    /// A contended lock could not be acquired in time. No remedy is
    /// required beyond releasing held locks and backing off.
    NeedsLockRetry,
}

/// Outcome of a controller operation: a genuine failure or a retry
/// condition. Keeping the two apart in the type means a recoverable control
/// signal can never be mistaken for a real error.
#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Fail(#[from] FsError),

    #[error("retry required: {0:?}")]
    Retry(Retry),
}

impl From<ZipError> for OpError {
    fn from(e: ZipError) -> Self {
        OpError::Fail(FsError::Zip(e))
    }
}

impl From<io::Error> for OpError {
    fn from(e: io::Error) -> Self {
        OpError::Fail(FsError::Io(e))
    }
}

pub type OpResult<T> = Result<T, OpError>;
