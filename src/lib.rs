//! # nestzip
//!
//! Path-based access to entries inside ZIP archives, including archives
//! nested within other archives.
//!
//! The crate is layered: the `zip` module is a self-contained archive
//! codec (central directory parsing, ZIP64, checked content streams, an
//! archive writer); the `fs` module turns mounted archives into a
//! federation of virtual file systems with a manager that caches one
//! controller per archive and synchronizes pending changes children-first;
//! the `chain` module aggregates the failures of such a sweep into one
//! priority-ordered error.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use nestzip::fs::{FsCompositeDriver, FsManager, HostDriver, MountPoint, ZipDriver};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut composite = FsCompositeDriver::new();
//!     composite.register("zip", Arc::new(ZipDriver::new()));
//!     let manager = FsManager::new(composite, HostDriver::new(PathBuf::from("/")))?;
//!
//!     // Address a file inside an archive inside another archive.
//!     let host = MountPoint::host();
//!     let outer = MountPoint::nested(&host, "tmp/outer.zip", "zip");
//!     let inner = MountPoint::nested(&outer, "inner.zip", "zip");
//!     let controller = manager.controller(&inner)?;
//!
//!     let names = manager.with_retry(|| controller.list(""))?;
//!     for name in names {
//!         println!("{name}");
//!     }
//!
//!     // Flush any pending changes, innermost archives first.
//!     manager.sync_all()?;
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod cli;
pub mod fs;
pub mod io;
pub mod zip;

pub use cli::Cli;
pub use fs::{FsController, FsManager, MountPoint};
pub use io::ReadAt;
pub use zip::{RawZipFile, RawZipOutput, ZipConfig, ZipError};
