//! The federated file system layer.
//!
//! Each mounted archive is a file system of its own, addressed by a
//! [`MountPoint`] whose canonical address chains through every enclosing
//! archive. A [`FsModel`] carries the shared state of one such file
//! system; a [`FsController`] implements its operations. Archive
//! controllers are decorated bottom-up with locking, reset-on-removal and
//! stream finalization, and the [`FsManager`] federates all of them,
//! handing out at most one live controller per address and synchronizing
//! children before parents.

pub mod controller;
pub mod driver;
pub mod entry;
pub mod error;
pub mod finalize;
pub mod host;
pub mod lock;
pub mod manager;
pub mod model;
pub mod mount;
pub mod reset;

pub use controller::{EntryReader, EntryStat, FsController};
pub use driver::{FsCompositeDriver, FsDriver, ZipDriver};
pub use error::{FsError, OpError, OpResult, Retry};
pub use host::HostDriver;
pub use manager::FsManager;
pub use model::FsModel;
pub use mount::MountPoint;
