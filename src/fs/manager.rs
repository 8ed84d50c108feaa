use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::controller::FsController;
use super::driver::{FsCompositeDriver, FsDriver};
use super::error::{FsError, OpResult, Retry};
use super::host::HostDriver;
use super::lock::{RETRY_TIMEOUT, retry_loop};
use super::model::FsModel;
use super::mount::MountPoint;
use crate::chain::SyncErrorBuilder;

/// A registry slot for one mounted file system.
///
/// Untouched file systems are held weakly so that dropping the last
/// outside reference reclaims their memory; a touched file system is
/// pinned strongly until it has been synchronized, because its staged
/// state exists nowhere else.
enum Handle {
    Strong(Arc<dyn FsController>, Arc<FsModel>),
    Reclaimable(Weak<dyn FsController>, Weak<FsModel>),
}

impl Handle {
    fn controller(&self) -> Option<Arc<dyn FsController>> {
        match self {
            Handle::Strong(c, _) => Some(Arc::clone(c)),
            Handle::Reclaimable(c, _) => c.upgrade(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Handle::Strong(..) => true,
            Handle::Reclaimable(c, _) => c.strong_count() > 0,
        }
    }
}

struct ManagerInner {
    composite: FsCompositeDriver,
    host: Arc<dyn FsController>,
    registry: Mutex<BTreeMap<MountPoint, Handle>>,
}

impl ManagerInner {
    fn set_pinned(&self, mount: &MountPoint, pinned: bool) {
        let mut registry = self.registry.lock();
        let Some(handle) = registry.get_mut(mount) else {
            return;
        };
        match (pinned, &*handle) {
            (true, Handle::Reclaimable(c, m)) => {
                if let (Some(c), Some(m)) = (c.upgrade(), m.upgrade()) {
                    log::debug!("pinning touched file system {mount}");
                    *handle = Handle::Strong(c, m);
                }
            }
            (false, Handle::Strong(c, m)) => {
                log::debug!("releasing clean file system {mount}");
                *handle = Handle::Reclaimable(Arc::downgrade(c), Arc::downgrade(m));
            }
            _ => {}
        }
    }
}

/// The federation point: hands out controllers for mount points, keeping
/// at most one live controller per canonical address, and synchronizes
/// the whole federation children-first.
pub struct FsManager {
    inner: Arc<ManagerInner>,
}

impl FsManager {
    pub fn new(composite: FsCompositeDriver, host: HostDriver) -> Result<Self, FsError> {
        let host_model = FsModel::new(MountPoint::host(), None);
        let host = host.new_controller(host_model, None)?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                composite,
                host,
                registry: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    pub fn composite(&self) -> &FsCompositeDriver {
        &self.inner.composite
    }

    /// The controller for `mount`, building it (and its ancestors) on
    /// first use. Two lookups of equivalent addresses share one
    /// controller while it is alive.
    pub fn controller(&self, mount: &MountPoint) -> Result<Arc<dyn FsController>, FsError> {
        let Some(parent_mount) = mount.parent() else {
            return Ok(Arc::clone(&self.inner.host));
        };
        if let Some(existing) = self.lookup(mount) {
            return Ok(existing);
        }

        let parent = self.controller(parent_mount)?;
        let parent_model = Arc::clone(parent.model());
        let driver = Arc::clone(self.inner.composite.get(mount.scheme())?);

        let model = FsModel::new(mount.clone(), Some(parent_model));
        let weak_inner = Arc::downgrade(&self.inner);
        let hook_mount = mount.clone();
        model.set_touch_hook(Box::new(move |pinned| {
            if let Some(inner) = weak_inner.upgrade() {
                inner.set_pinned(&hook_mount, pinned);
            }
        }));
        let controller = driver.new_controller(Arc::clone(&model), Some(parent))?;

        let mut registry = self.inner.registry.lock();
        // Another thread may have won the race while we were building.
        if let Some(existing) = registry.get(mount).and_then(Handle::controller) {
            return Ok(existing);
        }
        registry.insert(
            mount.clone(),
            Handle::Reclaimable(Arc::downgrade(&controller), Arc::downgrade(&model)),
        );
        Ok(controller)
    }

    fn lookup(&self, mount: &MountPoint) -> Option<Arc<dyn FsController>> {
        self.inner.registry.lock().get(mount).and_then(Handle::controller)
    }

    /// Number of live registered file systems (excluding the host).
    pub fn len(&self) -> usize {
        self.inner
            .registry
            .lock()
            .values()
            .filter(|h| h.is_alive())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronize every registered file system, children before parents,
    /// so a nested archive's image lands in its parent before the parent
    /// itself is flushed.
    ///
    /// Failures are collected instead of aborting the sweep; the result
    /// aggregates them with the highest-priority failure first.
    pub fn sync_all(&self) -> Result<(), FsError> {
        let controllers: Vec<(MountPoint, Arc<dyn FsController>)> = {
            let registry = self.inner.registry.lock();
            registry
                .iter()
                .rev()
                .filter_map(|(mount, handle)| {
                    handle.controller().map(|c| (mount.clone(), c))
                })
                .collect()
        };

        let mut builder = SyncErrorBuilder::new();
        for (mount, controller) in controllers {
            let result = retry_loop(RETRY_TIMEOUT, || controller.sync(), |_| Ok(()));
            if let Err(e) = result {
                log::warn!("failed to sync {mount}: {e}");
                let priority = e.priority();
                builder.push(e, priority);
            }
        }
        self.inner.registry.lock().retain(|_, handle| handle.is_alive());

        builder.finish().map_err(FsError::Sync)
    }

    /// Run `op` at the retry boundary: retry conditions trigger a
    /// federation-wide sync (for [`Retry::NeedsSync`]) and a bounded
    /// re-attempt instead of surfacing to the caller.
    pub fn with_retry<T>(&self, op: impl FnMut() -> OpResult<T>) -> Result<T, FsError> {
        retry_loop(RETRY_TIMEOUT, op, |retry| match retry {
            Retry::NeedsSync => self.sync_all(),
            Retry::NeedsWriteLock | Retry::NeedsLockRetry => Ok(()),
        })
    }
}
