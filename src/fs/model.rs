use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::lock::ModelLock;
use super::mount::MountPoint;

type TouchHook = Box<dyn Fn(bool) + Send + Sync>;

/// One file system model per mount point.
///
/// Identity is by reference: two models are the same file system only if
/// they are the same object. The `touched` flag means "has unflushed state;
/// must not be discarded without synchronizing" and drives the manager's
/// strong/reclaimable registry handling through the touch hook.
pub struct FsModel {
    mount: MountPoint,
    parent: Option<Arc<FsModel>>,
    touched: AtomicBool,
    lock: ModelLock,
    on_touch: Mutex<Option<TouchHook>>,
}

impl FsModel {
    pub fn new(mount: MountPoint, parent: Option<Arc<FsModel>>) -> Arc<Self> {
        debug_assert_eq!(mount.parent().is_some(), parent.is_some());
        Arc::new(Self {
            mount,
            parent,
            touched: AtomicBool::new(false),
            lock: ModelLock::new(),
            on_touch: Mutex::new(None),
        })
    }

    pub fn mount_point(&self) -> &MountPoint {
        &self.mount
    }

    pub fn parent(&self) -> Option<&Arc<FsModel>> {
        self.parent.as_ref()
    }

    /// The read/write lock shared by all controllers decorating this model.
    pub fn lock(&self) -> &ModelLock {
        &self.lock
    }

    pub fn is_touched(&self) -> bool {
        self.touched.load(Ordering::SeqCst)
    }

    /// Flip the touched flag, notifying the registered hook on a real
    /// transition.
    pub fn set_touched(&self, state: bool) {
        if self.touched.swap(state, Ordering::SeqCst) != state {
            if let Some(hook) = self.on_touch.lock().as_ref() {
                hook(state);
            }
        }
    }

    /// Install the manager's touch observer.
    pub fn set_touch_hook(&self, hook: TouchHook) {
        *self.on_touch.lock() = Some(hook);
    }
}

impl PartialEq for FsModel {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for FsModel {}

impl Hash for FsModel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self as *const FsModel as usize).hash(state);
    }
}

impl fmt::Debug for FsModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsModel")
            .field("mount", &self.mount)
            .field("touched", &self.is_touched())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_identity() {
        let host = MountPoint::host();
        let a = FsModel::new(host.clone(), None);
        let b = FsModel::new(host, None);
        assert_eq!(a.mount_point(), b.mount_point());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn touch_hook_fires_only_on_transitions() {
        use std::sync::atomic::AtomicUsize;
        let model = FsModel::new(MountPoint::host(), None);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        model.set_touch_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        model.set_touched(true);
        model.set_touched(true);
        model.set_touched(false);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
