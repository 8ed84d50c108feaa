use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::controller::{ArchiveController, FsController};
use super::error::FsError;
use super::finalize::FinalizeController;
use super::lock::LockController;
use super::model::FsModel;
use super::reset::ResetController;
use crate::zip::dostime::TzProfile;
use crate::zip::{CompressionMethod, ZipConfig};

/// Builds the controller for a file system model.
///
/// A driver for a federated scheme receives the parent file system's
/// controller and is expected to assemble its full decoration chain; the
/// returned controller is what the manager hands out.
pub trait FsDriver: Send + Sync {
    fn new_controller(
        &self,
        model: Arc<FsModel>,
        parent: Option<Arc<dyn FsController>>,
    ) -> Result<Arc<dyn FsController>, FsError>;
}

/// Dispatches controller construction by mount point scheme.
///
/// Also decides which member names look like mountable archives, by file
/// name suffix. Detection is deliberately optimistic: a matching suffix
/// with non-archive content surfaces later as a false positive.
#[derive(Default)]
pub struct FsCompositeDriver {
    drivers: HashMap<String, Arc<dyn FsDriver>>,
}

impl FsCompositeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: &str, driver: Arc<dyn FsDriver>) {
        self.drivers.insert(scheme.to_string(), driver);
    }

    pub fn get(&self, scheme: &str) -> Result<&Arc<dyn FsDriver>, FsError> {
        self.drivers
            .get(scheme)
            .ok_or_else(|| FsError::NoDriver(scheme.to_string()))
    }

    /// The scheme whose suffix matches `name`, if any driver is registered
    /// for it.
    pub fn scheme_for(&self, name: &str) -> Option<&str> {
        let (_, ext) = name.rsplit_once('.')?;
        let ext = ext.to_ascii_lowercase();
        self.drivers.get_key_value(ext.as_str()).map(|(k, _)| k.as_str())
    }
}

/// Reuses the large byte buffers that archive images are staged in.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

const MAX_POOLED_BUFFERS: usize = 4;
const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn allocate(&self) -> Vec<u8> {
        match self.buffers.lock().pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    pub fn release(&self, buf: Vec<u8>) {
        let mut pool = self.buffers.lock();
        if pool.len() < MAX_POOLED_BUFFERS {
            pool.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver for ZIP archive file systems.
///
/// Cheap to clone; clones share the buffer pool.
#[derive(Clone)]
pub struct ZipDriver {
    config: ZipConfig,
    tz: TzProfile,
    method: CompressionMethod,
    pool: Arc<BufferPool>,
}

impl ZipDriver {
    pub fn new() -> Self {
        Self {
            config: ZipConfig::default(),
            tz: TzProfile::DateLocal,
            method: CompressionMethod::Deflated,
            pool: Arc::new(BufferPool::new()),
        }
    }

    pub fn with_config(mut self, config: ZipConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tz_profile(mut self, tz: TzProfile) -> Self {
        self.tz = tz;
        self
    }

    pub fn with_method(mut self, method: CompressionMethod) -> Self {
        self.method = method;
        self
    }

    pub fn zip_config(&self) -> ZipConfig {
        self.config
    }

    pub fn tz_profile(&self) -> TzProfile {
        self.tz
    }

    /// Compression method for newly written entries.
    pub fn method(&self) -> CompressionMethod {
        self.method
    }

    /// ZIP central directories may carry several records for one name;
    /// the format's convention is last-write-wins, so such archives mount
    /// instead of being rejected.
    pub fn tolerates_redundancy(&self) -> bool {
        true
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Normalize an entry path and reject names that could escape the
    /// archive's namespace.
    pub fn validate_name(&self, path: &str) -> Result<String, FsError> {
        if path.contains('\\') {
            return Err(FsError::InvalidName(path.to_string()));
        }
        let mut segments = Vec::new();
        for seg in path.split('/') {
            match seg {
                "" | "." => continue,
                ".." => return Err(FsError::InvalidName(path.to_string())),
                _ => segments.push(seg),
            }
        }
        Ok(segments.join("/"))
    }
}

impl Default for ZipDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FsDriver for ZipDriver {
    fn new_controller(
        &self,
        model: Arc<FsModel>,
        parent: Option<Arc<dyn FsController>>,
    ) -> Result<Arc<dyn FsController>, FsError> {
        let parent = parent.ok_or_else(|| {
            FsError::NoDriver(model.mount_point().scheme().to_string())
        })?;
        debug_assert!(
            model
                .parent()
                .is_some_and(|pm| Arc::ptr_eq(pm, parent.model())),
            "the model's parent must be the parent controller's model"
        );
        let base = ArchiveController::new(model, self.clone(), parent);
        Ok(Arc::new(FinalizeController::new(ResetController::new(
            LockController::new(base),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_normalizes_and_rejects_escapes() {
        let driver = ZipDriver::new();
        assert_eq!(driver.validate_name("a//b/./c").unwrap(), "a/b/c");
        assert_eq!(driver.validate_name("/lead/slash").unwrap(), "lead/slash");
        assert_eq!(driver.validate_name("").unwrap(), "");
        assert!(matches!(
            driver.validate_name("a/../b"),
            Err(FsError::InvalidName(_))
        ));
        assert!(matches!(
            driver.validate_name("a\\b"),
            Err(FsError::InvalidName(_))
        ));
    }

    #[test]
    fn buffer_pool_recycles_released_buffers() {
        let pool = BufferPool::new();
        let mut buf = pool.allocate();
        buf.resize(4 * INITIAL_BUFFER_CAPACITY, 0);
        let grown = buf.capacity();
        pool.release(buf);

        // The recycled buffer comes back cleared but keeps its capacity.
        let again = pool.allocate();
        assert!(again.is_empty());
        assert!(again.capacity() >= grown);

        // A fresh allocation from the now-empty pool starts small again.
        let fresh = pool.allocate();
        assert!(fresh.capacity() < grown);
    }

    #[test]
    fn composite_driver_matches_suffixes() {
        let mut composite = FsCompositeDriver::new();
        composite.register("zip", Arc::new(ZipDriver::new()));
        assert_eq!(composite.scheme_for("archive.zip"), Some("zip"));
        assert_eq!(composite.scheme_for("ARCHIVE.ZIP"), Some("zip"));
        assert_eq!(composite.scheme_for("archive.tar"), None);
        assert_eq!(composite.scheme_for("plain"), None);
        assert!(composite.get("zip").is_ok());
        assert!(matches!(composite.get("tar"), Err(FsError::NoDriver(_))));
    }
}
