use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A hierarchical address identifying a (possibly nested) file system.
///
/// A mount point has at most one parent; a child's canonical address
/// strictly extends its parent's, so sorting addresses in descending order
/// places every child before its parent. Equality is on the resolved
/// canonical address, never on the incidental spelling a caller used, so
/// equivalent addresses cannot yield duplicate controllers.
#[derive(Clone)]
pub struct MountPoint {
    inner: Arc<Inner>,
}

struct Inner {
    address: String,
    scheme: String,
    parent: Option<MountPoint>,
    /// Path of the archive file within the parent file system.
    member: Option<String>,
}

impl MountPoint {
    /// The outermost, non-federated host file system.
    pub fn host() -> Self {
        Self {
            inner: Arc::new(Inner {
                address: "file:/".to_string(),
                scheme: "file".to_string(),
                parent: None,
                member: None,
            }),
        }
    }

    /// A file system mounted from the archive at `member` inside `parent`.
    pub fn nested(parent: &MountPoint, member: &str, scheme: &str) -> Self {
        let member = normalize(member);
        let address = format!("{}{}!/", parent.address(), member);
        Self {
            inner: Arc::new(Inner {
                address,
                scheme: scheme.to_string(),
                parent: Some(parent.clone()),
                member: Some(member),
            }),
        }
    }

    /// Canonical resolved address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn scheme(&self) -> &str {
        &self.inner.scheme
    }

    pub fn parent(&self) -> Option<&MountPoint> {
        self.inner.parent.as_ref()
    }

    /// The archive's path within the parent file system; `None` for the
    /// host file system.
    pub fn member(&self) -> Option<&str> {
        self.inner.member.as_deref()
    }
}

/// Minimal path cleanup; full normalization is the path facade's concern.
fn normalize(member: &str) -> String {
    member
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl PartialEq for MountPoint {
    fn eq(&self, other: &Self) -> bool {
        self.inner.address == other.inner.address
    }
}

impl Eq for MountPoint {}

impl Hash for MountPoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.address.hash(state);
    }
}

impl PartialOrd for MountPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MountPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        self.inner.address.cmp(&other.inner.address)
    }
}

impl fmt::Debug for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MountPoint({})", self.inner.address)
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_address_extends_parent() {
        let host = MountPoint::host();
        let outer = MountPoint::nested(&host, "tmp/outer.zip", "zip");
        let inner = MountPoint::nested(&outer, "inner.zip", "zip");
        assert_eq!(outer.address(), "file:/tmp/outer.zip!/");
        assert_eq!(inner.address(), "file:/tmp/outer.zip!/inner.zip!/");
        assert!(inner.address().starts_with(outer.address()));
        // descending order visits children before parents
        assert!(inner > outer);
        assert!(outer > host);
    }

    #[test]
    fn equality_is_by_resolved_address() {
        let host = MountPoint::host();
        let a = MountPoint::nested(&host, "a/b.zip", "zip");
        let b = MountPoint::nested(&host, "./a//b.zip", "zip");
        assert_eq!(a, b);
    }
}
