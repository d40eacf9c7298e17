//! Underlying storage (UFS) boundary.
//!
//! Only what the worker needs from a storage connector lives here: a factory that
//! says whether it supports a root URI and creates a connector for it, and the
//! existence check the absent-path cache verifies against.
//!
//! - [`local`]: connector for a local directory (`file://` or bare absolute paths)

pub mod local;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

/// A connector to one underlying storage root.
///
/// Paths handed to a connector are absolute within that root (`/a/b/c`).
#[async_trait]
pub trait UnderFileSystem: Send + Sync {
    /// Whether `path` currently exists in the underlying storage.
    async fn exists(&self, path: &str) -> io::Result<bool>;
}

/// Creates connectors for the roots it supports.
pub trait UnderFileSystemFactory: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether this factory can create a connector for `root`.
    fn supports_path(&self, root: &str) -> bool;

    /// Create a connector rooted at `root`.
    fn create(&self, root: &str) -> io::Result<Arc<dyn UnderFileSystem>>;
}

/// Ordered list of connector factories; the first one supporting a root wins.
pub struct UfsRegistry {
    factories: Vec<Box<dyn UnderFileSystemFactory>>,
}

impl UfsRegistry {
    /// Registry with no factories.
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Registry holding the connectors compiled into this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(local::LocalUnderFileSystemFactory));
        registry
    }

    pub fn register(&mut self, factory: Box<dyn UnderFileSystemFactory>) {
        self.factories.push(factory);
    }

    /// The first factory supporting `root`, if any.
    pub fn find(&self, root: &str) -> Option<&dyn UnderFileSystemFactory> {
        self.factories
            .iter()
            .find(|factory| factory.supports_path(root))
            .map(|factory| factory.as_ref())
    }

    /// Create a connector for `root` using the first supporting factory.
    pub fn create(&self, root: &str) -> io::Result<Arc<dyn UnderFileSystem>> {
        let factory = self.find(root).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("no underlying storage connector supports {root}"),
            )
        })?;
        tracing::debug!(root, factory = factory.name(), "Creating UFS connector");
        factory.create(root)
    }
}

/// Splits `path` into its ancestors from the root down to the path itself.
///
/// `/a/b/c` yields `["/", "/a", "/a/b", "/a/b/c"]`. Trailing and repeated
/// separators and `.` are ignored; `..` drops the previous component and never
/// climbs above the root, so `/a/../../b` yields `["/", "/b"]`.
pub fn path_lineage(path: &str) -> Vec<String> {
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            name => components.push(name),
        }
    }

    let mut lineage = vec!["/".to_string()];
    let mut current = String::new();
    for component in components {
        current.push('/');
        current.push_str(component);
        lineage.push(current.clone());
    }
    lineage
}

/// Normalises `path` to the form used as a cache key.
pub fn normalize(path: &str) -> String {
    path_lineage(path).pop().unwrap_or_else(|| "/".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_lineage() {
        assert_eq!(path_lineage("/a/b/c"), vec!["/", "/a", "/a/b", "/a/b/c"]);
        assert_eq!(path_lineage("/"), vec!["/"]);
        assert_eq!(path_lineage("/a//b/"), vec!["/", "/a", "/a/b"]);
        assert_eq!(path_lineage("/a/./b/../c"), vec!["/", "/a", "/a/c"]);
        assert_eq!(path_lineage("/../../etc/passwd"), vec!["/", "/etc", "/etc/passwd"]);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a/b/"), "/a/b");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn test_registry_rejects_unknown_scheme() {
        let registry = UfsRegistry::with_builtin();
        assert!(registry.find("s3://bucket/data").is_none());
        assert_eq!(registry.find("file:///tmp/ufs").map(|f| f.name()), Some("local"));
        let err = registry.create("s3://bucket/data").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
