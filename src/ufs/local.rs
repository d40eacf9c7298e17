//! Local-directory connector.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;

use crate::ufs::{normalize, UnderFileSystem, UnderFileSystemFactory};

const FILE_SCHEME: &str = "file://";

/// Serves UFS paths from a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalUnderFileSystem {
    root: PathBuf,
}

impl LocalUnderFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path for `path`. `..` cannot climb out of the root.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(normalize(path).trim_start_matches('/'))
    }
}

#[async_trait]
impl UnderFileSystem for LocalUnderFileSystem {
    async fn exists(&self, path: &str) -> io::Result<bool> {
        fs::try_exists(self.resolve(path)).await
    }
}

/// Factory for `file://` roots and bare absolute paths.
pub struct LocalUnderFileSystemFactory;

impl UnderFileSystemFactory for LocalUnderFileSystemFactory {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports_path(&self, root: &str) -> bool {
        root.starts_with(FILE_SCHEME) || root.starts_with('/')
    }

    fn create(&self, root: &str) -> io::Result<Arc<dyn UnderFileSystem>> {
        let dir = root.strip_prefix(FILE_SCHEME).unwrap_or(root);
        if dir.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "local UFS root may not be empty",
            ));
        }
        Ok(Arc::new(LocalUnderFileSystem::new(dir)))
    }
}
