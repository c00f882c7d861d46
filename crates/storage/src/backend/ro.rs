//! Read-only storage decorator.
//!
//! Wraps another backend and turns every mutating operation into a logged
//! no-op that reports success. Used for deployments that may pull artifacts
//! from a shared bucket but must never publish to it.

use async_trait::async_trait;
use std::path::Path;

use crate::{BackendHandle, StorageBackend, error::Result};

/// Read-only storage backend.
///
/// Reads are delegated; writes, deletes and copies are dropped with an
/// [`info event`](tracing::Event).
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        tracing::info!(
            backend = self.name(),
            path = %path.display(),
            bytes = data.len(),
            "Skipping write on read-only backend"
        );
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        tracing::info!(backend = self.name(), path = %path.display(), "Skipping delete on read-only backend");
        Ok(())
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        tracing::info!(
            backend = self.name(),
            from = %from.display(),
            to = %to.display(),
            "Skipping copy on read-only backend"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reads_pass_through_and_writes_are_dropped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(LocalBackend::new("bucket", temp_dir.path()).unwrap());
        inner.write(Path::new("boston.zip"), b"feed").await.unwrap();
        let backend = ReadOnlyBackend::new(inner.clone());
        assert_eq!(backend.name(), "bucket");
        assert_eq!(backend.read(Path::new("boston.zip")).await.unwrap(), b"feed");
        backend.write(Path::new("other.zip"), b"data").await.unwrap();
        backend.copy(Path::new("boston.zip"), Path::new("copy.zip")).await.unwrap();
        backend.delete(Path::new("boston.zip")).await.unwrap();
        assert!(!inner.exists(Path::new("other.zip")).await.unwrap());
        assert!(!inner.exists(Path::new("copy.zip")).await.unwrap());
        assert!(inner.exists(Path::new("boston.zip")).await.unwrap());
    }
}
