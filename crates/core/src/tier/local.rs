use crate::artifact::ArtifactKind;
use crate::error::{ErrorKind, Result};
use crate::sanitize::FeedKey;
use exn::ResultExt;
use feedcache_storage::StorageBackend;
use feedcache_storage::backend::LocalBackend;
use std::path::{Path, PathBuf};

/// Artifacts in the local cache directory.
///
/// This is the only tier the embedded database is ever opened from.
#[derive(Debug, Clone)]
pub struct LocalTier {
    backend: LocalBackend,
}

impl LocalTier {
    pub fn new(backend: LocalBackend) -> Self {
        Self { backend }
    }

    /// Use (and create if needed) `dir` as the local tier.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let backend = LocalBackend::new("local", dir).or_raise(|| ErrorKind::Storage)?;
        Ok(Self::new(backend))
    }

    pub fn dir(&self) -> &Path {
        self.backend.root()
    }

    /// Filesystem location of an artifact, for collaborators that open files
    /// themselves.
    pub fn path(&self, key: &FeedKey, kind: ArtifactKind) -> Result<PathBuf> {
        self.backend.resolve(kind.path(key)).or_raise(|| ErrorKind::Storage)
    }

    pub async fn exists(&self, key: &FeedKey, kind: ArtifactKind) -> Result<bool> {
        self.backend.exists(&kind.path(key)).await.or_raise(|| ErrorKind::Storage)
    }

    /// Both halves of the database pair are present.
    pub async fn has_database(&self, key: &FeedKey) -> Result<bool> {
        for kind in ArtifactKind::DATABASE {
            if !self.exists(key, kind).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn read(&self, key: &FeedKey, kind: ArtifactKind) -> Result<Vec<u8>> {
        self.backend.read(&kind.path(key)).await.or_raise(|| ErrorKind::Storage)
    }

    /// Write an artifact. A failed write leaves no partial file behind.
    pub async fn write(&self, key: &FeedKey, kind: ArtifactKind, data: &[u8]) -> Result<()> {
        self.backend.write(&kind.path(key), data).await.or_raise(|| ErrorKind::Storage)
    }

    /// Copy a file from outside the cache directory into the tier.
    pub async fn import(&self, key: &FeedKey, kind: ArtifactKind, external: &Path) -> Result<()> {
        self.backend.import(external, &kind.path(key)).await.or_raise(|| ErrorKind::Storage)
    }

    pub async fn copy(&self, from: &FeedKey, to: &FeedKey, kind: ArtifactKind) -> Result<()> {
        self.backend.copy(&kind.path(from), &kind.path(to)).await.or_raise(|| ErrorKind::Storage)
    }

    /// Best-effort removal. Failures are logged, never returned.
    pub async fn delete(&self, key: &FeedKey, kinds: &[ArtifactKind]) {
        for kind in kinds {
            let path = kind.path(key);
            match self.backend.delete(&path).await {
                Ok(()) => tracing::debug!(path = %path.display(), "Deleted local artifact"),
                Err(err) if err.is_not_found() => {},
                Err(err) => tracing::warn!(path = %path.display(), error = ?err, "Unable to delete local artifact"),
            }
        }
    }
}
