use crate::artifact::ArtifactKind;
use crate::error::{ErrorKind, Result};
use crate::sanitize::FeedKey;
use crate::tier::LocalTier;
use exn::ResultExt;
use feedcache_storage::BackendHandle;

/// Artifacts in a remote object store.
///
/// Object keys mirror local file names; a bucket folder is the backend's
/// prefix. Every failure other than a missing object is reported as
/// [`TransientIo`](ErrorKind::TransientIo).
#[derive(Clone)]
pub struct RemoteTier {
    backend: BackendHandle,
}

impl RemoteTier {
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub async fn object_exists(&self, key: &FeedKey, kind: ArtifactKind) -> Result<bool> {
        self.backend.exists(&kind.path(key)).await.or_raise(|| ErrorKind::TransientIo)
    }

    /// Fails with [`RemoteMissing`](ErrorKind::RemoteMissing) if there is no
    /// such object.
    pub async fn download(&self, key: &FeedKey, kind: ArtifactKind) -> Result<Vec<u8>> {
        let path = kind.path(key);
        match self.backend.read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.is_not_found() => {
                Err(err).or_raise(|| ErrorKind::RemoteMissing(path.to_string_lossy().into_owned()))
            },
            Err(err) => Err(err).or_raise(|| ErrorKind::TransientIo),
        }
    }

    /// Download an artifact straight into the local tier.
    pub async fn fetch_into(&self, local: &LocalTier, key: &FeedKey, kind: ArtifactKind) -> Result<()> {
        let data = self.download(key, kind).await?;
        local.write(key, kind, &data).await?;
        tracing::debug!(remote = self.name(), key = %key, ?kind, bytes = data.len(), "Artifact downloaded");
        Ok(())
    }

    /// Upload an artifact. With `skip_if_exists`, an object already present
    /// under the same key is left untouched. Returns whether anything was
    /// written.
    pub async fn upload(&self, key: &FeedKey, kind: ArtifactKind, data: &[u8], skip_if_exists: bool) -> Result<bool> {
        if skip_if_exists && self.object_exists(key, kind).await? {
            tracing::info!(remote = self.name(), key = %key, ?kind, "Artifact already present remotely");
            return Ok(false);
        }
        self.backend.write(&kind.path(key), data).await.or_raise(|| ErrorKind::TransientIo)?;
        Ok(true)
    }
}
