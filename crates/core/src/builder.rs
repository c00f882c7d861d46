//! Turning raw feeds into published database artifacts.

use crate::artifact::ArtifactKind;
use crate::error::{ErrorKind, Result};
use crate::feed::{FeedStore, PatternDetector};
use crate::sanitize::FeedKey;
use crate::tier::{LocalTier, RemoteTier};
use exn::ResultExt;
use std::path::Path;
use std::sync::Arc;
use tracing::instrument;

/// Run a synchronous collaborator call on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.or_raise(|| ErrorKind::Runtime)?
}

/// The "build" half of the cache pipeline.
///
/// Handles are only ever opened on local artifacts, and every file movement
/// or upload happens after the handle that produced the files was closed.
pub struct FeedBuilder<S: FeedStore> {
    store: Arc<S>,
    detector: Arc<dyn PatternDetector<S::Handle>>,
    local: LocalTier,
    remote: Option<RemoteTier>,
}

impl<S: FeedStore> FeedBuilder<S> {
    pub fn new(
        store: Arc<S>,
        detector: Arc<dyn PatternDetector<S::Handle>>,
        local: LocalTier,
        remote: Option<RemoteTier>,
    ) -> Self {
        Self { store, detector, local, remote }
    }

    /// Open the database pair stored locally under `key`.
    pub async fn open(&self, key: &FeedKey) -> Result<S::Handle> {
        let db = self.local.path(key, ArtifactKind::Db)?;
        let store = Arc::clone(&self.store);
        blocking(move || store.open_or_create(&db)).await
    }

    /// Flush and release a handle.
    pub async fn close(&self, handle: S::Handle) -> Result<()> {
        let store = Arc::clone(&self.store);
        blocking(move || store.close(handle)).await
    }

    /// Materialize a fresh database for `key` from a zipped feed.
    ///
    /// The source is copied into the local tier first, unless it already is
    /// that tier's `K.zip`. The returned handle is open.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn build(&self, key: &FeedKey, source: &Path) -> Result<S::Handle> {
        let local_source = self.local.path(key, ArtifactKind::Source)?;
        if source != local_source.as_path() {
            self.local.import(key, ArtifactKind::Source, source).await?;
        }
        // Stale pairs from an earlier build must not be reopened and appended to.
        self.local.delete(key, &ArtifactKind::DATABASE).await;

        let db = self.local.path(key, ArtifactKind::Db)?;
        let store = Arc::clone(&self.store);
        let detector = Arc::clone(&self.detector);
        let built = blocking(move || {
            let mut handle = store.open_or_create(&db)?;
            let loaded = store
                .load_from_source(&mut handle, &local_source)
                .and_then(|()| detector.detect_patterns(&mut handle));
            match loaded {
                Ok(()) => Ok(handle),
                Err(err) => {
                    if let Err(close_err) = store.close(handle) {
                        tracing::warn!(error = ?close_err, "Unable to close database after failed load");
                    }
                    Err(err)
                },
            }
        })
        .await;
        if built.is_err() {
            self.local.delete(key, &ArtifactKind::DATABASE).await;
        }
        let handle = built?;
        tracing::info!("Feed built");
        Ok(handle)
    }

    /// Close `handle`, then move every artifact from `temp` to `target`.
    ///
    /// The temporary copies are removed once all three artifacts exist under
    /// `target`. A missing temporary artifact means the build itself was
    /// broken and fails with
    /// [`RebuildInconsistency`](ErrorKind::RebuildInconsistency). Reopen the
    /// result with [`open`](Self::open).
    #[instrument(skip(self, temp, target, handle), fields(temp = %temp, target = %target))]
    pub async fn finalize_id(&self, temp: &FeedKey, target: &FeedKey, handle: S::Handle) -> Result<()> {
        self.close(handle).await?;
        if temp == target {
            return Ok(());
        }
        for kind in ArtifactKind::ALL {
            if !self.local.exists(temp, kind).await? {
                exn::bail!(ErrorKind::RebuildInconsistency(kind.path(temp).to_string_lossy().into_owned()));
            }
        }
        for kind in ArtifactKind::ALL {
            self.local.copy(temp, target, kind).await?;
        }
        self.local.delete(temp, &ArtifactKind::ALL).await;
        Ok(())
    }

    /// Publish the local artifacts of `key` to the remote tier, if any.
    ///
    /// The source is skipped when the bucket already has it; the database
    /// pair is always fresh after a build and always uploaded. Only call this
    /// with no handle open on `key`.
    pub async fn upload(&self, key: &FeedKey) -> Result<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        let source = self.local.read(key, ArtifactKind::Source).await?;
        remote.upload(key, ArtifactKind::Source, &source, true).await?;
        for kind in ArtifactKind::DATABASE {
            let data = self.local.read(key, kind).await?;
            remote.upload(key, kind, &data, false).await?;
        }
        tracing::info!(remote = remote.name(), key = %key, "Feed artifacts uploaded");
        Ok(())
    }

    /// Run a synchronous function against an open handle.
    pub(crate) async fn inspect<T, F>(&self, handle: S::Handle, f: F) -> Result<(S::Handle, T)>
    where
        T: Send + 'static,
        F: FnOnce(&S::Handle) -> T + Send + 'static,
    {
        blocking(move || {
            let value = f(&handle);
            Ok((handle, value))
        })
        .await
    }
}
