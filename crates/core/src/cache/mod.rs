//! The tiered feed cache.
//!
//! A bounded in-memory mapping of open feeds, backed by the local tier and
//! an optional remote tier. A miss runs the fallback pipeline:
//!
//! 1. open the local database pair,
//! 2. download the pair from the remote tier and open it,
//! 3. download the raw source if it is not on disk,
//! 4. build the database from the source and publish it.
//!
//! Concurrent misses on one key share a single pipeline run, and a reload
//! waits until an evicted handle on the same key has closed, so a database
//! pair is never opened twice.

mod resident;

use self::resident::{Resident, Revived};
use crate::artifact::ArtifactKind;
use crate::builder::{FeedBuilder, blocking};
use crate::error::{Error, ErrorKind, Result};
use crate::feed::{Closed, Feed, FeedConsumer, FeedStore, PatternDetector, Release};
use crate::sanitize::FeedKey;
use crate::tier::{LocalTier, RemoteTier};
use exn::ResultExt;
use feedcache_config::{Config, RemoteConfig};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::instrument;

type Load<V> = Shared<BoxFuture<'static, std::result::Result<Feed<V>, ErrorKind>>>;

enum Pending<V: Release> {
    Ready(Feed<V>),
    Loading(Load<V>),
}

/// Cache of open feeds in front of a local and an optional remote tier.
///
/// Cheap to clone; clones share the same state.
pub struct TieredFeedCache<S, C>
where
    S: FeedStore,
    C: FeedConsumer<S::Handle>,
{
    inner: Arc<Inner<S, C>>,
}

struct Inner<S, C>
where
    S: FeedStore,
    C: FeedConsumer<S::Handle>,
{
    builder: FeedBuilder<S>,
    consumer: Arc<C>,
    local: LocalTier,
    remote: Option<RemoteTier>,
    // Lock order: `inflight` before `resident`.
    inflight: Mutex<HashMap<FeedKey, Load<C::Value>>>,
    resident: Mutex<Resident<C::Value>>,
}

impl<S, C> Clone for TieredFeedCache<S, C>
where
    S: FeedStore,
    C: FeedConsumer<S::Handle>,
{
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S, C> fmt::Debug for TieredFeedCache<S, C>
where
    S: FeedStore,
    C: FeedConsumer<S::Handle>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredFeedCache")
            .field("dir", &self.inner.local.dir())
            .field("remote", &self.inner.remote.as_ref().map(RemoteTier::name))
            .field("capacity", &self.capacity())
            .field("size", &self.current_size())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S, C> TieredFeedCache<S, C>
where
    S: FeedStore,
    C: FeedConsumer<S::Handle>,
{
    pub fn new(
        local: LocalTier,
        remote: Option<RemoteTier>,
        capacity: usize,
        store: S,
        detector: impl PatternDetector<S::Handle>,
        consumer: C,
    ) -> Self {
        match &remote {
            Some(remote) => {
                tracing::info!(remote = remote.name(), dir = %local.dir().display(), "Feed cache backed by remote tier")
            },
            None => {
                tracing::info!(dir = %local.dir().display(), "No remote tier configured; feed cache will run locally")
            },
        }
        let builder = FeedBuilder::new(Arc::new(store), Arc::new(detector), local.clone(), remote.clone());
        Self {
            inner: Arc::new(Inner {
                builder,
                consumer: Arc::new(consumer),
                local,
                remote,
                inflight: Mutex::new(HashMap::new()),
                resident: Mutex::new(Resident::new(capacity)),
            }),
        }
    }

    /// Assemble a cache from loaded configuration.
    ///
    /// A `remote` section needs the `s3` feature.
    pub async fn from_config(
        config: &Config,
        store: S,
        detector: impl PatternDetector<S::Handle>,
        consumer: C,
    ) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config("invalid configuration".to_string()))?;
        let local = LocalTier::open(&config.cache_dir)?;
        let remote = match &config.remote {
            Some(remote) => Some(remote_tier(remote).await?),
            None => None,
        };
        Ok(Self::new(local, remote, config.capacity, store, detector, consumer))
    }

    pub fn capacity(&self) -> usize {
        lock(&self.inner.resident).capacity()
    }

    /// Number of resident feeds.
    pub fn current_size(&self) -> usize {
        lock(&self.inner.resident).len()
    }

    /// `true` when no remote tier is configured.
    pub fn is_offline(&self) -> bool {
        self.inner.remote.is_none()
    }

    /// Fetch the feed for `id`, loading it through the tiers on a miss.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Feed<C::Value>> {
        let key = FeedKey::new(id);
        let (pending, evicted) = {
            let mut inflight = lock(&self.inner.inflight);
            let mut resident = lock(&self.inner.resident);
            if let Some(feed) = resident.get(&key) {
                return Ok(feed);
            }
            if let Some(load) = inflight.get(&key) {
                tracing::debug!(key = %key, "Waiting for in-flight load");
                (Pending::Loading(load.clone()), Vec::new())
            } else {
                match resident.revive(&key) {
                    Some(Revived::Held(feed)) => {
                        let evicted = resident.insert(feed.clone());
                        (Pending::Ready(feed), evicted)
                    },
                    Some(Revived::Closing(closed)) => {
                        tracing::debug!(key = %key, "Evicted feed still closing, reload waits for it");
                        (Pending::Loading(self.start_load(&mut inflight, key, id, Some(closed))), Vec::new())
                    },
                    None => (Pending::Loading(self.start_load(&mut inflight, key, id, None)), Vec::new()),
                }
            }
        };
        self.inner.evict(evicted).await;
        match pending {
            Pending::Ready(feed) => Ok(feed),
            Pending::Loading(load) => load.await.map_err(Error::from),
        }
    }

    /// Register a load for `key`. It starts once `closing`, the close of a
    /// previous handle on the same database, has completed.
    fn start_load(
        &self,
        inflight: &mut HashMap<FeedKey, Load<C::Value>>,
        key: FeedKey,
        id: &str,
        closing: Option<Closed>,
    ) -> Load<C::Value> {
        let load = self.spawn_load(key.clone(), id.to_string(), closing);
        inflight.insert(key, load.clone());
        load
    }

    fn spawn_load(&self, key: FeedKey, id: String, closing: Option<Closed>) -> Load<C::Value> {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            if let Some(closed) = closing {
                closed.await;
            }
            let result = match inner.load(&key, &id).await {
                Ok(feed) => {
                    inner.install(feed.clone()).await;
                    Ok(feed)
                },
                Err(err) => {
                    tracing::error!(key = %key, error = ?err, "Unable to load feed");
                    Err((*err).clone())
                },
            };
            lock(&inner.inflight).remove(&key);
            result
        });
        async move { task.await.unwrap_or(Err(ErrorKind::Runtime)) }.boxed().shared()
    }

    /// Build a feed from `source` under `id` and publish it to the remote tier.
    ///
    /// The returned feed is not installed in the cache: a later
    /// [`get`](Self::get) of the same id opens its own copy unless the cache
    /// already holds one.
    #[instrument(skip(self, source), fields(source = %source.as_ref().display()))]
    pub async fn put(&self, id: &str, source: impl AsRef<Path>) -> Result<Feed<C::Value>> {
        self.inner.publish(FeedKey::new(id), source.as_ref(), None::<fn(&S::Handle) -> String>).await
    }

    /// Like [`put`](Self::put), but the id is computed from the freshly built
    /// database by `generator`.
    #[instrument(skip(self, generator, source), fields(source = %source.as_ref().display()))]
    pub async fn put_with<G>(&self, generator: G, source: impl AsRef<Path>) -> Result<Feed<C::Value>>
    where
        G: FnOnce(&S::Handle) -> String + Send + 'static,
    {
        let temp = FeedKey::temporary();
        let result = self.inner.publish(temp.clone(), source.as_ref(), Some(generator)).await;
        if result.is_err() {
            self.inner.local.delete(&temp, &ArtifactKind::ALL).await;
        }
        result
    }

    /// Whether `id` can be served, loading it if needed. Errors are swallowed.
    pub async fn contains_id(&self, id: &str) -> bool {
        self.get(id).await.is_ok()
    }

    /// Drop the resident entry for `id`, running the usual eviction cleanup.
    /// Returns `false` if nothing was resident.
    pub async fn invalidate(&self, id: &str) -> bool {
        let key = FeedKey::new(id);
        let removed = lock(&self.inner.resident).remove(&key);
        match removed {
            Some(feed) => {
                self.inner.evict(vec![feed]).await;
                true
            },
            None => false,
        }
    }
}

impl<S, C> Inner<S, C>
where
    S: FeedStore,
    C: FeedConsumer<S::Handle>,
{
    async fn load(&self, key: &FeedKey, id: &str) -> Result<Feed<C::Value>> {
        if self.local.has_database(key).await? {
            match self.open(key).await {
                Ok(feed) => {
                    tracing::info!(key = %key, "Feed database found locally");
                    return Ok(feed);
                },
                Err(err) => {
                    let err = err.raise(ErrorKind::LocalCorruption(key.to_string()));
                    tracing::warn!(key = %key, error = ?err, "Local feed database unusable, discarding it");
                    self.local.delete(key, &ArtifactKind::DATABASE).await;
                },
            }
        }

        if let Some(remote) = &self.remote {
            match self.fetch_database(remote, key).await {
                Ok(()) => match self.open(key).await {
                    Ok(feed) => {
                        tracing::info!(key = %key, remote = remote.name(), "Feed database downloaded");
                        return Ok(feed);
                    },
                    Err(err) => {
                        tracing::warn!(key = %key, error = ?err, "Downloaded feed database unusable, rebuilding");
                        self.local.delete(key, &ArtifactKind::DATABASE).await;
                    },
                },
                Err(err) if matches!(*err, ErrorKind::RemoteMissing(_)) => {
                    tracing::info!(key = %key, remote = remote.name(), "No feed database in remote tier");
                },
                Err(err) => {
                    tracing::warn!(
                        key = %key,
                        error = ?err,
                        "Unable to download feed database, rebuilding from source"
                    );
                },
            }
        }

        if !self.local.exists(key, ArtifactKind::Source).await?
            && let Some(remote) = &self.remote
        {
            tracing::info!(key = %key, remote = remote.name(), "Feed source not found locally, downloading");
            remote
                .fetch_into(&self.local, key, ArtifactKind::Source)
                .await
                .or_raise(|| ErrorKind::SourceUnavailable(id.to_string()))?;
        }

        if self.local.exists(key, ArtifactKind::Source).await? {
            tracing::info!(key = %key, "Building feed from source");
            let source = self.local.path(key, ArtifactKind::Source)?;
            let target = self.build(key.clone(), &source, None::<fn(&S::Handle) -> String>).await?;
            // The local pair is complete; a later put or rebuild can publish it.
            if let Err(err) = self.builder.upload(&target).await {
                tracing::warn!(key = %target, error = ?err, "Unable to publish rebuilt feed to remote tier");
            }
            return self.open(&target).await;
        }
        tracing::warn!(key = %key, "Feed not found in any tier");
        exn::bail!(ErrorKind::NotFound(id.to_string()))
    }

    /// Download the database pair. A database that arrives without its
    /// companion is removed again.
    async fn fetch_database(&self, remote: &RemoteTier, key: &FeedKey) -> Result<()> {
        remote.fetch_into(&self.local, key, ArtifactKind::Db).await?;
        if let Err(err) = remote.fetch_into(&self.local, key, ArtifactKind::DbCompanion).await {
            self.local.delete(key, &[ArtifactKind::Db]).await;
            return Err(err);
        }
        Ok(())
    }

    /// Open the local pair and hand it to the consumer.
    async fn open(&self, key: &FeedKey) -> Result<Feed<C::Value>> {
        let handle = self.builder.open(key).await?;
        let consumer = Arc::clone(&self.consumer);
        let value = blocking(move || consumer.process(handle)).await?;
        Ok(Feed::new(key.clone(), value))
    }

    /// Build, upload and open. Upload failures are returned to the caller.
    async fn publish<G>(&self, temp: FeedKey, source: &Path, generator: Option<G>) -> Result<Feed<C::Value>>
    where
        G: FnOnce(&S::Handle) -> String + Send + 'static,
    {
        let target = self.build(temp, source, generator).await?;
        if let Err(err) = self.builder.upload(&target).await {
            tracing::error!(key = %target, error = ?err, "Unable to publish feed to remote tier");
            return Err(err);
        }
        self.open(&target).await
    }

    /// Build into `temp` and move the closed artifacts to their final key.
    async fn build<G>(&self, temp: FeedKey, source: &Path, generator: Option<G>) -> Result<FeedKey>
    where
        G: FnOnce(&S::Handle) -> String + Send + 'static,
    {
        let handle = self.builder.build(&temp, source).await?;
        let (handle, target) = match generator {
            Some(generator) => {
                let (handle, id) = self.builder.inspect(handle, generator).await?;
                (handle, FeedKey::new(&id))
            },
            None => (handle, temp.clone()),
        };
        self.builder.finalize_id(&temp, &target, handle).await?;
        Ok(target)
    }

    async fn install(&self, feed: Feed<C::Value>) {
        let evicted = lock(&self.resident).insert(feed);
        self.evict(evicted).await;
    }

    /// Release evicted feeds, then prune their local source when a remote
    /// tier still has a copy of it.
    async fn evict(&self, evicted: Vec<Feed<C::Value>>) {
        for feed in evicted {
            let key = feed.key().clone();
            let held = Feed::holders(&feed) > 1;
            tracing::info!(key = %key, held, "Evicting feed");
            // Closing may flush the database.
            if let Err(err) = blocking(move || {
                drop(feed);
                Ok(())
            })
            .await
            {
                tracing::warn!(key = %key, error = ?err, "Unable to release evicted feed");
            }
            if self.remote.is_some() {
                self.local.delete(&key, &[ArtifactKind::Source]).await;
            }
        }
    }
}

#[cfg(feature = "s3")]
async fn remote_tier(config: &RemoteConfig) -> Result<RemoteTier> {
    use feedcache_storage::BackendHandle;
    use feedcache_storage::backend::{ReadOnlyBackend, S3Backend};

    let backend = S3Backend::new(
        "remote",
        &config.bucket,
        config.folder.clone(),
        &config.region,
        config.endpoint.clone(),
        &config.key_id,
        &config.key_secret,
    )
    .await
    .or_raise(|| ErrorKind::Config(format!("unable to set up bucket {}", config.bucket)))?;
    let backend: BackendHandle = Arc::new(backend);
    if config.read_only {
        tracing::info!(bucket = %config.bucket, "Remote tier is read-only, uploads are skipped");
        return Ok(RemoteTier::new(Arc::new(ReadOnlyBackend::new(backend))));
    }
    Ok(RemoteTier::new(backend))
}

#[cfg(not(feature = "s3"))]
async fn remote_tier(config: &RemoteConfig) -> Result<RemoteTier> {
    exn::bail!(ErrorKind::Config(format!("bucket {} configured but S3 support is not compiled in", config.bucket)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConsumer, FakeHandle, FakeStore, NoPatterns, write_zip};
    use feedcache_config::DEFAULT_CAPACITY;
    use feedcache_storage::backend::MockBackend;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        store: FakeStore,
        consumer: FakeConsumer,
        cache: TieredFeedCache<FakeStore, FakeConsumer>,
    }

    impl Harness {
        fn new(capacity: usize, remote: Option<Arc<MockBackend>>) -> Self {
            Self::with_consumer(capacity, remote, FakeConsumer::default())
        }

        fn with_consumer(capacity: usize, remote: Option<Arc<MockBackend>>, consumer: FakeConsumer) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let local = LocalTier::open(dir.path().join("cache")).unwrap();
            let remote = remote.map(|backend| RemoteTier::new(backend));
            let store = FakeStore::default();
            let cache = TieredFeedCache::new(local, remote, capacity, store.clone(), NoPatterns, consumer.clone());
            Self { dir, store, consumer, cache }
        }

        fn cache_dir(&self) -> PathBuf {
            self.dir.path().join("cache")
        }

        fn listing(&self) -> Vec<String> {
            let mut names: Vec<_> = std::fs::read_dir(self.cache_dir())
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_gets_share_one_load() {
        let h = Harness::new(DEFAULT_CAPACITY, None);
        write_zip(&h.cache_dir(), "boston.zip", b"stops");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = h.cache.clone();
                tokio::spawn(async move { cache.get("boston").await.unwrap() })
            })
            .collect();
        let mut feeds = Vec::new();
        for task in tasks {
            feeds.push(task.await.unwrap());
        }
        assert_eq!(h.store.loads(), 1);
        assert!(feeds.iter().all(|feed| Feed::ptr_eq(feed, &feeds[0])));
        assert_eq!(h.cache.current_size(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_shared_then_retried() {
        let h = Harness::new(DEFAULT_CAPACITY, None);
        std::fs::write(h.cache_dir().join("bad.zip"), b"garbage").unwrap();
        let (a, b, c) = tokio::join!(h.cache.get("bad"), h.cache.get("bad"), h.cache.get("bad"));
        for result in [a, b, c] {
            assert_eq!(*result.unwrap_err(), ErrorKind::Parse);
        }
        assert_eq!(h.store.loads(), 1);
        assert!(h.cache.get("bad").await.is_err());
        assert_eq!(h.store.loads(), 2);
        assert_eq!(h.listing(), ["bad.zip"]);
    }

    #[tokio::test]
    async fn test_unknown_feed_is_not_found() {
        let h = Harness::new(DEFAULT_CAPACITY, None);
        let err = h.cache.get("Boston GTFS!").await.unwrap_err();
        assert_eq!(*err, ErrorKind::NotFound("Boston GTFS!".to_string()));
        assert!(h.cache.is_offline());
        assert_eq!(h.cache.current_size(), 0);
    }

    #[tokio::test]
    async fn test_missing_remote_source_is_unavailable() {
        let h = Harness::new(DEFAULT_CAPACITY, Some(Arc::new(MockBackend::default())));
        let err = h.cache.get("boston").await.unwrap_err();
        assert_eq!(*err, ErrorKind::SourceUnavailable("boston".to_string()));
        assert!(!h.cache.is_offline());
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let h = Harness::new(DEFAULT_CAPACITY, None);
        let source = write_zip(h.dir.path(), "upload.zip", b"alpha");
        let put = h.cache.put("feedA", &source).await.unwrap();
        assert_eq!(put.content, b"alpha");
        assert_eq!(h.cache.current_size(), 0);
        drop(put);

        let got = h.cache.get("feedA").await.unwrap();
        assert_eq!(got.content, b"alpha");
        assert_eq!(h.store.loads(), 1);
        assert_eq!(h.cache.current_size(), 1);
    }

    #[tokio::test]
    async fn test_eviction_prunes_source_when_remote_has_it() {
        let bucket = Arc::new(MockBackend::default());
        let h = Harness::new(2, Some(bucket.clone()));
        for id in ["a", "b", "c"] {
            write_zip(&h.cache_dir(), &format!("{id}.zip"), id.as_bytes());
            h.cache.get(id).await.unwrap();
        }
        assert_eq!(h.cache.current_size(), 2);
        assert_eq!(h.consumer.closes(), 1);
        assert_eq!(
            h.listing(),
            ["a.v2.db", "a.v2.db.p", "b.v2.db", "b.v2.db.p", "b.zip", "c.v2.db", "c.v2.db.p", "c.zip"]
        );
        assert_eq!(bucket.paths().await.len(), 9);
    }

    #[tokio::test]
    async fn test_eviction_keeps_only_copy_when_offline() {
        let h = Harness::new(2, None);
        for id in ["a", "b", "c"] {
            write_zip(&h.cache_dir(), &format!("{id}.zip"), id.as_bytes());
            h.cache.get(id).await.unwrap();
        }
        assert_eq!(h.cache.current_size(), 2);
        assert_eq!(h.consumer.closes(), 1);
        assert_eq!(h.listing().len(), 9);
    }

    #[tokio::test]
    async fn test_remote_database_skips_parsing() {
        let bucket = Arc::new(MockBackend::with_files([
            ("boston.v2.db", b"feed".to_vec()),
            ("boston.v2.db.p", b"v2:4".to_vec()),
        ]));
        let h = Harness::new(DEFAULT_CAPACITY, Some(bucket));
        let feed = h.cache.get("boston").await.unwrap();
        assert_eq!(feed.content, b"feed");
        assert_eq!(h.store.loads(), 0);
        assert_eq!(h.listing(), ["boston.v2.db", "boston.v2.db.p"]);
    }

    #[tokio::test]
    async fn test_orphaned_remote_database_is_discarded() {
        let bucket = Arc::new(MockBackend::with_files([("boston.v2.db", b"feed".to_vec())]));
        let h = Harness::new(DEFAULT_CAPACITY, Some(bucket));
        let err = h.cache.get("boston").await.unwrap_err();
        assert_eq!(*err, ErrorKind::SourceUnavailable("boston".to_string()));
        assert!(h.listing().is_empty());
    }

    #[tokio::test]
    async fn test_generated_id_replaces_temporary_artifacts() {
        let bucket = Arc::new(MockBackend::default());
        let h = Harness::new(DEFAULT_CAPACITY, Some(bucket.clone()));
        let source = write_zip(h.dir.path(), "upload.zip", b"route feed");
        let feed = h
            .cache
            .put_with(|handle: &FakeHandle| format!("{}X", String::from_utf8_lossy(&handle.content[..5])), &source)
            .await
            .unwrap();
        assert_eq!(feed.key().as_str(), "routeX");
        assert_eq!(h.listing(), ["routeX.v2.db", "routeX.v2.db.p", "routeX.zip"]);
        assert_eq!(
            bucket.paths().await,
            vec![PathBuf::from("routeX.v2.db"), PathBuf::from("routeX.v2.db.p"), PathBuf::from("routeX.zip")]
        );
    }

    #[tokio::test]
    async fn test_corrupt_local_database_is_rebuilt() {
        let h = Harness::new(DEFAULT_CAPACITY, None);
        write_zip(&h.cache_dir(), "boston.zip", b"fresh");
        std::fs::write(h.cache_dir().join("boston.v2.db"), b"junk").unwrap();
        std::fs::write(h.cache_dir().join("boston.v2.db.p"), b"v2:999").unwrap();
        let feed = h.cache.get("boston").await.unwrap();
        assert_eq!(feed.content, b"fresh");
        assert_eq!(h.store.loads(), 1);
    }

    #[tokio::test]
    async fn test_evicted_feed_in_use_is_readopted() {
        let h = Harness::new(1, None);
        write_zip(&h.cache_dir(), "a.zip", b"alpha");
        write_zip(&h.cache_dir(), "b.zip", b"beta");
        let a = h.cache.get("a").await.unwrap();
        h.cache.get("b").await.unwrap();
        assert_eq!(h.consumer.closes(), 0);

        let opens = h.store.opens();
        let again = h.cache.get("a").await.unwrap();
        assert!(Feed::ptr_eq(&a, &again));
        assert_eq!(h.store.opens(), opens);
        assert_eq!(h.store.loads(), 2);
        // "b" made room and nobody held it.
        assert_eq!(h.consumer.closes(), 1);
        drop(a);
        drop(again);
        assert_eq!(h.consumer.closes(), 1);
        assert_eq!(h.cache.current_size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reload_waits_for_evicted_handle_to_close() {
        let h = Harness::with_consumer(1, None, FakeConsumer::slow_close(Duration::from_millis(300)));
        write_zip(&h.cache_dir(), "a.zip", b"alpha");
        write_zip(&h.cache_dir(), "b.zip", b"beta");
        drop(h.cache.get("a").await.unwrap());

        let cache = h.cache.clone();
        let loading_b = tokio::spawn(async move { cache.get("b").await.map(drop) });
        // Wait until "b" made room and "a" is being closed on the blocking pool.
        while h.consumer.closes_started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.consumer.open_handles("a.v2.db"), 1);

        let again = h.cache.get("a").await.unwrap();
        assert_eq!(again.content, b"alpha");
        loading_b.await.unwrap().unwrap();
        assert_eq!(h.consumer.peak_handles("a.v2.db"), 1);
        assert_eq!(h.consumer.open_handles("a.v2.db"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reload_waits_for_last_outside_holder() {
        let h = Harness::with_consumer(1, None, FakeConsumer::slow_close(Duration::from_millis(300)));
        write_zip(&h.cache_dir(), "a.zip", b"alpha");
        write_zip(&h.cache_dir(), "b.zip", b"beta");
        let a = h.cache.get("a").await.unwrap();
        h.cache.get("b").await.unwrap();
        // The last holder closes "a" outside the cache.
        let releasing = std::thread::spawn(move || drop(a));
        while h.consumer.closes_started() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let again = h.cache.get("a").await.unwrap();
        assert_eq!(again.content, b"alpha");
        releasing.join().unwrap();
        assert_eq!(h.consumer.peak_handles("a.v2.db"), 1);
    }

    #[tokio::test]
    async fn test_invalidate_runs_eviction_cleanup() {
        let h = Harness::new(DEFAULT_CAPACITY, Some(Arc::new(MockBackend::default())));
        write_zip(&h.cache_dir(), "a.zip", b"alpha");
        h.cache.get("a").await.unwrap();
        assert!(h.cache.invalidate("a").await);
        assert!(!h.cache.invalidate("a").await);
        assert_eq!(h.consumer.closes(), 1);
        assert_eq!(h.cache.current_size(), 0);
        assert_eq!(h.listing(), ["a.v2.db", "a.v2.db.p"]);
        h.cache.get("a").await.unwrap();
        assert_eq!(h.store.loads(), 1);
    }

    #[tokio::test]
    async fn test_contains_id() {
        let h = Harness::new(DEFAULT_CAPACITY, None);
        write_zip(&h.cache_dir(), "a.zip", b"alpha");
        assert!(h.cache.contains_id("a").await);
        assert!(!h.cache.contains_id("missing").await);
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported_and_build_kept() {
        let bucket = Arc::new(MockBackend::default());
        bucket.set_offline(true);
        let h = Harness::new(DEFAULT_CAPACITY, Some(bucket.clone()));
        let source = write_zip(h.dir.path(), "upload.zip", b"alpha");
        let err = h.cache.put("feedA", &source).await.unwrap_err();
        assert_eq!(*err, ErrorKind::TransientIo);

        bucket.set_offline(false);
        let feed = h.cache.get("feedA").await.unwrap();
        assert_eq!(feed.content, b"alpha");
        assert_eq!(h.store.loads(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_served_when_remote_unreachable() {
        let bucket = Arc::new(MockBackend::default());
        bucket.set_offline(true);
        let h = Harness::new(DEFAULT_CAPACITY, Some(bucket.clone()));
        write_zip(&h.cache_dir(), "boston.zip", b"stops");
        let feed = h.cache.get("boston").await.unwrap();
        assert_eq!(feed.content, b"stops");
        assert_eq!(h.store.loads(), 1);
        assert_eq!(h.listing(), ["boston.v2.db", "boston.v2.db.p", "boston.zip"]);
        bucket.set_offline(false);
        assert!(bucket.paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_remote_database_falls_back_to_local_source() {
        let bucket = Arc::new(MockBackend::with_files([
            ("boston.v2.db", b"remote".to_vec()),
            ("boston.v2.db.p", b"v2:6".to_vec()),
        ]));
        bucket.set_offline(true);
        let h = Harness::new(DEFAULT_CAPACITY, Some(bucket));
        write_zip(&h.cache_dir(), "boston.zip", b"local");
        let feed = h.cache.get("boston").await.unwrap();
        assert_eq!(feed.content, b"local");
        assert_eq!(h.store.loads(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_remote_source_is_unavailable() {
        let bucket = Arc::new(MockBackend::with_files([("boston.zip", b"PKstops".to_vec())]));
        bucket.set_offline(true);
        let h = Harness::new(DEFAULT_CAPACITY, Some(bucket));
        let err = h.cache.get("boston").await.unwrap_err();
        assert_eq!(*err, ErrorKind::SourceUnavailable("boston".to_string()));
        assert_eq!(h.store.loads(), 0);
        assert!(h.listing().is_empty());
    }

    fn config(dir: &Path, capacity: usize, remote: Option<RemoteConfig>) -> Config {
        Config { cache_dir: dir.join("feeds"), capacity, remote }
    }

    #[tokio::test]
    async fn test_from_config_offline() {
        let dir = tempfile::tempdir().unwrap();
        let offline = config(dir.path(), 3, None);
        let cache = TieredFeedCache::from_config(&offline, FakeStore::default(), NoPatterns, FakeConsumer::default())
            .await
            .unwrap();
        assert_eq!(cache.capacity(), 3);
        assert!(cache.is_offline());
        assert!(dir.path().join("feeds").is_dir());

        let empty = config(dir.path(), 0, None);
        let err = TieredFeedCache::from_config(&empty, FakeStore::default(), NoPatterns, FakeConsumer::default())
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Config(_)));
    }

    #[cfg(not(feature = "s3"))]
    #[tokio::test]
    async fn test_from_config_remote_requires_s3() {
        let dir = tempfile::tempdir().unwrap();
        let remote = RemoteConfig {
            bucket: "transit-feeds".to_string(),
            folder: None,
            region: "us-east-1".to_string(),
            endpoint: None,
            key_id: String::new(),
            key_secret: String::new(),
            read_only: false,
        };
        let err = TieredFeedCache::from_config(
            &config(dir.path(), 3, Some(remote)),
            FakeStore::default(),
            NoPatterns,
            FakeConsumer::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Config(_)));
    }
}
