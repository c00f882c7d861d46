//! Collaborator interfaces and the shared feed handle.
//!
//! The cache never parses feeds or reads databases itself. It drives three
//! collaborators:
//! - a [`FeedStore`], which creates, loads and closes the embedded database,
//! - a [`PatternDetector`], which enriches a freshly loaded database,
//! - a [`FeedConsumer`], which turns an open database handle into the value
//!   actually handed out to callers.
//!
//! Collaborators are synchronous; the cache runs them on Tokio's blocking
//! pool.

use crate::error::Result;
use crate::sanitize::FeedKey;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Parsing collaborator owning the embedded database format.
///
/// A database at `db_path` always comes with a companion file at
/// `{db_path}.p`; implementations create and flush both.
pub trait FeedStore: Send + Sync + 'static {
    type Handle: Send + 'static;

    /// Open the database at `db_path`, creating an empty one if it is absent.
    fn open_or_create(&self, db_path: &Path) -> Result<Self::Handle>;

    /// Parse the zipped feed at `source_path` into an open database.
    fn load_from_source(&self, handle: &mut Self::Handle, source_path: &Path) -> Result<()>;

    /// Flush everything to durable storage and release the database.
    fn close(&self, handle: Self::Handle) -> Result<()>;
}

/// Enrichment collaborator run once after every load.
pub trait PatternDetector<H>: Send + Sync + 'static {
    fn detect_patterns(&self, handle: &mut H) -> Result<()>;
}

/// Exclusive-release operation of a cached value.
pub trait Release {
    /// Release the underlying database. Called exactly once, when the last
    /// [`Feed`] referencing the value is dropped.
    fn close(&mut self) -> Result<()>;
}

/// Turns an open database handle into the domain value stored in the cache.
pub trait FeedConsumer<H>: Send + Sync + 'static {
    type Value: Release + Send + Sync + 'static;

    fn process(&self, handle: H) -> Result<Self::Value>;
}

/// Resolves once a feed's value has finished closing.
pub(crate) type Closed = Shared<BoxFuture<'static, ()>>;

struct Slot<V: Release> {
    key: FeedKey,
    value: V,
    closed: Option<oneshot::Sender<()>>,
}

impl<V: Release> Drop for Slot<V> {
    fn drop(&mut self) {
        match self.value.close() {
            Ok(()) => tracing::debug!(key = %self.key, "Feed closed"),
            Err(err) => tracing::warn!(key = %self.key, error = ?err, "Failed to close feed"),
        }
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }
    }
}

/// Reference-counted handle to a processed feed.
///
/// Cloning acquires a reference and dropping releases it. The value is
/// closed once, when the last reference goes away, so a feed evicted from
/// the cache stays usable for anyone still holding it.
pub struct Feed<V: Release> {
    slot: Arc<Slot<V>>,
    closed: Closed,
}

impl<V: Release> Feed<V> {
    pub(crate) fn new(key: FeedKey, value: V) -> Self {
        let (tx, rx) = oneshot::channel();
        // A sender dropped during a panicking close also counts as closed.
        let closed = async move {
            let _ = rx.await;
        }
        .boxed()
        .shared();
        Self { slot: Arc::new(Slot { key, value, closed: Some(tx) }), closed }
    }

    pub fn key(&self) -> &FeedKey {
        &self.slot.key
    }

    /// Returns `true` if both handles refer to the same open feed.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.slot, &other.slot)
    }

    /// Number of live references, the cache's own included.
    pub fn holders(this: &Self) -> usize {
        Arc::strong_count(&this.slot)
    }

    pub(crate) fn downgrade(this: &Self) -> WeakFeed<V> {
        WeakFeed { slot: Arc::downgrade(&this.slot), closed: this.closed.clone() }
    }
}

impl<V: Release> Clone for Feed<V> {
    fn clone(&self) -> Self {
        Self { slot: Arc::clone(&self.slot), closed: self.closed.clone() }
    }
}

impl<V: Release> Deref for Feed<V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.slot.value
    }
}

impl<V: Release> fmt::Debug for Feed<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed")
            .field("key", &self.slot.key)
            .field("holders", &Feed::holders(self))
            .finish()
    }
}

/// A feed that left the cache but may still be held, or still be closing.
pub(crate) struct WeakFeed<V: Release> {
    slot: Weak<Slot<V>>,
    closed: Closed,
}

impl<V: Release> WeakFeed<V> {
    pub(crate) fn upgrade(&self) -> Option<Feed<V>> {
        self.slot.upgrade().map(|slot| Feed { slot, closed: self.closed.clone() })
    }

    /// Completes once the last holder let go and the value was closed.
    ///
    /// The strong count reaches zero before `Release::close` runs, so a failed
    /// [`upgrade`](Self::upgrade) alone does not mean the database is free.
    pub(crate) fn closed(&self) -> Closed {
        self.closed.clone()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.slot.strong_count() == 0 && self.closed.clone().now_or_never().is_some()
    }
}
