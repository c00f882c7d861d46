use crate::feed::{Closed, Feed, Release, WeakFeed};
use crate::sanitize::FeedKey;
use std::collections::HashMap;

struct Entry<V: Release> {
    feed: Feed<V>,
    last_used: u64,
}

/// What is left of an evicted feed.
pub(super) enum Revived<V: Release> {
    /// Still held somewhere; hand out the same open feed.
    Held(Feed<V>),
    /// Its last holder let go and the close may still be running.
    Closing(Closed),
}

/// The bounded key to feed mapping.
///
/// Entries leave the mapping on eviction even when callers still hold them.
/// Every evicted feed is remembered weakly until it has been closed, so the
/// same open feed can be handed out again, and a reload can wait for the old
/// handle to be released instead of opening the database a second time.
pub(super) struct Resident<V: Release> {
    capacity: usize,
    entries: HashMap<FeedKey, Entry<V>>,
    retired: HashMap<FeedKey, WeakFeed<V>>,
    tick: u64,
}

impl<V: Release> Resident<V> {
    pub(super) fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), entries: HashMap::new(), retired: HashMap::new(), tick: 0 }
    }

    pub(super) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Resident feed for `key`, marked as most recently used.
    pub(super) fn get(&mut self, key: &FeedKey) -> Option<Feed<V>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.feed.clone())
    }

    /// A feed that was evicted and not yet closed.
    pub(super) fn revive(&mut self, key: &FeedKey) -> Option<Revived<V>> {
        let weak = self.retired.remove(key)?;
        match weak.upgrade() {
            Some(feed) => {
                tracing::debug!(key = %key, "Re-adopting evicted feed still in use");
                Some(Revived::Held(feed))
            },
            None if weak.is_released() => None,
            None => Some(Revived::Closing(weak.closed())),
        }
    }

    /// Install `feed`, returning whatever had to make room for it.
    pub(super) fn insert(&mut self, feed: Feed<V>) -> Vec<Feed<V>> {
        let mut evicted = Vec::new();
        let key = feed.key().clone();
        let last_used = self.next_tick();
        self.retired.remove(&key);
        if let Some(previous) = self.entries.insert(key, Entry { feed: feed.clone(), last_used })
            && !Feed::ptr_eq(&previous.feed, &feed)
        {
            evicted.push(self.retire(previous.feed));
        }
        while self.entries.len() > self.capacity {
            let Some(victim) = self.victim() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&victim) {
                evicted.push(self.retire(entry.feed));
            }
        }
        self.retired.retain(|_, weak| !weak.is_released());
        evicted
    }

    pub(super) fn remove(&mut self, key: &FeedKey) -> Option<Feed<V>> {
        let entry = self.entries.remove(key)?;
        Some(self.retire(entry.feed))
    }

    /// Least recently used entry, skipping the ones held outside the cache
    /// unless nothing else is left.
    fn victim(&self) -> Option<FeedKey> {
        let unpinned = self
            .entries
            .iter()
            .filter(|(_, entry)| Feed::holders(&entry.feed) == 1)
            .min_by_key(|(_, entry)| entry.last_used);
        unpinned
            .or_else(|| self.entries.iter().min_by_key(|(_, entry)| entry.last_used))
            .map(|(key, _)| key.clone())
    }

    fn retire(&mut self, feed: Feed<V>) -> Feed<V> {
        self.retired.insert(feed.key().clone(), Feed::downgrade(&feed));
        feed
    }
}
