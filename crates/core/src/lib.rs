//! Tiered cache of parsed transit (GTFS) feeds.
//!
//! Raw feeds are zipped tables that are slow to parse, so each one is
//! converted once into an embedded database pair and reused afterwards.
//! [`TieredFeedCache`] keeps a bounded set of open feeds in memory and, on a
//! miss, falls back through the local cache directory, an optional remote
//! object store and finally a rebuild from the raw feed.
//!
//! Parsing, the database engine, enrichment and the final domain value are
//! supplied by the caller through [`FeedStore`], [`PatternDetector`] and
//! [`FeedConsumer`].
//!
//! Per feed key `K`, both tiers hold:
//! - `K.zip`: the raw feed,
//! - `K.v2.db` and `K.v2.db.p`: the database pair.

mod artifact;
mod builder;
mod cache;
pub mod error;
mod feed;
mod sanitize;
#[cfg(test)]
mod testing;
mod tier;

pub use self::artifact::ArtifactKind;
pub use self::builder::FeedBuilder;
pub use self::cache::TieredFeedCache;
pub use self::error::{Error, ErrorKind, Result};
pub use self::feed::{Feed, FeedConsumer, FeedStore, PatternDetector, Release};
pub use self::sanitize::{FeedKey, sanitize};
pub use self::tier::{LocalTier, RemoteTier};
