//! Storage tiers holding feed artifacts.
//!
//! Both tiers address artifacts by [`FeedKey`](crate::FeedKey) and
//! [`ArtifactKind`](crate::ArtifactKind) and map them onto a
//! [`StorageBackend`](feedcache_storage::StorageBackend).

mod local;
mod remote;

pub use self::local::LocalTier;
pub use self::remote::RemoteTier;
