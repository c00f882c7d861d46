//! Storage-safe feed keys.

use derive_more::Display;

/// Map a raw feed id to a token that is safe as a file name and object key.
///
/// Every character outside `[A-Za-z0-9_]` becomes `-`. The mapping is total
/// and idempotent; distinct raw ids may collide on the same key.
///
/// ```
/// use feedcache_core::sanitize;
///
/// assert_eq!(sanitize("Boston GTFS!"), "Boston-GTFS-");
/// assert_eq!(sanitize(&sanitize("a/b.c")), sanitize("a/b.c"));
/// ```
pub fn sanitize(raw: &str) -> String {
    raw.chars().map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' }).collect()
}

/// A sanitized feed id.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey(String);

impl FeedKey {
    pub fn new(raw: &str) -> Self {
        Self(sanitize(raw))
    }

    /// A fresh random key for builds whose final id is not known yet.
    pub fn temporary() -> Self {
        Self::new(&uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for FeedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
