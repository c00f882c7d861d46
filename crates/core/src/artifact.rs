//! Artifact naming shared by the local and remote tiers.

use crate::sanitize::FeedKey;
use std::path::PathBuf;

/// One of the three files kept per feed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// The original zipped feed (`K.zip`).
    Source,
    /// The embedded database (`K.v2.db`).
    Db,
    /// The database companion file, required to open `Db` (`K.v2.db.p`).
    DbCompanion,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [Self::Source, Self::Db, Self::DbCompanion];
    /// The pair that is only ever valid together.
    pub const DATABASE: [ArtifactKind; 2] = [Self::Db, Self::DbCompanion];

    /// `v2` is the on-disk schema generation this cache understands.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Source => ".zip",
            Self::Db => ".v2.db",
            Self::DbCompanion => ".v2.db.p",
        }
    }

    /// Relative path of this artifact, used as both file name and object key.
    pub fn path(self, key: &FeedKey) -> PathBuf {
        PathBuf::from(format!("{}{}", key.as_str(), self.suffix()))
    }
}
