//! Feed Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! [`ErrorKind`] is `Clone`: a single-flight load hands the same failure to
//! every caller that was waiting on it.

use derive_more::{Display, Error};

/// A feed cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for feed cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// ### Terminal
/// - [`ErrorKind::NotFound`]
/// - [`ErrorKind::SourceUnavailable`]
/// - [`ErrorKind::RebuildInconsistency`]
///
/// ### Degraded (recovered inside the fallback pipeline)
/// - [`ErrorKind::RemoteMissing`]
/// - [`ErrorKind::TransientIo`]
/// - [`ErrorKind::LocalCorruption`]
///
/// ### Dependency Errors
/// - [`ErrorKind::Storage`]
/// - [`ErrorKind::Database`], [`ErrorKind::Parse`], [`ErrorKind::Enrichment`],
///   [`ErrorKind::Consumer`] - raised by collaborator implementations.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// No tier holds any artifact for this id.
    #[display("feed not found: {_0}")]
    NotFound(#[error(not(source))] String),
    /// The raw feed is missing locally and could not be downloaded.
    #[display("feed source unavailable: {_0}")]
    SourceUnavailable(#[error(not(source))] String),
    /// The remote tier has no object under this key.
    #[display("remote object missing: {_0}")]
    RemoteMissing(#[error(not(source))] String),
    /// Network or storage failure while talking to the remote tier.
    #[display("remote tier unavailable")]
    TransientIo,
    /// The local database pair exists but cannot be opened.
    #[display("local database corrupt: {_0}")]
    LocalCorruption(#[error(not(source))] String),
    /// An artifact the builder should have produced is missing.
    #[display("rebuild inconsistency, missing artifact: {_0}")]
    RebuildInconsistency(#[error(not(source))] String),
    /// Local cache directory I/O failed.
    #[display("local tier I/O error")]
    Storage,
    /// The embedded database could not be opened, written or closed.
    #[display("database error")]
    Database,
    /// The raw feed could not be parsed.
    #[display("feed parse error")]
    Parse,
    /// Post-load enrichment (pattern detection) failed.
    #[display("feed enrichment error")]
    Enrichment,
    /// The consumer could not turn a database handle into a cached value.
    #[display("feed consumer error")]
    Consumer,
    /// The cache could not be assembled from its configuration.
    #[display("invalid cache configuration: {_0}")]
    Config(#[error(not(source))] String),
    /// A blocking collaborator task panicked or was cancelled.
    #[display("background task failed")]
    Runtime,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo | Self::SourceUnavailable(_) | Self::Storage | Self::Runtime)
    }
}
