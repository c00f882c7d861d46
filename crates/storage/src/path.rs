//! Storage path validation.
//!
//! Every path handed to a backend is relative to that backend's root (a cache
//! directory or a bucket prefix) and must stay inside it.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates and normalizes a storage path.
///
/// `.` components, repeated separators and trailing slashes are dropped, and
/// `..` is resolved as long as it never climbs above the root. Null bytes,
/// Windows prefixes and paths that normalize to nothing are rejected with
/// [`InvalidPath`](crate::error::ErrorKind::InvalidPath).
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use feedcache_storage::validate_path;
///
/// assert!(validate_path("boston.v2.db").is_ok());
/// assert!(validate_path("feeds/boston.zip").is_ok());
/// assert!(validate_path("../boston.zip").is_err());
/// assert_eq!(validate_path("feeds/./old/../boston.zip").unwrap(), Path::new("feeds/boston.zip"));
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let invalid = || ErrorKind::InvalidPath(original.to_path_buf());
    let mut components = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(segment) => {
                // Null bytes survive Path::components() on Unix but truncate
                // paths in C-based syscalls.
                if segment.as_encoded_bytes().contains(&0) {
                    exn::bail!(invalid());
                }
                components.push(segment);
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(invalid()),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
        }
    }
    if components.is_empty() {
        exn::bail!(invalid());
    }
    Ok(components.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("boston.zip", "boston.zip")]
    #[case("boston.v2.db.p", "boston.v2.db.p")]
    #[case("feeds//boston.v2.db", "feeds/boston.v2.db")]
    #[case("./feeds/./boston.zip", "feeds/boston.zip")]
    #[case("feeds/", "feeds")]
    #[case("/feeds", "feeds")]
    #[case("feeds/tmp/../boston.zip", "feeds/boston.zip")]
    fn test_normalizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(input).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("//")]
    #[case("..")]
    #[case("../boston.zip")]
    #[case("feeds/../../boston.zip")]
    #[case("bos\0ton.zip")]
    fn test_rejects(#[case] input: &str) {
        let err = validate(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }
}
