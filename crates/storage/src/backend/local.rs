//! Local filesystem storage backend.
//!
//! Files are stored under a configured root directory and accessed via
//! `tokio::fs`. Writes are staged in a temporary sibling file and renamed into
//! place, so readers never observe half-written artifacts.

use crate::error::ErrorKind;
use crate::{StorageBackend, error::Result, path::validate as validate_path};
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{File, create_dir_all as sync_create_dir};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs;

/// Local filesystem storage backend.
///
/// # Examples
///
/// ```no_run
/// use feedcache_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("local", "/var/cache/feeds")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct LocalBackend {
    name: String,
    /// Root directory holding every artifact
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend, creating `root` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if the path is not
    /// absolute or exists but is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Only happens once at startup; not worth an async constructor.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a relative storage path.
    ///
    /// This is what gets handed to code that needs a real filesystem path
    /// (such as an embedded database engine).
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Copy a file from anywhere on the filesystem into this backend.
    ///
    /// Returns [`NotFound`](ErrorKind::NotFound) if `external` does not exist.
    pub async fn import(&self, external: &Path, path: &Path) -> Result<()> {
        let external = external.to_path_buf();
        self.persist_with(path, move |staged| {
            let mut source = File::open(&external)?;
            io::copy(&mut source, staged)?;
            Ok(())
        })
        .await
    }

    fn map_io_error(e: io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Stage content in a temporary file next to the destination, then
    /// atomically rename it into place. The temporary file is removed when
    /// `fill` fails or the task is dropped.
    async fn persist_with<F>(&self, path: &Path, fill: F) -> Result<()>
    where
        F: FnOnce(&mut File) -> io::Result<()> + Send + 'static,
    {
        let abs_path = self.resolve(path)?;
        let parent = abs_path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await.map_err(|e| Self::map_io_error(e, path))?;
        let relative = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut staged = NamedTempFile::new_in(&parent).map_err(|e| Self::map_io_error(e, &relative))?;
            fill(staged.as_file_mut()).map_err(|e| Self::map_io_error(e, &relative))?;
            staged.as_file_mut().flush().map_err(ErrorKind::Io)?;
            staged.as_file().sync_all().map_err(ErrorKind::Io)?;
            staged.persist(&abs_path).map_err(|e| Self::map_io_error(e.error, &relative))?;
            Ok(())
        })
        .await
        .or_raise(|| ErrorKind::BackendError(format!("write task for {} did not complete", path.display())))?
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.resolve(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.resolve(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.persist_with(path, move |staged| staged.write_all(&data)).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let abs_path = self.resolve(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve(from)?;
        self.persist_with(to, move |staged| {
            let mut source = File::open(&from_path)?;
            io::copy(&mut source, staged)?;
            Ok(())
        })
        .await
    }
}
