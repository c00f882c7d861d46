//! Blob storage backends for feed artifacts.
//!
//! Every backend speaks the same small async CRUD interface
//! ([`StorageBackend`]), so the feed cache can treat the local cache
//! directory and a remote bucket as interchangeable tiers.

pub mod backend;
pub mod error;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::path::validate as validate_path;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
