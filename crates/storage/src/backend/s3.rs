//! S3-compatible storage backend.
//!
//! Stores artifacts in an S3 bucket (AWS S3, MinIO, Backblaze B2, ...),
//! optionally under a key prefix that plays the role of a bucket folder.
//! Credentials are provided explicitly via configuration.

use crate::{
    StorageBackend,
    error::{ErrorKind, Result},
    validate_path,
};
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::ProvideErrorMetadata,
    primitives::ByteStream,
};
use exn::{OptionExt, ResultExt};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// S3-compatible storage backend.
///
/// # Examples
///
/// ```no_run
/// use feedcache_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "feeds",
///     "transit-feeds",
///     Some("gtfs/".to_string()),
///     "us-east-1",
///     None::<String>,
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    /// Rate limiter for concurrent S3 requests.
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as a bucket folder)
    /// * `region` - AWS region or provider-specific region
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - Access key ID
    /// * `key_secret` - Secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let credentials = Credentials::new(key_id, key_secret, None, None, "feedcache-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // 1 initial attempt + 3 retries with exponential backoff
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Self::from_client(name, Client::from_conf(config_builder.build()), bucket, prefix)
    }

    /// Wrap an already configured client.
    pub fn from_client(
        name: impl Into<String>,
        client: Client,
        bucket: impl Into<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .filter(|p| !p.trim_matches('/').is_empty())
            .map(validate_path)
            .transpose()?
            .map(|p| p.to_str().map(|s| s.to_string()).ok_or_raise(|| ErrorKind::InvalidPath(p)))
            .transpose()?;
        Ok(Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Construct the full object key from a relative path.
    fn full_key(&self, path: &Path) -> Result<String> {
        object_key(self.prefix.as_deref(), path)
    }

    /// Acquire a rate limiter permit before making an S3 API call.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }
}

/// Join an optional prefix and a validated relative path into an object key.
fn object_key(prefix: Option<&str>, path: &Path) -> Result<String> {
    let validated = validate_path(path)?;
    let path_str = validated.to_str().ok_or_raise(|| ErrorKind::InvalidPath(validated.clone()))?;
    Ok(match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path_str),
        None => path_str.to_string(),
    })
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(err) => match err.into_service_error() {
                e if e.is_not_found() => Ok(false),
                e => Err(e).or_raise(|| ErrorKind::Network(format!("HEAD s3://{}/{key}", self.bucket))),
            },
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(err) => match err.into_service_error() {
                e if e.is_no_such_key() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
                e => return Err(e).or_raise(|| ErrorKind::Network(format!("GET s3://{}/{key}", self.bucket))),
            },
        };
        let body = output
            .body
            .collect()
            .await
            .or_raise(|| ErrorKind::Network(format!("reading body of s3://{}/{key}", self.bucket)))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .or_raise(|| ErrorKind::Network(format!("PUT s3://{}/{key}", self.bucket)))?;
        tracing::debug!(backend = %self.name, key = %key, bytes = data.len(), "Object written");
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .or_raise(|| ErrorKind::Network(format!("DELETE s3://{}/{key}", self.bucket)))?;
        Ok(())
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let from_key = self.full_key(from)?;
        let to_key = self.full_key(to)?;
        let _permit = self.acquire_permit().await?;
        match self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{from_key}", self.bucket))
            .key(&to_key)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match err.into_service_error() {
                // CopyObject has no modelled "missing source" variant.
                e if e.code() == Some("NoSuchKey") => exn::bail!(ErrorKind::NotFound(from.to_path_buf())),
                e => Err(e).or_raise(|| ErrorKind::Network(format!("COPY s3://{}/{from_key}", self.bucket))),
            },
        }
    }
}
