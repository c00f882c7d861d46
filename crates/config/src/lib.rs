//! Configuration loading and validation.
//!
//! Values are layered (lowest priority first):
//! 1. built-in defaults,
//! 2. an optional config file (TOML, YAML or JSON, chosen by extension),
//! 3. `FEEDCACHE_`-prefixed environment variables, using `__` to reach
//!    nested keys (`FEEDCACHE_REMOTE__BUCKET=transit-feeds`).
//!
//! Leaving out the `remote` table entirely gives a fully offline cache.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Number of feeds kept open when nothing else is configured.
pub const DEFAULT_CAPACITY: usize = 20;
const ENV_PREFIX: &str = "FEEDCACHE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Absolute directory holding the local tier (`K.zip`, `K.v2.db`, `K.v2.db.p`).
    pub cache_dir: PathBuf,
    /// Maximum number of resident feeds.
    pub capacity: usize,
    /// Remote object-store tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub bucket: String,
    /// Key prefix inside the bucket.
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub key_secret: String,
    /// Never upload or delete remote objects; downloads still happen.
    #[serde(default)]
    pub read_only: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_cache_dir() -> PathBuf {
    match ProjectDirs::from("", "", "feedcache") {
        Some(dirs) => dirs.cache_dir().join("feeds"),
        None => std::env::temp_dir().join("feedcache").join("feeds"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            capacity: DEFAULT_CAPACITY,
            remote: None,
        }
    }
}

impl Config {
    /// Build the layered [`Figment`] without extracting it.
    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            if !file.is_file() {
                exn::bail!(ErrorKind::Invalid(format!("config file not found: {}", file.display())));
            }
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => exn::bail!(ErrorKind::Invalid(format!("unsupported config format: {}", file.display()))),
            };
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate the configuration.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Config = Self::figment(file)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(
            cache_dir = %config.cache_dir.display(),
            capacity = config.capacity,
            remote = config.remote.as_ref().map(|r| r.bucket.as_str()),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cache_dir.is_absolute() {
            exn::bail!(ErrorKind::Invalid("cache_dir must be an absolute path".to_string()));
        }
        if self.capacity == 0 {
            exn::bail!(ErrorKind::Invalid("capacity must be at least 1".to_string()));
        }
        if let Some(remote) = &self.remote
            && remote.bucket.trim().is_empty()
        {
            exn::bail!(ErrorKind::Invalid("remote bucket name is empty".to_string()));
        }
        Ok(())
    }
}
