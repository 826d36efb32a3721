//! Runtime configuration for image-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All cache, executor, admission and transport knobs live here. A loaded
//! configuration is validated before use so contradictory settings fail fast.

use std::path::{Component, Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::pool::PoolSettings;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "image-cache-tier",
    about = "Fetch images through a memory + disk LRU cache"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Requested width in pixels (0 = keep decoded size).
    #[arg(long, default_value_t = 0)]
    pub width: u32,

    /// Requested height in pixels (0 = keep decoded size).
    #[arg(long, default_value_t = 0)]
    pub height: u32,

    /// Corner radius of the rendition (0 = square corners).
    #[arg(long, default_value_t = 0)]
    pub corner_radius: u32,

    /// Margin around a rounded rendition.
    #[arg(long, default_value_t = 0)]
    pub margin: u32,

    /// Image URLs to fetch.
    #[arg(required = true)]
    pub urls: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache tiers.
    pub cache: CacheConfig,

    /// Task executor used for fetches and cache initialization.
    pub executor: ExecutorConfig,

    /// Admission control.
    pub queue: QueueConfig,

    /// HTTP transport.
    pub transport: TransportConfig,
}

/// Memory and disk tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace directory under the cache root; one loader per namespace.
    pub namespace: String,

    /// Cache root (defaults to the platform cache directory).
    pub cache_dir: Option<PathBuf>,

    /// Cache format version; changing it invalidates every disk entry on next open.
    pub app_version: u32,

    /// Keep decoded bitmaps in memory.
    pub enable_memory_cache: bool,

    /// Memory tier budget, in decoded bytes.
    pub memory_cache_capacity_bytes: usize,

    /// Keep encoded bitmaps on disk.
    pub enable_disk_cache: bool,

    /// Disk tier budget, in encoded bytes.
    pub disk_cache_capacity_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "images".to_string(),
            cache_dir: None,
            app_version: 1,
            enable_memory_cache: true,
            memory_cache_capacity_bytes: 64 * 1024 * 1024, // 64 MB
            enable_disk_cache: true,
            disk_cache_capacity_bytes: 50 * 1024 * 1024, // 50 MB
        }
    }
}

impl CacheConfig {
    /// `<cache root>/<namespace>/`
    pub fn disk_cache_root(&self) -> PathBuf {
        let base = self
            .cache_dir
            .clone()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir);
        base.join(&self.namespace)
    }

    /// The namespace must name exactly one directory below the cache root.
    pub fn validate_namespace(&self) -> Result<(), ConfigError> {
        let namespace = &self.namespace;
        if namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("cache.namespace must not be empty".into()));
        }
        let mut components = Path::new(namespace).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single || namespace.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "cache.namespace {namespace:?} must be a single path component"
            )));
        }
        Ok(())
    }
}

/// Which execution strategy runs fetch tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// One worker; tasks run strictly one at a time in submission order.
    Serial,
    /// A worker pool bounded by `max_pool_size`.
    BoundedParallel,
}

/// Executor settings. Non-positive pool values fall back to the pool defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kind: ExecutorKind,
    pub core_pool_size: i64,
    pub max_pool_size: i64,
    pub keep_alive_millis: i64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::BoundedParallel,
            core_pool_size: 0,
            max_pool_size: 0,
            keep_alive_millis: 0,
        }
    }
}

impl ExecutorConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings::resolve(
            self.core_pool_size,
            self.max_pool_size,
            self.keep_alive_millis,
        )
    }
}

/// Admission control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of fetches admitted at once.
    pub max_in_flight: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_in_flight: crate::request::queue::DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 20_000,
            user_agent: concat!("image-cache-tier/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cache = &self.cache;
        cache.validate_namespace()?;
        if cache.enable_memory_cache && cache.memory_cache_capacity_bytes == 0 {
            return Err(ConfigError::Invalid(
                "memory cache enabled with zero capacity".into(),
            ));
        }
        if cache.enable_disk_cache && cache.disk_cache_capacity_bytes == 0 {
            return Err(ConfigError::Invalid(
                "disk cache enabled with zero capacity".into(),
            ));
        }
        if self.queue.max_in_flight == 0 {
            return Err(ConfigError::Invalid("queue.max_in_flight must be at least 1".into()));
        }
        if self.transport.connect_timeout_ms == 0 || self.transport.read_timeout_ms == 0 {
            return Err(ConfigError::Invalid("transport timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
