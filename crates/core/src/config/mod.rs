//! Application configuration with layered loading.
//!
//! Sources, highest precedence first:
//!
//! 1. Environment variables (PIXCACHE_*)
//! 2. TOML config file (if PIXCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::{ConfigError, MAX_WORKERS};

const MIB: u64 = 1024 * 1024;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (PIXCACHE_*)
/// 2. TOML config file (if PIXCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the disk cache journal and entry files.
    ///
    /// Set via PIXCACHE_CACHE_DIR environment variable.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Cache format version recorded in the journal header. Changing it
    /// discards the existing disk cache on next open.
    #[serde(default = "default_app_version")]
    pub app_version: u32,

    /// Number of files stored per disk entry.
    #[serde(default = "default_values_per_entry")]
    pub values_per_entry: usize,

    /// Memory tier budget, in bytes of decoded values.
    ///
    /// Set via PIXCACHE_MEMORY_MAX_BYTES environment variable.
    #[serde(default = "default_memory_max_bytes")]
    pub memory_max_bytes: usize,

    /// Disk tier budget, in bytes of committed files.
    ///
    /// Set via PIXCACHE_DISK_MAX_BYTES environment variable.
    #[serde(default = "default_disk_max_bytes")]
    pub disk_max_bytes: u64,

    /// Maximum number of fetches in flight at once.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,

    /// User-Agent string for HTTP requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Responses larger than this are rejected without being cached.
    #[serde(default = "default_max_fetch_bytes")]
    pub max_fetch_bytes: usize,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./pixcache")
}

fn default_app_version() -> u32 {
    1
}

fn default_values_per_entry() -> usize {
    1
}

fn default_memory_max_bytes() -> usize {
    32 * MIB as usize
}

fn default_disk_max_bytes() -> u64 {
    10 * MIB
}

fn default_workers() -> usize {
    5
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_user_agent() -> String {
    "pixcache/0.1".into()
}

fn default_max_fetch_bytes() -> usize {
    10 * MIB as usize
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            app_version: default_app_version(),
            values_per_entry: default_values_per_entry(),
            memory_max_bytes: default_memory_max_bytes(),
            disk_max_bytes: default_disk_max_bytes(),
            workers: default_workers(),
            connect_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            user_agent: default_user_agent(),
            max_fetch_bytes: default_max_fetch_bytes(),
        }
    }
}

impl AppConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `PIXCACHE_`
    /// 2. TOML file from `PIXCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("PIXCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        Self::extract(figment.merge(Env::prefixed("PIXCACHE_").ignore(&["config_file"]).split("__")))
    }

    /// Load from defaults overlaid with a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Serialized::defaults(Self::default())).merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
