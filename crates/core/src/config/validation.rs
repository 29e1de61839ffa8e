//! Configuration validation rules.
//!
//! Checks applied to `AppConfig` after it has been loaded from environment,
//! files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Hard ceiling on concurrent fetches.
pub const MAX_WORKERS: usize = 64;

const MIN_TIMEOUT_MS: u64 = 100;
const MAX_TIMEOUT_MS: u64 = 300_000;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: &str) -> Self {
        Self::Invalid { field: field.into(), reason: reason.into() }
    }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - any size budget, `values_per_entry`, `workers` or `max_fetch_bytes` is 0
    /// - `workers` exceeds 64
    /// - a timeout is below 100ms or above 5 minutes
    /// - `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_max_bytes == 0 {
            return Err(ConfigError::invalid("memory_max_bytes", "must be greater than 0"));
        }
        if self.disk_max_bytes == 0 {
            return Err(ConfigError::invalid("disk_max_bytes", "must be greater than 0"));
        }
        if self.values_per_entry == 0 {
            return Err(ConfigError::invalid("values_per_entry", "must be greater than 0"));
        }

        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be greater than 0"));
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::invalid("workers", "must not exceed 64"));
        }

        for (field, value) in [("connect_timeout_ms", self.connect_timeout_ms), ("read_timeout_ms", self.read_timeout_ms)]
        {
            if value < MIN_TIMEOUT_MS {
                return Err(ConfigError::invalid(field, "must be at least 100ms"));
            }
            if value > MAX_TIMEOUT_MS {
                return Err(ConfigError::invalid(field, "must not exceed 5 minutes (300000ms)"));
            }
        }

        if self.max_fetch_bytes == 0 {
            return Err(ConfigError::invalid("max_fetch_bytes", "must be greater than 0"));
        }
        if self.user_agent.is_empty() {
            return Err(ConfigError::invalid("user_agent", "must not be empty"));
        }

        if self.max_fetch_bytes as u64 > self.disk_max_bytes {
            tracing::warn!(
                max_fetch_bytes = self.max_fetch_bytes,
                disk_max_bytes = self.disk_max_bytes,
                "max_fetch_bytes exceeds disk_max_bytes; large fetches will be evicted immediately"
            );
        }

        Ok(())
    }
}
