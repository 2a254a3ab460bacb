//! Runtime configuration for the client layer.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{NimbusError, Result};

/// Connection-count limits, independently per service kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Page connections created at startup and kept by scaling.
    pub min_page: usize,
    /// Upper bound on live page connections.
    pub max_page: usize,
    /// Log connections created at startup.
    pub min_log: usize,
    /// Upper bound on live log connections.
    pub max_log: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_page: 5,
            max_page: 20,
            min_log: 3,
            max_log: 10,
        }
    }
}

impl PoolConfig {
    /// Checks both min/max pairs.
    pub fn validate(&self) -> Result<()> {
        if self.max_page == 0 || self.max_log == 0 {
            return Err(NimbusError::Invalid("pool maximum must be positive"));
        }
        if self.min_page > self.max_page {
            return Err(NimbusError::InvalidOwned(format!(
                "page pool min {} exceeds max {}",
                self.min_page, self.max_page
            )));
        }
        if self.min_log > self.max_log {
            return Err(NimbusError::InvalidOwned(format!(
                "log pool min {} exceeds max {}",
                self.min_log, self.max_log
            )));
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the page service, e.g. `http://127.0.0.1:9997`.
    pub page_service_url: String,
    /// `host:port` of the log service.
    pub log_service_addr: String,
    /// How long `acquire` waits for a free connection.
    pub acquire_timeout_ms: u64,
    /// Period of the pool health-check loop.
    pub health_check_interval_secs: u64,
    /// Hit rate below which the health loop grows a pool by one.
    pub scale_hit_rate_threshold: f64,
    /// Page cache capacity in pages.
    pub cache_pages: usize,
    /// Per-call read/write timeout on both services.
    pub request_timeout_ms: u64,
    /// Whether queued appends are sent before a pipeline stops.
    pub drain_on_shutdown: bool,
    /// Pool limits.
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_service_url: "http://127.0.0.1:9997".to_string(),
            log_service_addr: "127.0.0.1:5433".to_string(),
            acquire_timeout_ms: 1000,
            health_check_interval_secs: 30,
            scale_hit_rate_threshold: 0.8,
            cache_pages: 1024,
            request_timeout_ms: 30_000,
            drain_on_shutdown: true,
            pool: PoolConfig::default(),
        }
    }
}

impl Config {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|err| NimbusError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| NimbusError::Config(err.to_string()))
    }

    /// Checks limits and timeouts for consistency.
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.cache_pages == 0 {
            return Err(NimbusError::Invalid("cache_pages must be positive"));
        }
        if self.acquire_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(NimbusError::Invalid("timeouts must be positive"));
        }
        if self.health_check_interval_secs == 0 {
            return Err(NimbusError::Invalid(
                "health_check_interval_secs must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.scale_hit_rate_threshold) {
            return Err(NimbusError::Invalid(
                "scale_hit_rate_threshold must lie in [0, 1]",
            ));
        }
        Ok(())
    }

    /// `acquire_timeout_ms` as a duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// `request_timeout_ms` as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// `health_check_interval_secs` as a duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}
