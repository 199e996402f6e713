//! Configuration management for the sandcas CLI.
//!
//! Configuration is read from TOML. The default path is
//! `~/.config/sandcas/config.toml`; a missing file means defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sandcas_core::{
    Algorithm, DEFAULT_CACHE_DIR, DEFAULT_CACHE_PREFIX, StoreOptions, TransportOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("hash_algorithm must be md5 or blake3, got {0}")]
    InvalidAlgorithm(String),

    #[error("cache directory must be a non-empty relative path, got {0}")]
    InvalidCacheDirectory(String),

    #[error("cache prefix must be non-empty and contain no path separators, got {0}")]
    InvalidCachePrefix(String),

    #[error("connect_timeout_secs must be between 1 and 600, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

/// Sandbox root and hashing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Sandbox root directory.
    pub root: PathBuf,

    /// Digest algorithm (md5, blake3).
    pub hash_algorithm: String,
}

/// Asset cache settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache directory, relative to the sandbox root.
    pub directory: String,

    /// Cache file name prefix.
    pub prefix: String,

    /// Asset manifest (JSON).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<PathBuf>,
}

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./sandcas-root"),
            hash_algorithm: Algorithm::default().as_str().to_string(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: DEFAULT_CACHE_DIR.to_string(),
            prefix: DEFAULT_CACHE_PREFIX.to_string(),
            manifest: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let transport = TransportOptions::default();
        Self {
            connect_timeout_secs: transport.connect_timeout.as_secs(),
            user_agent: transport.user_agent,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandcas")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported variables:
    /// - SANDCAS_ROOT: Override the sandbox root
    /// - SANDCAS_LOG_LEVEL: Override log level
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source. Empty values are ignored.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup("SANDCAS_ROOT").filter(|v| !v.is_empty()) {
            tracing::debug!("Overriding sandbox root from environment: {}", root);
            self.sandbox.root = PathBuf::from(root);
        }

        if let Some(level) = lookup("SANDCAS_LOG_LEVEL").filter(|v| !v.is_empty()) {
            tracing::debug!("Overriding log level from environment: {}", level);
            self.logging.level = level;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if Algorithm::parse(&self.sandbox.hash_algorithm).is_err() {
            return Err(ConfigError::InvalidAlgorithm(
                self.sandbox.hash_algorithm.clone(),
            ));
        }

        let directory = Path::new(&self.cache.directory);
        if self.cache.directory.is_empty() || directory.is_absolute() {
            return Err(ConfigError::InvalidCacheDirectory(
                self.cache.directory.clone(),
            ));
        }

        let prefix = &self.cache.prefix;
        if prefix.is_empty() || prefix.contains(['/', '\\']) || prefix.starts_with('.') {
            return Err(ConfigError::InvalidCachePrefix(prefix.clone()));
        }

        let timeout = self.network.connect_timeout_secs;
        if !(1..=600).contains(&timeout) {
            return Err(ConfigError::InvalidConnectTimeout(timeout));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }

    /// The configured algorithm. Call [`Config::validate`] first.
    pub fn algorithm(&self) -> Algorithm {
        Algorithm::parse(&self.sandbox.hash_algorithm).unwrap_or_default()
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            algorithm: self.algorithm(),
            cache_dir: self.cache.directory.clone(),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            user_agent: self.network.user_agent.clone(),
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
