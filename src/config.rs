//! Configuration file parser for ~/.config/feedgate/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos.
//!
//! ```toml
//! concurrency = 4
//!
//! [resolver]
//! fetch_timeout_secs = 10
//! rate_limit_spacing_ms = 500
//!
//! [retry]
//! backoff_base_secs = 60
//! jitter_ceiling_secs = 10
//! ```
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::FetchConfig;
use crate::resolver::ResolverConfig;
use crate::retry::{BackoffPolicy, RetryConfig};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. Defaults to `feedgate.db` in the config directory.
    pub database_path: Option<PathBuf>,

    /// Articles resolved at once within a batch.
    pub concurrency: usize,

    /// Articles taken per `refresh` or `retry-due` run.
    pub batch_size: usize,

    pub resolver: ResolverSection,
    pub retry: RetrySection,
    pub feeds: FeedSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            concurrency: 4,
            batch_size: 100,
            resolver: ResolverSection::default(),
            retry: RetrySection::default(),
            feeds: FeedSection::default(),
        }
    }
}

/// `[resolver]`: link resolution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResolverSection {
    pub fetch_timeout_secs: u64,
    pub max_redirects: usize,
    pub rate_limit_spacing_ms: u64,
    pub max_fetch_retries: u32,
    pub fetch_retry_base_ms: u64,
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 10,
            max_redirects: 10,
            rate_limit_spacing_ms: 500,
            max_fetch_retries: 3,
            fetch_retry_base_ms: 200,
        }
    }
}

/// `[retry]`: persistent retries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub jitter_ceiling_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 60,
            jitter_ceiling_secs: 10,
        }
    }
}

/// `[feeds]`: feed fetching.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub fetch_timeout_secs: u64,
    pub max_retries: u32,
    pub max_size_bytes: usize,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            max_retries: 3,
            max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "database_path",
    "concurrency",
    "batch_size",
    "resolver",
    "retry",
    "feeds",
];
const RESOLVER_KEYS: &[&str] = &[
    "fetch_timeout_secs",
    "max_redirects",
    "rate_limit_spacing_ms",
    "max_fetch_retries",
    "fetch_retry_base_ms",
];
const RETRY_KEYS: &[&str] = &["max_attempts", "backoff_base_secs", "jitter_ceiling_secs"];
const FEED_KEYS: &[&str] = &["fetch_timeout_secs", "max_retries", "max_size_bytes"];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading so a huge file is never loaded
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            warn_unknown_keys(&raw);
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        let r = &self.resolver;
        ResolverConfig {
            fetch_timeout: Duration::from_secs(r.fetch_timeout_secs),
            max_redirects: r.max_redirects,
            rate_limit_spacing: Duration::from_millis(r.rate_limit_spacing_ms),
            max_fetch_retries: r.max_fetch_retries,
            fetch_retry_base: Duration::from_millis(r.fetch_retry_base_ms),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            backoff: BackoffPolicy {
                base: Duration::from_secs(self.retry.backoff_base_secs),
                jitter_ceiling: Duration::from_secs(self.retry.jitter_ceiling_secs),
            },
        }
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout: Duration::from_secs(self.feeds.fetch_timeout_secs),
            max_retries: self.feeds.max_retries,
            max_feed_size: self.feeds.max_size_bytes,
            ..FetchConfig::default()
        }
    }
}

fn warn_unknown_keys(raw: &toml::Table) {
    for (key, value) in raw {
        let section_keys = match key.as_str() {
            "resolver" => Some(RESOLVER_KEYS),
            "retry" => Some(RETRY_KEYS),
            "feeds" => Some(FEED_KEYS),
            _ => None,
        };
        if !KNOWN_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            continue;
        }
        if let (Some(known), Some(table)) = (section_keys, value.as_table()) {
            for sub in table.keys() {
                if !known.contains(&sub.as_str()) {
                    tracing::warn!(key = %format!("{key}.{sub}"), "Unknown key in config file, ignoring");
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
