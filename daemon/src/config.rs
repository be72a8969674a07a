//! Daemon configuration
//!
//! Loaded from `config.toml` in the repopulse home directory
//! (`~/.repopulse`). Every field has a default, so a missing file or a
//! missing section runs the collector against the public feed with a
//! SQLite database in the home directory.
//!
//! ```toml
//! [collector]
//! poll_interval_secs = 60
//! event_types = ["PushEvent", "PullRequestEvent"]
//! target_repos = ["rust-lang/rust"]
//!
//! [storage]
//! backend = "partitioned"
//! log_path = "/var/lib/repopulse/items.log"
//!
//! [metrics]
//! anomaly_k = 3.0
//! ```
//!
//! Credential resolution order:
//! 1. Config file `collector.token`
//! 2. `GITHUB_TOKEN` environment variable
//!
//! `REPOPULSE_STORAGE` (`sqlite` or `partitioned`) overrides the configured
//! backend with that backend's defaults.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use repopulse_core::{EventType, MetricsPolicy, StorageConfig, DEFAULT_PARTITIONS};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
const DEFAULT_PAGES_PER_POLL: u32 = 1;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COMMIT_CONCURRENCY: usize = 4;
const DEFAULT_SEEN_CACHE_CAPACITY: usize = 10_000;

const TOKEN_ENV: &str = "GITHUB_TOKEN";
const STORAGE_ENV: &str = "REPOPULSE_STORAGE";

/// Collector options
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Seconds between poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Monitored event types (default: all known types)
    #[serde(default = "default_event_types")]
    pub event_types: Vec<EventType>,
    /// API token override (optional)
    pub token: Option<String>,
    /// Repositories to follow as `owner/name`; empty follows the public feed
    #[serde(default)]
    pub target_repos: Vec<String>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Feed pages requested per poll
    #[serde(default = "default_pages_per_poll")]
    pub pages_per_poll: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Concurrent commit-detail fetches
    #[serde(default = "default_commit_concurrency")]
    pub commit_concurrency: usize,
    /// Recently seen event ids kept in memory
    #[serde(default = "default_seen_cache_capacity")]
    pub seen_cache_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            event_types: default_event_types(),
            token: None,
            target_repos: Vec::new(),
            api_base_url: default_api_base_url(),
            pages_per_poll: default_pages_per_poll(),
            request_timeout_secs: default_request_timeout(),
            commit_concurrency: default_commit_concurrency(),
            seen_cache_capacity: default_seen_cache_capacity(),
        }
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_event_types() -> Vec<EventType> {
    EventType::ALL.to_vec()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_pages_per_poll() -> u32 {
    DEFAULT_PAGES_PER_POLL
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_commit_concurrency() -> usize {
    DEFAULT_COMMIT_CONCURRENCY
}

fn default_seen_cache_capacity() -> usize {
    DEFAULT_SEEN_CACHE_CAPACITY
}

/// Top-level `config.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Storage backend; defaults to SQLite in the home directory
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    #[serde(default)]
    pub metrics: MetricsPolicy,
}

impl Config {
    /// Load `config.toml` from `path`, or defaults if the file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.collector.poll_interval_secs == 0 {
            bail!("collector.poll_interval_secs must be at least 1");
        }
        if config.collector.commit_concurrency == 0 {
            bail!("collector.commit_concurrency must be at least 1");
        }
        Ok(config)
    }

    /// Storage selection after applying `REPOPULSE_STORAGE`.
    ///
    /// # Errors
    /// Returns an error if the override names an unknown backend.
    pub fn storage_config(&self, home: &Path) -> anyhow::Result<StorageConfig> {
        let backend = std::env::var(STORAGE_ENV).ok().filter(|v| !v.is_empty());
        resolve_storage(self.storage.as_ref(), backend.as_deref(), home)
    }
}

fn resolve_storage(
    configured: Option<&StorageConfig>,
    override_backend: Option<&str>,
    home: &Path,
) -> anyhow::Result<StorageConfig> {
    match override_backend {
        Some("sqlite") => Ok(StorageConfig::Sqlite {
            path: home.join("repopulse.db"),
        }),
        Some("partitioned") => Ok(StorageConfig::Partitioned {
            log_path: Some(home.join("repopulse.log")),
            partitions: DEFAULT_PARTITIONS,
        }),
        Some(other) => bail!("{STORAGE_ENV} must be 'sqlite' or 'partitioned', got '{other}'"),
        None => Ok(configured.cloned().unwrap_or_else(|| StorageConfig::Sqlite {
            path: home.join("repopulse.db"),
        })),
    }
}

/// Resolve the API token from config or environment
pub fn resolve_token(config: &CollectorConfig) -> Option<String> {
    // 1. Check config file
    if let Some(ref token) = config.token {
        if !token.is_empty() {
            debug!("Using API token from config file");
            return Some(token.clone());
        }
    }

    // 2. Check environment variable
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.is_empty() {
            debug!("Using API token from {} env var", TOKEN_ENV);
            return Some(token);
        }
    }

    None
}

/// The repopulse home directory (`~/.repopulse`)
pub fn home_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".repopulse"))
        .unwrap_or_else(|| PathBuf::from("/tmp/.repopulse"))
}
