//! Storage contract shared by the collector, analyzer and metrics engine
//!
//! Two adapters implement [`Storage`] with identical observable behavior:
//! - [`SqliteStorage`]: relational, file-backed, SQL range queries
//! - [`PartitionedStorage`]: partitioned key/value items with composite-key indexes
//!
//! The backend is chosen once at construction via [`StorageConfig`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kvstore::DEFAULT_PARTITIONS;
use crate::types::{Commit, CommitFile, CommitSummary, Event, EventQuery, EventType};

mod partitioned;
mod sqlite;

pub use partitioned::PartitionedStorage;
pub use sqlite::SqliteStorage;

/// Result of a storage health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Backend identifier ("sqlite" or "partitioned")
    pub backend: String,
    /// Whether the backend answered the check
    pub healthy: bool,
    /// Failure detail when unhealthy
    pub detail: Option<String>,
    /// Stored event count (0 when unhealthy)
    pub events: u64,
    /// Stored commit count (0 when unhealthy)
    pub commits: u64,
}

impl HealthStatus {
    pub(crate) fn healthy(backend: &str, events: u64, commits: u64) -> Self {
        Self {
            backend: backend.to_string(),
            healthy: true,
            detail: None,
            events,
            commits,
        }
    }

    pub(crate) fn unhealthy(backend: &str, detail: impl Into<String>) -> Self {
        Self {
            backend: backend.to_string(),
            healthy: false,
            detail: Some(detail.into()),
            events: 0,
            commits: 0,
        }
    }
}

/// Repository contract over events, commits and commit summaries.
///
/// Inserts are idempotent: re-inserting an existing key is a silent no-op,
/// never an error. Implementations rely on their backend's own
/// transactional or conditional-write primitives for concurrent safety.
pub trait Storage: Send + Sync {
    /// Short backend identifier for logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Insert events, skipping ids that already exist.
    ///
    /// # Returns
    /// Number of events actually inserted.
    fn insert_events(&self, events: &[Event]) -> Result<usize>;

    /// Count events per type created at or after `window_start`.
    fn count_events_by_type(
        &self,
        window_start: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<BTreeMap<EventType, u64>>;

    /// Count events per repository in `[window_start, window_end)`.
    fn count_events_by_repo(
        &self,
        window_start: DateTime<Utc>,
        window_end: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, u64>>;

    /// List events ordered by `created_at` ascending, ties by id.
    fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>>;

    /// Insert a commit together with its files, atomically.
    ///
    /// # Returns
    /// `false` if `(sha, repo_name)` was already stored; nothing is written.
    fn insert_commit(&self, commit: &Commit, files: &[CommitFile]) -> Result<bool>;

    /// Whether `(sha, repo)` is stored.
    fn commit_exists(&self, repo: &str, sha: &str) -> Result<bool>;

    /// Commits of `repo` with `commit_date >= since`, newest first.
    fn get_recent_commits(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Commit>>;

    /// Files of a stored commit, ordered by filename.
    fn get_commit_files(&self, repo: &str, sha: &str) -> Result<Vec<CommitFile>>;

    /// Store a summary, replacing any previous one for the same commit.
    fn upsert_commit_summary(&self, summary: &CommitSummary) -> Result<()>;

    /// Fetch the stored summary of a commit.
    fn get_commit_summary(&self, repo: &str, sha: &str) -> Result<Option<CommitSummary>>;

    /// Check the backend. Never errors; failures are reported in the status.
    fn health_check(&self) -> HealthStatus;
}

/// Backend selector and connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// SQLite database file
    Sqlite { path: PathBuf },
    /// Partitioned key/value store, optionally persisted to a log file
    Partitioned {
        #[serde(default)]
        log_path: Option<PathBuf>,
        #[serde(default = "default_partitions")]
        partitions: usize,
    },
}

fn default_partitions() -> usize {
    DEFAULT_PARTITIONS
}

/// Open the configured backend.
///
/// # Errors
/// Returns an error if the database or log file cannot be opened.
pub fn open(config: &StorageConfig) -> Result<Box<dyn Storage>> {
    match config {
        StorageConfig::Sqlite { path } => Ok(Box::new(SqliteStorage::open(path.clone())?)),
        StorageConfig::Partitioned {
            log_path: Some(path),
            partitions,
        } => Ok(Box::new(PartitionedStorage::open(path, *partitions)?)),
        StorageConfig::Partitioned {
            log_path: None,
            partitions,
        } => Ok(Box::new(PartitionedStorage::in_memory(*partitions))),
    }
}
