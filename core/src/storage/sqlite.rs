//! Relational storage backend
//!
//! File-backed SQLite database. Idempotency comes from primary keys plus
//! `INSERT OR IGNORE`; a commit and its files are written in one transaction.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row, TransactionBehavior};
use tracing::{debug, warn};

use super::{HealthStatus, Storage};
use crate::error::{Error, Result};
use crate::types::{
    format_timestamp, parse_timestamp, Category, Commit, CommitFile, CommitStats, CommitSummary,
    Event, EventQuery, EventType, FileStatus, PerformanceImpact, RiskLevel,
};

const BACKEND: &str = "sqlite";

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const COMMIT_COLUMNS: &str = "sha, repo_name, author_name, author_email, author_login, message,
     commit_date, branch_name, additions, deletions, total_changes, files_changed, parent_shas";

/// SQLite-backed [`Storage`].
pub struct SqliteStorage {
    /// Path to the database file
    path: PathBuf,
}

impl SqliteStorage {
    /// Open or create a database at the given path
    pub fn open(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(&path)?;
        // WAL lets readers proceed while the collector writes
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("SQLite journal mode: {}", mode);
        crate::schema::init_schema(&conn)?;

        Ok(Self { path })
    }

    /// Get a new connection (connections are not shared between threads)
    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(|e| Error::StorageUnavailable(format!("{}: {e}", self.path.display())))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }
}

impl Storage for SqliteStorage {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn insert_events(&self, events: &[Event]) -> Result<usize> {
        let mut conn = self.conn()?;
        // Take the write lock up front so concurrent writers wait on the busy timeout
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO events
                    (id, event_type, repo_name, actor_login, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for event in events {
                inserted += stmt.execute(params![
                    event.id,
                    event.event_type.as_str(),
                    event.repo_name,
                    event.actor_login,
                    format_timestamp(&event.created_at),
                    event.payload.to_string(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn count_events_by_type(
        &self,
        window_start: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<BTreeMap<EventType, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, COUNT(*) FROM events
             WHERE created_at >= ?1 AND (?2 IS NULL OR repo_name = ?2)
             GROUP BY event_type",
        )?;

        let rows = stmt.query_map(params![format_timestamp(&window_start), repo], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (event_type, count) = row?;
            match event_type.parse::<EventType>() {
                Ok(t) => {
                    counts.insert(t, count as u64);
                }
                Err(e) => warn!("Ignoring stored events with {}", e),
            }
        }
        Ok(counts)
    }

    fn count_events_by_repo(
        &self,
        window_start: DateTime<Utc>,
        window_end: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT repo_name, COUNT(*) FROM events
             WHERE created_at >= ?1 AND (?2 IS NULL OR created_at < ?2)
             GROUP BY repo_name",
        )?;

        let end = window_end.as_ref().map(format_timestamp);
        let counts = stmt
            .query_map(params![format_timestamp(&window_start), end], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(counts)
    }

    fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let conn = self.conn()?;

        // Build query dynamically
        let mut sql = String::from(
            "SELECT id, event_type, repo_name, actor_login, created_at, payload
             FROM events WHERE created_at >= ?",
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(format_timestamp(&query.since))];

        if let Some(repo) = &query.repo {
            sql.push_str(" AND repo_name = ?");
            params.push(Box::new(repo.clone()));
        }

        if !query.types.is_empty() {
            let placeholders = vec!["?"; query.types.len()].join(", ");
            sql.push_str(&format!(" AND event_type IN ({placeholders})"));
            for t in &query.types {
                params.push(Box::new(t.as_str()));
            }
        }

        sql.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            params.push(Box::new(limit as i64));
        }

        debug!("Query: {} with {} params", sql, params.len());

        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, event_type, repo_name, actor_login, created_at, payload) = row?;
            let (Ok(event_type), Some(created_at), Ok(payload)) = (
                event_type.parse::<EventType>(),
                parse_timestamp(&created_at),
                serde_json::from_str::<serde_json::Value>(&payload),
            ) else {
                warn!("Skipping malformed stored event {}", id);
                continue;
            };
            events.push(Event {
                id,
                event_type,
                repo_name,
                actor_login,
                created_at,
                payload,
            });
        }
        Ok(events)
    }

    fn insert_commit(&self, commit: &Commit, files: &[CommitFile]) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO commits ({COMMIT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
            ),
            params![
                commit.sha,
                commit.repo_name,
                commit.author_name,
                commit.author_email,
                commit.author_login,
                commit.message,
                format_timestamp(&commit.commit_date),
                commit.branch_name,
                commit.stats.additions as i64,
                commit.stats.deletions as i64,
                commit.stats.total_changes as i64,
                commit.files_changed as i64,
                serde_json::to_string(&commit.parent_shas)?,
            ],
        )?;

        if inserted == 0 {
            // Dropping the transaction rolls it back
            return Ok(false);
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO commit_files
                    (commit_sha, repo_name, filename, status, additions, deletions, patch)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for file in files {
                stmt.execute(params![
                    commit.sha,
                    commit.repo_name,
                    file.filename,
                    file.status.as_str(),
                    file.additions as i64,
                    file.deletions as i64,
                    file.patch,
                ])?;
            }
        }

        tx.commit()?;
        Ok(true)
    }

    fn commit_exists(&self, repo: &str, sha: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM commits WHERE sha = ?1 AND repo_name = ?2)",
            params![sha, repo],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn get_recent_commits(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Commit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE repo_name = ?1 AND commit_date >= ?2
             ORDER BY commit_date DESC, sha DESC
             LIMIT ?3"
        ))?;

        let commits = stmt
            .query_map(
                params![repo, format_timestamp(&since), limit as i64],
                commit_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(commits)
    }

    fn get_commit_files(&self, repo: &str, sha: &str) -> Result<Vec<CommitFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT commit_sha, repo_name, filename, status, additions, deletions, patch
             FROM commit_files WHERE commit_sha = ?1 AND repo_name = ?2
             ORDER BY filename",
        )?;

        let files = stmt
            .query_map(params![sha, repo], |row| {
                Ok(CommitFile {
                    commit_sha: row.get(0)?,
                    repo_name: row.get(1)?,
                    filename: row.get(2)?,
                    status: FileStatus::from_upstream(&row.get::<_, String>(3)?),
                    additions: row.get::<_, i64>(4)? as u64,
                    deletions: row.get::<_, i64>(5)? as u64,
                    patch: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    fn upsert_commit_summary(&self, summary: &CommitSummary) -> Result<()> {
        let conn = self.conn()?;
        let categories: Vec<&str> = summary.categories.iter().map(Category::as_str).collect();

        conn.execute(
            "INSERT INTO commit_summaries (
                commit_sha, repo_name, short_summary, detailed_summary, categories,
                impact_score, complexity_score, risk_level, breaking_changes,
                security_relevant, performance_impact
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(commit_sha, repo_name) DO UPDATE SET
                short_summary = excluded.short_summary,
                detailed_summary = excluded.detailed_summary,
                categories = excluded.categories,
                impact_score = excluded.impact_score,
                complexity_score = excluded.complexity_score,
                risk_level = excluded.risk_level,
                breaking_changes = excluded.breaking_changes,
                security_relevant = excluded.security_relevant,
                performance_impact = excluded.performance_impact",
            params![
                summary.commit_sha,
                summary.repo_name,
                summary.short_summary,
                summary.detailed_summary,
                serde_json::to_string(&categories)?,
                summary.impact_score,
                summary.complexity_score,
                summary.risk_level.as_str(),
                summary.breaking_changes,
                summary.security_relevant,
                summary.performance_impact.as_str(),
            ],
        )?;
        Ok(())
    }

    fn get_commit_summary(&self, repo: &str, sha: &str) -> Result<Option<CommitSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT commit_sha, repo_name, short_summary, detailed_summary, categories,
                    impact_score, complexity_score, risk_level, breaking_changes,
                    security_relevant, performance_impact
             FROM commit_summaries WHERE commit_sha = ?1 AND repo_name = ?2",
        )?;

        let mut rows = stmt.query(params![sha, repo])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let categories: String = row.get(4)?;
        let risk_level: String = row.get(7)?;
        let performance_impact: String = row.get(10)?;

        Ok(Some(CommitSummary {
            commit_sha: row.get(0)?,
            repo_name: row.get(1)?,
            short_summary: row.get(2)?,
            detailed_summary: row.get(3)?,
            categories: serde_json::from_str::<Vec<Category>>(&categories)?
                .into_iter()
                .collect(),
            impact_score: row.get(5)?,
            complexity_score: row.get(6)?,
            risk_level: serde_json::from_value::<RiskLevel>(risk_level.into())?,
            breaking_changes: row.get(8)?,
            security_relevant: row.get(9)?,
            performance_impact: serde_json::from_value::<PerformanceImpact>(
                performance_impact.into(),
            )?,
        }))
    }

    fn health_check(&self) -> HealthStatus {
        let read_counts = || -> Result<(u64, u64)> {
            let conn = self.conn()?;
            let events: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            let commits: i64 =
                conn.query_row("SELECT COUNT(*) FROM commits", [], |row| row.get(0))?;
            Ok((events as u64, commits as u64))
        };

        match read_counts() {
            Ok((events, commits)) => HealthStatus::healthy(BACKEND, events, commits),
            Err(e) => HealthStatus::unhealthy(BACKEND, e.to_string()),
        }
    }
}

fn commit_from_row(row: &Row<'_>) -> rusqlite::Result<Commit> {
    let commit_date: String = row.get(6)?;
    let parent_shas: String = row.get(12)?;

    Ok(Commit {
        sha: row.get(0)?,
        repo_name: row.get(1)?,
        author_name: row.get(2)?,
        author_email: row.get(3)?,
        author_login: row.get(4)?,
        message: row.get(5)?,
        commit_date: parse_timestamp(&commit_date).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                Type::Text,
                format!("invalid commit_date {commit_date}").into(),
            )
        })?,
        branch_name: row.get(7)?,
        stats: CommitStats {
            additions: row.get::<_, i64>(8)? as u64,
            deletions: row.get::<_, i64>(9)? as u64,
            total_changes: row.get::<_, i64>(10)? as u64,
        },
        files_changed: row.get::<_, i64>(11)? as u64,
        parent_shas: serde_json::from_str(&parent_shas)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("repopulse.db")).unwrap();
        (dir, storage)
    }

    fn event(id: &str, event_type: EventType, hour: u32) -> Event {
        Event {
            id: id.to_string(),
            event_type,
            repo_name: "o/r".to_string(),
            actor_login: "octocat".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            payload: json!({"n": id}),
        }
    }

    #[test]
    fn test_insert_events_counts_only_new_rows() {
        let (_dir, storage) = open_temp();
        let batch = vec![
            event("1", EventType::PushEvent, 1),
            event("2", EventType::IssuesEvent, 2),
            event("1", EventType::PushEvent, 1),
        ];

        assert_eq!(storage.insert_events(&batch).unwrap(), 2);
        assert_eq!(storage.insert_events(&batch).unwrap(), 0);
        assert_eq!(storage.health_check().events, 2);
    }

    #[test]
    fn test_list_events_filters_and_orders() {
        let (_dir, storage) = open_temp();
        storage
            .insert_events(&[
                event("b", EventType::PushEvent, 3),
                event("a", EventType::PushEvent, 3),
                event("c", EventType::IssuesEvent, 1),
            ])
            .unwrap();

        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let all = storage.list_events(&EventQuery::since(since)).unwrap();
        let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(all[1].payload, json!({"n": "a"}));

        let pushes = storage
            .list_events(&EventQuery::since(since).types(&[EventType::PushEvent]).limit(1))
            .unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].id, "a");
    }

    #[test]
    fn test_unhealthy_when_file_is_not_a_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repopulse.db");
        let storage = SqliteStorage::open(path.clone()).unwrap();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let status = storage.health_check();
        assert!(!status.healthy);
        assert!(status.detail.is_some());
    }
}
