//! Database schema and migrations for the relational backend
//!
//! Manages the SQLite database with:
//! - events: upstream repository events, keyed by feed id
//! - commits / commit_files: commit detail, keyed by (sha, repo_name)
//! - commit_summaries: analyzer output, 1:1 with commits

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize or migrate the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    // Create version table if not exists
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// V1: Events table with repo+time and type+time range indexes
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            actor_login TEXT NOT NULL,
            created_at TEXT NOT NULL,
            payload TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_repo_time ON events(repo_name, created_at);
        CREATE INDEX IF NOT EXISTS idx_events_type_time ON events(event_type, created_at);
        CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);",
    )?;

    set_schema_version(conn, 1)?;
    Ok(())
}

/// V2: Commits, their files, and analyzer summaries
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS commits (
            sha TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            author_name TEXT NOT NULL,
            author_email TEXT NOT NULL,
            author_login TEXT,
            message TEXT NOT NULL,
            commit_date TEXT NOT NULL,
            branch_name TEXT,
            additions INTEGER NOT NULL,
            deletions INTEGER NOT NULL,
            total_changes INTEGER NOT NULL,
            files_changed INTEGER NOT NULL,
            parent_shas TEXT NOT NULL,
            PRIMARY KEY (sha, repo_name)
        );

        CREATE INDEX IF NOT EXISTS idx_commits_repo_date ON commits(repo_name, commit_date DESC);

        CREATE TABLE IF NOT EXISTS commit_files (
            commit_sha TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            filename TEXT NOT NULL,
            status TEXT NOT NULL,
            additions INTEGER NOT NULL,
            deletions INTEGER NOT NULL,
            patch TEXT,
            PRIMARY KEY (commit_sha, repo_name, filename),
            FOREIGN KEY (commit_sha, repo_name) REFERENCES commits(sha, repo_name) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS commit_summaries (
            commit_sha TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            short_summary TEXT NOT NULL,
            detailed_summary TEXT NOT NULL,
            categories TEXT NOT NULL,
            impact_score REAL NOT NULL,
            complexity_score REAL NOT NULL,
            risk_level TEXT NOT NULL,
            breaking_changes INTEGER NOT NULL,
            security_relevant INTEGER NOT NULL,
            performance_impact TEXT NOT NULL,
            PRIMARY KEY (commit_sha, repo_name)
        );",
    )?;

    set_schema_version(conn, 2)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_init() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        // Verify tables exist
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"events".to_string()));
        assert!(tables.contains(&"commits".to_string()));
        assert!(tables.contains(&"commit_files".to_string()));
        assert!(tables.contains(&"commit_summaries".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[test]
    fn test_schema_init_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
