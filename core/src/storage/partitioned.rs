//! Partitioned key/value storage backend
//!
//! Single-table-per-aggregate layout over [`KvStore`]:
//!
//! | table | partition key | sort key | item |
//! |---|---|---|---|
//! | `events` | `EVENT#{id}` | `META` | event |
//! | `commits` | `COMMIT#{repo}#{sha}` | `META` | commit |
//! | `commits` | `COMMIT#{repo}#{sha}` | `FILE#{filename}` | commit file |
//! | `commits` | `COMMIT#{repo}#{sha}` | `SUMMARY` | commit summary |
//!
//! Range queries go through secondary indexes keyed by composite sort keys:
//! `repo_time` and `type_time` on events (`{created_at}#{id}`), and
//! `commit_date` on commits (`{commit_date}#{sha}`).

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use super::{HealthStatus, Storage};
use crate::error::{Error, Result};
use crate::kvstore::{IndexDef, Item, Key, KvStore, SortRange, TableDef};
use crate::types::{
    format_timestamp, Commit, CommitFile, CommitSummary, Event, EventQuery, EventType,
};

const BACKEND: &str = "partitioned";

const EVENTS: &str = "events";
const COMMITS: &str = "commits";

const REPO_TIME: &str = "repo_time";
const TYPE_TIME: &str = "type_time";
const COMMIT_DATE: &str = "commit_date";

const META: &str = "META";
const SUMMARY: &str = "SUMMARY";
const FILE_PREFIX: &str = "FILE#";

const KIND_COMMIT: &str = "commit";
const KIND_FILE: &str = "file";
const KIND_SUMMARY: &str = "summary";

fn str_field<'a>(item: &'a Item, field: &str) -> Option<&'a str> {
    item.get(field)?.as_str()
}

fn project_repo_time(item: &Item) -> Option<Key> {
    Some(Key::new(
        str_field(item, "repo_name")?,
        format!("{}#{}", str_field(item, "created_at")?, str_field(item, "id")?),
    ))
}

fn project_type_time(item: &Item) -> Option<Key> {
    Some(Key::new(
        str_field(item, "event_type")?,
        format!("{}#{}", str_field(item, "created_at")?, str_field(item, "id")?),
    ))
}

fn project_commit_date(item: &Item) -> Option<Key> {
    if str_field(item, "kind")? != KIND_COMMIT {
        return None;
    }
    Some(Key::new(
        str_field(item, "repo_name")?,
        format!("{}#{}", str_field(item, "commit_date")?, str_field(item, "sha")?),
    ))
}

fn table_defs() -> Vec<TableDef> {
    vec![
        TableDef {
            name: EVENTS,
            indexes: vec![
                IndexDef {
                    name: REPO_TIME,
                    project: project_repo_time,
                },
                IndexDef {
                    name: TYPE_TIME,
                    project: project_type_time,
                },
            ],
        },
        TableDef {
            name: COMMITS,
            indexes: vec![IndexDef {
                name: COMMIT_DATE,
                project: project_commit_date,
            }],
        },
    ]
}

fn event_key(id: &str) -> Key {
    Key::new(format!("EVENT#{id}"), META)
}

fn commit_partition(repo: &str, sha: &str) -> String {
    format!("COMMIT#{repo}#{sha}")
}

/// Serialize a record and tag it; timestamps are rewritten in the fixed
/// storage format so index sort keys compare chronologically.
fn to_item<T: serde::Serialize>(
    record: &T,
    kind: Option<&str>,
    timestamp: Option<(&str, &DateTime<Utc>)>,
) -> Result<Item> {
    let mut item = serde_json::to_value(record)?;
    let Value::Object(map) = &mut item else {
        return Err(Error::Other("record did not serialize to an object".into()));
    };
    if let Some(kind) = kind {
        map.insert("kind".to_string(), Value::String(kind.to_string()));
    }
    if let Some((field, ts)) = timestamp {
        map.insert(field.to_string(), Value::String(format_timestamp(ts)));
    }
    Ok(item)
}

fn from_item<T: serde::de::DeserializeOwned>(item: Item) -> Option<T> {
    match serde_json::from_value(item) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("Skipping malformed stored item: {}", e);
            None
        }
    }
}

/// [`Storage`] over the partitioned key/value engine.
pub struct PartitionedStorage {
    store: KvStore,
}

impl PartitionedStorage {
    /// Volatile store, lost on drop.
    pub fn in_memory(partitions: usize) -> Self {
        Self {
            store: KvStore::in_memory(partitions, table_defs()),
        }
    }

    /// Durable store persisted to an append-only log.
    ///
    /// # Errors
    /// Returns an error if the log cannot be replayed or opened.
    pub fn open(log_path: &Path, partitions: usize) -> Result<Self> {
        Ok(Self {
            store: KvStore::open(log_path, partitions, table_defs())?,
        })
    }

    /// Events of one index partition in a range, ascending.
    fn index_events(
        &self,
        index: &str,
        partition: &str,
        range: &SortRange,
    ) -> Result<Vec<(String, Event)>> {
        Ok(self
            .store
            .query_index(EVENTS, index, partition, range, false, None)?
            .into_iter()
            .filter_map(|(sort, item)| from_item::<Event>(item).map(|e| (sort, e)))
            .collect())
    }
}

impl Storage for PartitionedStorage {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn insert_events(&self, events: &[Event]) -> Result<usize> {
        let mut inserted = 0;
        for event in events {
            let item = to_item(event, None, Some(("created_at", &event.created_at)))?;
            if self.store.put_if_absent(EVENTS, event_key(&event.id), item)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn count_events_by_type(
        &self,
        window_start: DateTime<Utc>,
        repo: Option<&str>,
    ) -> Result<BTreeMap<EventType, u64>> {
        let range = SortRange::from(format_timestamp(&window_start));
        let mut counts = BTreeMap::new();

        match repo {
            Some(repo) => {
                for (_, event) in self.index_events(REPO_TIME, repo, &range)? {
                    *counts.entry(event.event_type).or_insert(0) += 1;
                }
            }
            None => {
                for partition in self.store.index_partitions(EVENTS, TYPE_TIME)? {
                    let Ok(event_type) = partition.parse::<EventType>() else {
                        warn!("Ignoring index partition {}", partition);
                        continue;
                    };
                    let count = self.store.count_index(EVENTS, TYPE_TIME, &partition, &range)?;
                    if count > 0 {
                        counts.insert(event_type, count as u64);
                    }
                }
            }
        }

        Ok(counts)
    }

    fn count_events_by_repo(
        &self,
        window_start: DateTime<Utc>,
        window_end: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, u64>> {
        let start = format_timestamp(&window_start);
        let range = match window_end {
            Some(end) => SortRange::between(start, format_timestamp(&end)),
            None => SortRange::from(start),
        };

        let mut counts = BTreeMap::new();
        for repo in self.store.index_partitions(EVENTS, REPO_TIME)? {
            let count = self.store.count_index(EVENTS, REPO_TIME, &repo, &range)?;
            if count > 0 {
                counts.insert(repo, count as u64);
            }
        }
        Ok(counts)
    }

    fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let range = SortRange::from(format_timestamp(&query.since));

        let mut hits: Vec<(String, Event)> = match (&query.repo, query.types.is_empty()) {
            (Some(repo), _) => self.index_events(REPO_TIME, repo, &range)?,
            (None, false) => {
                let mut hits = Vec::new();
                for t in &query.types {
                    hits.extend(self.index_events(TYPE_TIME, t.as_str(), &range)?);
                }
                hits
            }
            (None, true) => {
                let mut hits = Vec::new();
                for partition in self.store.index_partitions(EVENTS, TYPE_TIME)? {
                    hits.extend(self.index_events(TYPE_TIME, &partition, &range)?);
                }
                hits
            }
        };

        // Sort keys are "{created_at}#{id}", so this is (created_at, id) order
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        hits.dedup_by(|a, b| a.0 == b.0);

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(hits
            .into_iter()
            .map(|(_, event)| event)
            .filter(|event| query.matches(event))
            .take(limit)
            .collect())
    }

    fn insert_commit(&self, commit: &Commit, files: &[CommitFile]) -> Result<bool> {
        let partition = commit_partition(&commit.repo_name, &commit.sha);

        let mut writes = vec![(
            COMMITS,
            Key::new(partition.clone(), META),
            to_item(commit, Some(KIND_COMMIT), Some(("commit_date", &commit.commit_date)))?,
        )];

        let mut seen = HashSet::new();
        for file in files {
            // First occurrence wins, matching INSERT OR IGNORE
            if !seen.insert(file.filename.as_str()) {
                continue;
            }
            let mut file = file.clone();
            file.commit_sha = commit.sha.clone();
            file.repo_name = commit.repo_name.clone();
            writes.push((
                COMMITS,
                Key::new(partition.clone(), format!("{FILE_PREFIX}{}", file.filename)),
                to_item(&file, Some(KIND_FILE), None)?,
            ));
        }

        self.store.transact_put_if_absent(writes)
    }

    fn commit_exists(&self, repo: &str, sha: &str) -> Result<bool> {
        let key = Key::new(commit_partition(repo, sha), META);
        Ok(self.store.get(COMMITS, &key)?.is_some())
    }

    fn get_recent_commits(
        &self,
        repo: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Commit>> {
        let range = SortRange::from(format_timestamp(&since));
        Ok(self
            .store
            .query_index(COMMITS, COMMIT_DATE, repo, &range, true, Some(limit))?
            .into_iter()
            .filter_map(|(_, item)| from_item::<Commit>(item))
            .collect())
    }

    fn get_commit_files(&self, repo: &str, sha: &str) -> Result<Vec<CommitFile>> {
        let partition = commit_partition(repo, sha);
        Ok(self
            .store
            .query(COMMITS, &partition, &SortRange::prefix(FILE_PREFIX), false, None)?
            .into_iter()
            .filter_map(|(_, item)| from_item::<CommitFile>(item))
            .collect())
    }

    fn upsert_commit_summary(&self, summary: &CommitSummary) -> Result<()> {
        let key = Key::new(commit_partition(&summary.repo_name, &summary.commit_sha), SUMMARY);
        self.store.put(COMMITS, key, to_item(summary, Some(KIND_SUMMARY), None)?)
    }

    fn get_commit_summary(&self, repo: &str, sha: &str) -> Result<Option<CommitSummary>> {
        let key = Key::new(commit_partition(repo, sha), SUMMARY);
        Ok(self.store.get(COMMITS, &key)?.and_then(from_item))
    }

    fn health_check(&self) -> HealthStatus {
        let read_counts = || -> Result<(u64, u64)> {
            self.store.check()?;
            let events = self.store.index_len(EVENTS, TYPE_TIME)?;
            let commits = self.store.index_len(COMMITS, COMMIT_DATE)?;
            Ok((events as u64, commits as u64))
        };

        match read_counts() {
            Ok((events, commits)) => HealthStatus::healthy(BACKEND, events, commits),
            Err(e) => HealthStatus::unhealthy(BACKEND, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event(id: &str, repo: &str, event_type: EventType, hour: u32) -> Event {
        Event {
            id: id.to_string(),
            event_type,
            repo_name: repo.to_string(),
            actor_login: "octocat".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap(),
            payload: json!({}),
        }
    }

    #[test]
    fn test_global_counts_use_type_index() {
        let storage = PartitionedStorage::in_memory(4);
        storage
            .insert_events(&[
                event("1", "o/a", EventType::PushEvent, 1),
                event("2", "o/b", EventType::PushEvent, 5),
                event("3", "o/b", EventType::WatchEvent, 6),
            ])
            .unwrap();

        let since = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let counts = storage.count_events_by_type(since, None).unwrap();
        assert_eq!(counts.get(&EventType::PushEvent), Some(&1));
        assert_eq!(counts.get(&EventType::WatchEvent), Some(&1));

        let end = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        let by_repo = storage.count_events_by_repo(since, Some(end)).unwrap();
        assert_eq!(by_repo.len(), 1);
        assert_eq!(by_repo.get("o/b"), Some(&1));
    }

    #[test]
    fn test_event_timestamps_are_normalized_to_millis() {
        let storage = PartitionedStorage::in_memory(2);
        let mut e = event("1", "o/a", EventType::PushEvent, 1);
        e.created_at += chrono::Duration::nanoseconds(1_234_567);
        storage.insert_events(&[e]).unwrap();

        let listed = storage
            .list_events(&EventQuery::since(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()))
            .unwrap();
        assert_eq!(listed[0].created_at.timestamp_subsec_millis(), 1);
        assert_eq!(listed[0].created_at.timestamp_subsec_nanos(), 1_000_000);
    }

    #[test]
    fn test_durable_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        {
            let storage = PartitionedStorage::open(&path, 4).unwrap();
            storage
                .insert_events(&[event("1", "o/a", EventType::PushEvent, 1)])
                .unwrap();
        }

        let storage = PartitionedStorage::open(&path, 4).unwrap();
        assert_eq!(storage.health_check().events, 1);
        assert_eq!(
            storage
                .insert_events(&[event("1", "o/a", EventType::PushEvent, 1)])
                .unwrap(),
            0
        );
    }
}
