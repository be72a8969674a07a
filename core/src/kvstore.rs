//! Partitioned key/value engine
//!
//! Items are JSON documents addressed by a `(partition, sort)` key pair. The
//! partition key is hashed onto a fixed number of shards; within a partition
//! items are kept ordered by sort key so range scans are cheap.
//!
//! Secondary indexes project an item to another `(partition, sort)` pair and
//! are maintained by the engine on every write. Index sort keys must be
//! unique within their partition, so callers append the item identity to
//! them (e.g. `"{timestamp}#{id}"`).
//!
//! Conditional writes (`put_if_absent`, `transact_put_if_absent`) are atomic:
//! the condition is checked and the write applied while the owning shards
//! are held. Index entries are written after the primary item, so a reader
//! that finds an index entry always finds the item it points to.
//!
//! When opened with a log path every accepted write is appended to a
//! JSON-lines file before it is applied, and the file is replayed on open.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use twox_hash::XxHash64;

use crate::error::{Error, Result};

/// Stored document.
pub type Item = serde_json::Value;

/// Default number of shards per table.
pub const DEFAULT_PARTITIONS: usize = 16;

/// Address of an item: partition key plus sort key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    pub partition: String,
    pub sort: String,
}

impl Key {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

/// Secondary index definition: projects an item onto an index key.
///
/// Items for which the projection returns `None` are not indexed.
#[derive(Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub project: fn(&Item) -> Option<Key>,
}

/// Table definition.
#[derive(Clone)]
pub struct TableDef {
    pub name: &'static str,
    pub indexes: Vec<IndexDef>,
}

/// Sort-key range for queries.
#[derive(Debug, Clone)]
pub struct SortRange {
    pub start: Bound<String>,
    pub end: Bound<String>,
}

impl SortRange {
    /// Every sort key in the partition.
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Sort keys `>= start`.
    pub fn from(start: impl Into<String>) -> Self {
        Self {
            start: Bound::Included(start.into()),
            end: Bound::Unbounded,
        }
    }

    /// Sort keys in `[start, end)`.
    pub fn between(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Bound::Included(start.into()),
            end: Bound::Excluded(end.into()),
        }
    }

    /// Sort keys starting with `prefix`.
    pub fn prefix(prefix: &str) -> Self {
        // Every key with the prefix sorts below prefix + U+10FFFF
        Self {
            start: Bound::Included(prefix.to_string()),
            end: Bound::Excluded(format!("{prefix}\u{10FFFF}")),
        }
    }

    fn bounds(&self) -> (Bound<&str>, Bound<&str>) {
        (as_str_bound(&self.start), as_str_bound(&self.end))
    }

    fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e)) => s >= e,
            (Bound::Included(s), Bound::Included(e)) => s > e,
            _ => false,
        }
    }
}

fn as_str_bound(bound: &Bound<String>) -> Bound<&str> {
    match bound {
        Bound::Included(s) => Bound::Included(s.as_str()),
        Bound::Excluded(s) => Bound::Excluded(s.as_str()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Items of one shard: partition key -> ordered sort keys.
type Shard = HashMap<String, BTreeMap<String, Item>>;

/// Index contents: index partition -> index sort key -> primary key.
type IndexMap = HashMap<String, BTreeMap<String, Key>>;

struct Table {
    def: TableDef,
    shards: Vec<RwLock<Shard>>,
    indexes: Vec<RwLock<IndexMap>>,
}

impl Table {
    fn new(def: TableDef, partitions: usize) -> Self {
        let shards = (0..partitions).map(|_| RwLock::new(Shard::new())).collect();
        let indexes = def.indexes.iter().map(|_| RwLock::new(IndexMap::new())).collect();
        Self {
            def,
            shards,
            indexes,
        }
    }

    fn shard_of(&self, partition: &str) -> usize {
        let mut hasher = XxHash64::with_seed(0);
        partition.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn index_position(&self, index: &str) -> Result<usize> {
        self.def
            .indexes
            .iter()
            .position(|i| i.name == index)
            .ok_or_else(|| Error::Other(format!("unknown index {}.{}", self.def.name, index)))
    }

    /// Replace index entries for `key` after its item changed from `old` to `new`.
    fn reindex(&self, key: &Key, old: Option<&Item>, new: &Item) -> Result<()> {
        for (def, index) in self.def.indexes.iter().zip(&self.indexes) {
            let old_key = old.and_then(|o| (def.project)(o));
            let new_key = (def.project)(new);
            if old_key == new_key {
                continue;
            }

            let mut index = index.write().map_err(|_| poisoned(self.def.name))?;
            if let Some(old_key) = old_key {
                if let Some(sorted) = index.get_mut(&old_key.partition) {
                    sorted.remove(&old_key.sort);
                    if sorted.is_empty() {
                        index.remove(&old_key.partition);
                    }
                }
            }
            if let Some(new_key) = new_key {
                index
                    .entry(new_key.partition)
                    .or_default()
                    .insert(new_key.sort, key.clone());
            }
        }
        Ok(())
    }
}

/// One line of the write-ahead log.
#[derive(Serialize, Deserialize)]
struct LogRecord {
    table: String,
    key: Key,
    item: Item,
}

/// Partitioned key/value store with secondary indexes.
pub struct KvStore {
    tables: HashMap<&'static str, Table>,
    log: Option<Mutex<File>>,
    log_path: Option<PathBuf>,
}

impl KvStore {
    /// Open an in-memory store.
    pub fn in_memory(partitions: usize, tables: Vec<TableDef>) -> Self {
        Self::build(partitions, tables, None, None)
    }

    /// Open a store backed by an append-only log, replaying existing records.
    ///
    /// # Errors
    /// Returns an error if the log cannot be read or opened for append.
    pub fn open(path: &Path, partitions: usize, tables: Vec<TableDef>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut store = Self::build(partitions, tables, None, Some(path.to_path_buf()));
        if path.exists() {
            let replayed = store.replay(path)?;
            info!("Replayed {} records from {:?}", replayed, path);
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        store.log = Some(Mutex::new(file));
        Ok(store)
    }

    fn build(
        partitions: usize,
        tables: Vec<TableDef>,
        log: Option<Mutex<File>>,
        log_path: Option<PathBuf>,
    ) -> Self {
        let partitions = partitions.max(1);
        let tables = tables
            .into_iter()
            .map(|def| (def.name, Table::new(def, partitions)))
            .collect();
        Self {
            tables,
            log,
            log_path,
        }
    }

    fn replay(&mut self, path: &Path) -> Result<usize> {
        let reader = BufReader::new(File::open(path)?);
        let mut count = 0;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // A torn final line from a crash is skipped, not fatal
            let record: LogRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!("Skipping unreadable log line {}: {}", line_no + 1, e);
                    continue;
                }
            };
            let table = self.table(&record.table)?;
            let idx = table.shard_of(&record.key.partition);
            let mut shard = table.shards[idx].write().map_err(|_| poisoned(table.def.name))?;
            let old = shard
                .entry(record.key.partition.clone())
                .or_default()
                .insert(record.key.sort.clone(), record.item.clone());
            table.reindex(&record.key, old.as_ref(), &record.item)?;
            count += 1;
        }

        Ok(count)
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::Other(format!("unknown table {name}")))
    }

    fn append_log(&self, records: &[(&str, &Key, &Item)]) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };

        let mut buf = String::new();
        for (table, key, item) in records {
            let record = LogRecord {
                table: (*table).to_string(),
                key: (*key).clone(),
                item: (*item).clone(),
            };
            buf.push_str(&serde_json::to_string(&record)?);
            buf.push('\n');
        }

        let mut file = log
            .lock()
            .map_err(|_| Error::StorageUnavailable("write-ahead log lock poisoned".into()))?;
        file.write_all(buf.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Fetch a single item.
    pub fn get(&self, table: &str, key: &Key) -> Result<Option<Item>> {
        let table = self.table(table)?;
        let shard = table.shards[table.shard_of(&key.partition)]
            .read()
            .map_err(|_| poisoned(table.def.name))?;
        Ok(shard
            .get(&key.partition)
            .and_then(|sorted| sorted.get(&key.sort))
            .cloned())
    }

    /// Unconditionally write an item, replacing any previous value.
    pub fn put(&self, table_name: &str, key: Key, item: Item) -> Result<()> {
        let table = self.table(table_name)?;
        let mut shard = table.shards[table.shard_of(&key.partition)]
            .write()
            .map_err(|_| poisoned(table.def.name))?;

        self.append_log(&[(table_name, &key, &item)])?;
        let old = shard
            .entry(key.partition.clone())
            .or_default()
            .insert(key.sort.clone(), item.clone());
        table.reindex(&key, old.as_ref(), &item)
    }

    /// Write an item only if nothing is stored under `key`.
    ///
    /// Returns `false` without writing when the key already exists.
    pub fn put_if_absent(&self, table: &str, key: Key, item: Item) -> Result<bool> {
        self.transact_put_if_absent(vec![(table, key, item)])
    }

    /// Write all items, or none of them if any key already exists.
    ///
    /// Every shard touched by the batch is held for the duration of the check
    /// and the write. Shards are locked in a global order so concurrent
    /// transactions cannot deadlock.
    pub fn transact_put_if_absent(&self, writes: Vec<(&str, Key, Item)>) -> Result<bool> {
        // Resolve (table, shard) slots and lock each once, in order
        let mut slots: Vec<(&str, usize)> = Vec::with_capacity(writes.len());
        for (table_name, key, _) in &writes {
            let table = self.table(table_name)?;
            slots.push((table.def.name, table.shard_of(&key.partition)));
        }
        let mut order = slots.clone();
        order.sort_unstable();
        order.dedup();

        let mut guards: BTreeMap<(&str, usize), RwLockWriteGuard<'_, Shard>> = BTreeMap::new();
        for (table_name, idx) in &order {
            let table = self.table(table_name)?;
            let guard = table.shards[*idx]
                .write()
                .map_err(|_| poisoned(table.def.name))?;
            guards.insert((*table_name, *idx), guard);
        }

        // Condition check
        for ((_, key, _), slot) in writes.iter().zip(&slots) {
            let exists = guards
                .get(slot)
                .and_then(|shard| shard.get(&key.partition))
                .is_some_and(|sorted| sorted.contains_key(&key.sort));
            if exists {
                debug!("Conditional write rejected: {:?} exists", key);
                return Ok(false);
            }
        }

        let records: Vec<(&str, &Key, &Item)> =
            writes.iter().map(|(t, k, i)| (*t, k, i)).collect();
        self.append_log(&records)?;

        for ((_, key, item), slot) in writes.iter().zip(&slots) {
            if let Some(shard) = guards.get_mut(slot) {
                shard
                    .entry(key.partition.clone())
                    .or_default()
                    .insert(key.sort.clone(), item.clone());
            }
        }
        for ((table_name, key, item), _) in writes.iter().zip(&slots) {
            self.table(table_name)?.reindex(key, None, item)?;
        }

        Ok(true)
    }

    /// Query items of one partition by sort-key range.
    pub fn query(
        &self,
        table: &str,
        partition: &str,
        range: &SortRange,
        descending: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(Key, Item)>> {
        let table = self.table(table)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let shard = table.shards[table.shard_of(partition)]
            .read()
            .map_err(|_| poisoned(table.def.name))?;
        let Some(sorted) = shard.get(partition) else {
            return Ok(Vec::new());
        };

        let iter = sorted.range::<str, _>(range.bounds());
        let limit = limit.unwrap_or(usize::MAX);
        let to_pair =
            |(sort, item): (&String, &Item)| (Key::new(partition, sort.clone()), item.clone());
        let items = if descending {
            iter.rev().take(limit).map(to_pair).collect()
        } else {
            iter.take(limit).map(to_pair).collect()
        };
        Ok(items)
    }

    /// Query a secondary index by partition and sort-key range.
    ///
    /// Returns `(index sort key, item)` pairs in index order.
    pub fn query_index(
        &self,
        table_name: &str,
        index: &str,
        partition: &str,
        range: &SortRange,
        descending: bool,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Item)>> {
        let table = self.table(table_name)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let pos = table.index_position(index)?;

        // Copy the matching primary keys out, then release the index
        let hits: Vec<(String, Key)> = {
            let index = table.indexes[pos].read().map_err(|_| poisoned(table.def.name))?;
            let Some(sorted) = index.get(partition) else {
                return Ok(Vec::new());
            };
            let iter = sorted.range::<str, _>(range.bounds());
            let limit = limit.unwrap_or(usize::MAX);
            let to_pair = |(sort, key): (&String, &Key)| (sort.clone(), key.clone());
            if descending {
                iter.rev().take(limit).map(to_pair).collect()
            } else {
                iter.take(limit).map(to_pair).collect()
            }
        };

        let mut items = Vec::with_capacity(hits.len());
        for (sort, key) in hits {
            if let Some(item) = self.get(table_name, &key)? {
                items.push((sort, item));
            }
        }
        Ok(items)
    }

    /// Count index entries in a sort-key range without loading items.
    pub fn count_index(
        &self,
        table: &str,
        index: &str,
        partition: &str,
        range: &SortRange,
    ) -> Result<usize> {
        let table = self.table(table)?;
        if range.is_empty() {
            return Ok(0);
        }
        let pos = table.index_position(index)?;
        let index = table.indexes[pos].read().map_err(|_| poisoned(table.def.name))?;
        Ok(index
            .get(partition)
            .map(|sorted| sorted.range::<str, _>(range.bounds()).count())
            .unwrap_or(0))
    }

    /// All partition keys currently present in an index, sorted.
    pub fn index_partitions(&self, table: &str, index: &str) -> Result<Vec<String>> {
        let table = self.table(table)?;
        let pos = table.index_position(index)?;
        let index = table.indexes[pos].read().map_err(|_| poisoned(table.def.name))?;
        let mut partitions: Vec<String> = index.keys().cloned().collect();
        partitions.sort();
        Ok(partitions)
    }

    /// Total entries in an index.
    pub fn index_len(&self, table: &str, index: &str) -> Result<usize> {
        let table = self.table(table)?;
        let pos = table.index_position(index)?;
        let index = table.indexes[pos].read().map_err(|_| poisoned(table.def.name))?;
        Ok(index.values().map(BTreeMap::len).sum())
    }

    /// Verify every lock is healthy and the log (if any) is still writable.
    pub fn check(&self) -> Result<()> {
        for table in self.tables.values() {
            for shard in &table.shards {
                if shard.is_poisoned() {
                    return Err(poisoned(table.def.name));
                }
            }
            for index in &table.indexes {
                if index.is_poisoned() {
                    return Err(poisoned(table.def.name));
                }
            }
        }

        if let Some(path) = &self.log_path {
            let meta = std::fs::metadata(path).map_err(|e| {
                Error::StorageUnavailable(format!("log {} unreadable: {e}", path.display()))
            })?;
            if meta.permissions().readonly() {
                return Err(Error::StorageUnavailable(format!(
                    "log {} is read-only",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

fn poisoned(table: &str) -> Error {
    Error::StorageUnavailable(format!("table {table} lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn by_owner(item: &Item) -> Option<Key> {
        Some(Key::new(
            item.get("owner")?.as_str()?,
            format!("{}#{}", item.get("at")?.as_str()?, item.get("id")?.as_str()?),
        ))
    }

    fn tables() -> Vec<TableDef> {
        vec![TableDef {
            name: "things",
            indexes: vec![IndexDef {
                name: "owner_time",
                project: by_owner,
            }],
        }]
    }

    fn thing(id: &str, owner: &str, at: &str) -> (Key, Item) {
        (
            Key::new(format!("THING#{id}"), "META"),
            json!({"id": id, "owner": owner, "at": at}),
        )
    }

    #[test]
    fn test_put_if_absent_is_conditional() {
        let store = KvStore::in_memory(4, tables());
        let (key, item) = thing("1", "a", "2024-01-01");

        assert!(store.put_if_absent("things", key.clone(), item.clone()).unwrap());
        assert!(!store.put_if_absent("things", key.clone(), json!({"id": "other"})).unwrap());
        assert_eq!(store.get("things", &key).unwrap(), Some(item));
    }

    #[test]
    fn test_transaction_is_all_or_nothing() {
        let store = KvStore::in_memory(4, tables());
        let (k1, i1) = thing("1", "a", "2024-01-01");
        let (k2, i2) = thing("2", "a", "2024-01-02");
        store.put("things", k2.clone(), i2.clone()).unwrap();

        let ok = store
            .transact_put_if_absent(vec![("things", k1.clone(), i1), ("things", k2, i2)])
            .unwrap();
        assert!(!ok);
        assert_eq!(store.get("things", &k1).unwrap(), None);
    }

    #[test]
    fn test_index_range_and_order() {
        let store = KvStore::in_memory(4, tables());
        for (id, at) in [("1", "2024-01-01"), ("2", "2024-01-03"), ("3", "2024-01-02")] {
            let (k, i) = thing(id, "a", at);
            store.put("things", k, i).unwrap();
        }
        let (k, i) = thing("4", "b", "2024-01-05");
        store.put("things", k, i).unwrap();

        let asc = store
            .query_index("things", "owner_time", "a", &SortRange::from("2024-01-02"), false, None)
            .unwrap();
        let ids: Vec<&str> = asc.iter().map(|(_, i)| i["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["3", "2"]);

        let desc = store
            .query_index("things", "owner_time", "a", &SortRange::all(), true, Some(1))
            .unwrap();
        assert_eq!(desc[0].1["id"], "2");

        assert_eq!(
            store.count_index("things", "owner_time", "a", &SortRange::all()).unwrap(),
            3
        );
        assert_eq!(store.index_partitions("things", "owner_time").unwrap(), vec!["a", "b"]);
        assert_eq!(store.index_len("things", "owner_time").unwrap(), 4);
    }

    #[test]
    fn test_overwrite_moves_index_entry() {
        let store = KvStore::in_memory(2, tables());
        let (k, i) = thing("1", "a", "2024-01-01");
        store.put("things", k.clone(), i).unwrap();
        let (_, moved) = thing("1", "b", "2024-01-01");
        store.put("things", k, moved).unwrap();

        assert_eq!(store.count_index("things", "owner_time", "a", &SortRange::all()).unwrap(), 0);
        assert_eq!(store.count_index("things", "owner_time", "b", &SortRange::all()).unwrap(), 1);
    }

    #[test]
    fn test_prefix_query() {
        let store = KvStore::in_memory(2, vec![TableDef { name: "t", indexes: vec![] }]);
        store.put("t", Key::new("p", "FILE#b"), json!(2)).unwrap();
        store.put("t", Key::new("p", "FILE#a"), json!(1)).unwrap();
        store.put("t", Key::new("p", "META"), json!(0)).unwrap();

        let files = store.query("t", "p", &SortRange::prefix("FILE#"), false, None).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0.sort, "FILE#a");
    }

    #[test]
    fn test_log_replay_restores_items_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.log");

        {
            let store = KvStore::open(&path, 4, tables()).unwrap();
            let (k, i) = thing("1", "a", "2024-01-01");
            store.put_if_absent("things", k, i).unwrap();
            store.check().unwrap();
        }

        let reopened = KvStore::open(&path, 4, tables()).unwrap();
        let (k, _) = thing("1", "a", "2024-01-01");
        assert!(reopened.get("things", &k).unwrap().is_some());
        assert_eq!(
            reopened.count_index("things", "owner_time", "a", &SortRange::all()).unwrap(),
            1
        );
    }
}
