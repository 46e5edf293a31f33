//! Record store abstraction
//!
//! Records are JSON documents grouped into named tables and keyed by id.
//! Besides plain CRUD the store offers the three atomic primitives the
//! hierarchy relies on: merge-update, increment-by-delta and set-if-null.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use codehive_core::{CodehiveError, Result};

/// Equality filter applied to top-level document fields
#[derive(Debug, Clone, Default)]
pub struct Filter {
    equals: Vec<(String, Value)>,
}

impl Filter {
    /// Matches every record
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, expected)| doc.get(field) == Some(expected))
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a whole document
    async fn put(&self, table: &str, id: &str, doc: Value) -> Result<()>;

    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>>;

    /// Returns whether a record was removed
    async fn delete(&self, table: &str, id: &str) -> Result<bool>;

    async fn scan(&self, table: &str, filter: &Filter) -> Result<Vec<Value>>;

    /// Merge the top-level fields of `patch` into the record
    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value>;

    /// Add `delta` to a numeric field, returning the new value
    async fn increment(&self, table: &str, id: &str, field: &str, delta: i64) -> Result<i64>;

    /// Set `field` only when it is absent or null; returns whether it was set
    async fn set_if_null(&self, table: &str, id: &str, field: &str, value: Value)
        -> Result<bool>;
}

/// Typed view over a table
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: &'static str;
    /// Name used in `NotFound` errors
    const KIND: &'static str;

    fn record_id(&self) -> &str;
}

/// Typed helpers available on every [`RecordStore`]
#[async_trait]
pub trait RecordStoreExt: RecordStore {
    async fn put_record<R: Record>(&self, record: &R) -> Result<()> {
        let doc = serde_json::to_value(record)?;
        self.put(R::TABLE, record.record_id(), doc).await
    }

    async fn find_record<R: Record>(&self, id: &str) -> Result<Option<R>> {
        match self.get(R::TABLE, id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    async fn get_record<R: Record>(&self, id: &str) -> Result<R> {
        self.find_record(id)
            .await?
            .ok_or_else(|| CodehiveError::not_found(R::KIND, id))
    }

    async fn scan_records<R: Record>(&self, filter: &Filter) -> Result<Vec<R>> {
        self.scan(R::TABLE, filter)
            .await?
            .into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(CodehiveError::from))
            .collect()
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}

/// Table contents shared by the memory and file stores
#[derive(Debug, Default)]
struct Tables {
    tables: HashMap<String, BTreeMap<String, Value>>,
}

impl Tables {
    fn put(&mut self, table: &str, id: &str, doc: Value) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), doc);
    }

    fn get(&self, table: &str, id: &str) -> Option<Value> {
        self.tables.get(table).and_then(|t| t.get(id)).cloned()
    }

    fn delete(&mut self, table: &str, id: &str) -> bool {
        self.tables
            .get_mut(table)
            .map(|t| t.remove(id).is_some())
            .unwrap_or(false)
    }

    fn scan(&self, table: &str, filter: &Filter) -> Vec<Value> {
        self.tables
            .get(table)
            .map(|t| t.values().filter(|doc| filter.matches(doc)).cloned().collect())
            .unwrap_or_default()
    }

    fn object_mut(&mut self, table: &str, id: &str) -> Result<&mut Map<String, Value>> {
        self.tables
            .get_mut(table)
            .and_then(|t| t.get_mut(id))
            .ok_or_else(|| CodehiveError::not_found("Record", format!("{}/{}", table, id)))?
            .as_object_mut()
            .ok_or_else(|| CodehiveError::Store(format!("{}/{} is not an object", table, id)))
    }

    fn update(&mut self, table: &str, id: &str, patch: Value) -> Result<Value> {
        let Value::Object(patch) = patch else {
            return Err(CodehiveError::Store("update patch must be an object".to_string()));
        };
        let object = self.object_mut(table, id)?;
        for (key, value) in patch {
            object.insert(key, value);
        }
        Ok(Value::Object(object.clone()))
    }

    fn increment(&mut self, table: &str, id: &str, field: &str, delta: i64) -> Result<i64> {
        let object = self.object_mut(table, id)?;
        let current = match object.get(field) {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                CodehiveError::Store(format!("{}/{}.{} is not an integer", table, id, field))
            })?,
        };
        let next = current + delta;
        object.insert(field.to_string(), Value::from(next));
        Ok(next)
    }

    fn set_if_null(&mut self, table: &str, id: &str, field: &str, value: Value) -> Result<bool> {
        let object = self.object_mut(table, id)?;
        match object.get(field) {
            None | Some(Value::Null) => {
                object.insert(field.to_string(), value);
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }
}

/// Volatile store used by tests and short-lived runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put(&self, table: &str, id: &str, doc: Value) -> Result<()> {
        self.inner.write().await.put(table, id, doc);
        Ok(())
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.inner.read().await.get(table, id))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        Ok(self.inner.write().await.delete(table, id))
    }

    async fn scan(&self, table: &str, filter: &Filter) -> Result<Vec<Value>> {
        Ok(self.inner.read().await.scan(table, filter))
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
        self.inner.write().await.update(table, id, patch)
    }

    async fn increment(&self, table: &str, id: &str, field: &str, delta: i64) -> Result<i64> {
        self.inner.write().await.increment(table, id, field, delta)
    }

    async fn set_if_null(
        &self,
        table: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<bool> {
        self.inner.write().await.set_if_null(table, id, field, value)
    }
}

/// Durable store keeping one pretty-printed JSON file per table
///
/// All tables are loaded at open; every mutation rewrites the affected
/// table file through a temp file and rename.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    inner: Mutex<Tables>,
}

impl FileStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut tables = Tables::default();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(table) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
                Ok(records) => {
                    debug!("Loaded {} records from table {}", records.len(), table);
                    tables.tables.insert(table.to_string(), records);
                }
                Err(e) => {
                    // Refuse to open: the next write would replace the file with an empty table
                    warn!("Unreadable table file {:?}: {}", path, e);
                    return Err(CodehiveError::Store(format!(
                        "Table file {} is unreadable: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }

        Ok(Self {
            dir,
            inner: Mutex::new(tables),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn persist(&self, tables: &Tables, table: &str) -> Result<()> {
        let empty = BTreeMap::new();
        let records = tables.tables.get(table).unwrap_or(&empty);
        let content = serde_json::to_string_pretty(records)?;

        let path = self.dir.join(format!("{}.json", table));
        let tmp = self.dir.join(format!("{}.json.tmp", table));
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn put(&self, table: &str, id: &str, doc: Value) -> Result<()> {
        let mut tables = self.inner.lock().await;
        tables.put(table, id, doc);
        self.persist(&tables, table).await
    }

    async fn get(&self, table: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.inner.lock().await.get(table, id))
    }

    async fn delete(&self, table: &str, id: &str) -> Result<bool> {
        let mut tables = self.inner.lock().await;
        let removed = tables.delete(table, id);
        if removed {
            self.persist(&tables, table).await?;
        }
        Ok(removed)
    }

    async fn scan(&self, table: &str, filter: &Filter) -> Result<Vec<Value>> {
        Ok(self.inner.lock().await.scan(table, filter))
    }

    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value> {
        let mut tables = self.inner.lock().await;
        let merged = tables.update(table, id, patch)?;
        self.persist(&tables, table).await?;
        Ok(merged)
    }

    async fn increment(&self, table: &str, id: &str, field: &str, delta: i64) -> Result<i64> {
        let mut tables = self.inner.lock().await;
        let next = tables.increment(table, id, field, delta)?;
        self.persist(&tables, table).await?;
        Ok(next)
    }

    async fn set_if_null(
        &self,
        table: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<bool> {
        let mut tables = self.inner.lock().await;
        let set = tables.set_if_null(table, id, field, value)?;
        if set {
            self.persist(&tables, table).await?;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_scan_with_filter() {
        let store = MemoryStore::new();
        store.put("tasks", "t1", json!({"id": "t1", "story_id": "s1"})).await.unwrap();
        store.put("tasks", "t2", json!({"id": "t2", "story_id": "s2"})).await.unwrap();

        let found = store.scan("tasks", &Filter::all().eq("story_id", "s1")).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], "t1");
        assert_eq!(store.scan("tasks", &Filter::all()).await.unwrap().len(), 2);
        assert!(store.scan("missing", &Filter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_top_level_fields() {
        let store = MemoryStore::new();
        store.put("epics", "e1", json!({"title": "a", "status": "PENDING"})).await.unwrap();

        let merged = store.update("epics", "e1", json!({"status": "COMPLETED"})).await.unwrap();
        assert_eq!(merged["title"], "a");
        assert_eq!(merged["status"], "COMPLETED");

        let err = store.update("epics", "nope", json!({})).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_increment_treats_missing_as_zero() {
        let store = MemoryStore::new();
        store.put("tasks", "t1", json!({"token_usage": null})).await.unwrap();

        assert_eq!(store.increment("tasks", "t1", "token_usage", 5).await.unwrap(), 5);
        assert_eq!(store.increment("tasks", "t1", "token_usage", 7).await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_set_if_null_never_overwrites() {
        let store = MemoryStore::new();
        store.put("tasks", "t1", json!({"started_at": null})).await.unwrap();

        assert!(store.set_if_null("tasks", "t1", "started_at", json!("first")).await.unwrap());
        assert!(!store.set_if_null("tasks", "t1", "started_at", json!("second")).await.unwrap());

        let doc = store.get("tasks", "t1").await.unwrap().unwrap();
        assert_eq!(doc["started_at"], "first");
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            store.put("epics", "e1", json!({"id": "e1", "token_usage": 1})).await.unwrap();
            store.increment("epics", "e1", "token_usage", 2).await.unwrap();
            store.put("epics", "e2", json!({"id": "e2"})).await.unwrap();
            assert!(store.delete("epics", "e2").await.unwrap());
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        let doc = store.get("epics", "e1").await.unwrap().unwrap();
        assert_eq!(doc["token_usage"], 3);
        assert!(store.get("epics", "e2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("epics.json");
        let truncated = r#"{"e1":{"id":"e1"}, "e2":{"id""#;
        std::fs::write(&path, truncated).unwrap();

        let err = FileStore::open(dir.path()).await.unwrap_err();
        assert!(matches!(err, CodehiveError::Store(ref msg) if msg.contains("epics.json")));

        // Existing records stay on disk for manual recovery
        assert_eq!(std::fs::read_to_string(&path).unwrap(), truncated);
    }
}
