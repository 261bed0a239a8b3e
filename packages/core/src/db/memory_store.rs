//! In-memory Entity Store
//!
//! A [`EntityStore`] that keeps everything in process memory. Used by tests,
//! benchmarks and anything that wants the repository without a database file.
//!
//! Besides plain storage it can simulate a slow or failing backend:
//! per-operation latency, failing writes and failing reads. Writes are staged
//! on a copy and swapped in only when the whole operation succeeds, matching
//! the transactional behavior of [`LibsqlStore`](super::LibsqlStore).

use super::entity_store::{note_version, parse_millis, record_key, FolderColumns, NoteColumns};
use super::{Collection, EntityStore, IndexKey, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Default)]
struct Tables {
    notes: Vec<(String, Value)>,
    folders: Vec<(String, Value)>,
    settings: Vec<(String, Value)>,
}

impl Tables {
    fn table(&self, collection: Collection) -> &Vec<(String, Value)> {
        match collection {
            Collection::Notes => &self.notes,
            Collection::Folders => &self.folders,
            Collection::Settings => &self.settings,
        }
    }

    fn table_mut(&mut self, collection: Collection) -> &mut Vec<(String, Value)> {
        match collection {
            Collection::Notes => &mut self.notes,
            Collection::Folders => &mut self.folders,
            Collection::Settings => &mut self.settings,
        }
    }

    fn upsert(&mut self, collection: Collection, record: &Value) -> Result<(), StoreError> {
        let key = record_key(collection, record)?;
        let table = self.table_mut(collection);
        match table.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = record.clone(),
            None => table.push((key, record.clone())),
        }
        Ok(())
    }
}

/// Process-local store with failure injection
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    latency_ms: Arc<AtomicU64>,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing records, bypassing failure injection
    pub fn with_records(notes: Vec<Value>, folders: Vec<Value>) -> Result<Self, StoreError> {
        let store = Self::new();
        {
            let mut tables = store.lock()?;
            for folder in &folders {
                tables.upsert(Collection::Folders, folder)?;
            }
            for note in &notes {
                tables.upsert(Collection::Notes, note)?;
            }
        }
        Ok(store)
    }

    /// Delay applied before every operation
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every write fail with a transaction error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every read fail with a transaction error
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of write transactions committed so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Undo [`EntityStore::close`]
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::transaction("Failed to acquire lock"))
    }

    async fn simulate_latency(&self) {
        let millis = self.latency_ms.load(Ordering::SeqCst);
        if millis > 0 {
            sleep(Duration::from_millis(millis)).await;
        }
    }

    async fn begin_read(&self, operation: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::transaction(format!("{} failed (injected)", operation)));
        }
        Ok(())
    }

    async fn begin_write(&self, operation: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::transaction(format!("{} failed (injected)", operation)));
        }
        Ok(())
    }

    /// Apply `write` to a staged copy, then swap it in
    fn commit(
        &self,
        write: impl FnOnce(&mut Tables) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let mut staged = tables.clone();
        write(&mut staged)?;
        *tables = staged;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn select(
        &self,
        collection: Collection,
        predicate: impl Fn(&Value) -> bool,
    ) -> Result<Vec<Value>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .table(collection)
            .iter()
            .filter(|(_, record)| predicate(record))
            .map(|(_, record)| record.clone())
            .collect())
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn put(&self, collection: Collection, record: Value) -> Result<(), StoreError> {
        self.begin_write("put").await?;
        self.commit(|tables| tables.upsert(collection, &record))
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError> {
        self.begin_read("get").await?;
        let tables = self.lock()?;
        Ok(tables
            .table(collection)
            .iter()
            .find(|(k, _)| k == id)
            .map(|(_, record)| record.clone()))
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>, StoreError> {
        self.begin_read("get_all").await?;
        self.select(collection, |_| true)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        self.begin_write("delete").await?;
        let mut removed = false;
        self.commit(|tables| {
            let table = tables.table_mut(collection);
            let before = table.len();
            table.retain(|(k, _)| k != id);
            removed = table.len() != before;
            Ok(())
        })?;
        Ok(removed)
    }

    async fn save_many(&self, notes: &[Value], folders: &[Value]) -> Result<(), StoreError> {
        if notes.is_empty() && folders.is_empty() {
            return Ok(());
        }
        self.begin_write("save_many").await?;
        self.commit(|tables| {
            for folder in folders {
                tables.upsert(Collection::Folders, folder)?;
            }
            for note in notes {
                tables.upsert(Collection::Notes, note)?;
            }
            Ok(())
        })
    }

    async fn mark_synced(&self, id: &str, version: u64) -> Result<bool, StoreError> {
        self.begin_write("mark_synced").await?;
        let mut marked = false;
        self.commit(|tables| {
            let slot = tables
                .notes
                .iter_mut()
                .find(|(k, record)| k == id && note_version(record) == version);
            if let Some(fields) = slot.and_then(|(_, record)| record.as_object_mut()) {
                fields.insert("synced".to_string(), Value::Bool(true));
                marked = true;
            }
            Ok(())
        })?;
        Ok(marked)
    }

    async fn find_by(&self, index: IndexKey, value: &str) -> Result<Vec<Value>, StoreError> {
        self.begin_read("find_by").await?;

        match index {
            IndexKey::NoteTitle => {
                self.select(Collection::Notes, |r| NoteColumns::extract(r).title == value)
            }
            IndexKey::NoteFolder => self.select(Collection::Notes, |r| {
                NoteColumns::extract(r).folder_id.as_deref() == Some(value)
            }),
            IndexKey::NoteTag => self.select(Collection::Notes, |r| {
                NoteColumns::extract(r).tags.iter().any(|t| t == value)
            }),
            IndexKey::NoteCreatedAt | IndexKey::NoteModifiedAt => {
                let Some(millis) = parse_millis(value) else {
                    return Ok(Vec::new());
                };
                self.select(Collection::Notes, |r| {
                    let columns = NoteColumns::extract(r);
                    let stamp = if index == IndexKey::NoteCreatedAt {
                        columns.created_ms
                    } else {
                        columns.modified_ms
                    };
                    stamp == Some(millis)
                })
            }
            IndexKey::FolderName => {
                self.select(Collection::Folders, |r| FolderColumns::extract(r).name == value)
            }
            IndexKey::FolderParent => self.select(Collection::Folders, |r| {
                FolderColumns::extract(r).parent_id.as_deref() == Some(value)
            }),
        }
    }

    async fn find_in_range(
        &self,
        index: IndexKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Value>, StoreError> {
        if !index.is_temporal() {
            return Err(StoreError::UnsupportedIndex {
                index: index.name(),
            });
        }
        self.begin_read("find_in_range").await?;

        let (from, to) = (from.timestamp_millis(), to.timestamp_millis());
        self.select(Collection::Notes, |r| {
            let columns = NoteColumns::extract(r);
            let stamp = if index == IndexKey::NoteCreatedAt {
                columns.created_ms
            } else {
                columns.modified_ms
            };
            stamp.is_some_and(|ms| ms >= from && ms <= to)
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.begin_read("ping").await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
