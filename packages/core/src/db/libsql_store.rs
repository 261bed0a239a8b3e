//! libsql-backed Entity Store
//!
//! Embedded SQLite-compatible storage for notes, folders and settings.
//!
//! # Layout
//!
//! Each collection is a table holding the full JSON document in a `body`
//! column next to the extracted columns its secondary indexes need. Tags are
//! multi-valued and live in a `note_tags` side table. Timestamps are indexed
//! as epoch milliseconds so range queries don't depend on how many fractional
//! digits a serialized timestamp happens to carry.
//!
//! Schema creation is idempotent (`CREATE ... IF NOT EXISTS`), and the schema
//! version is recorded in `PRAGMA user_version`.
//!
//! # Concurrency
//!
//! The store owns a single connection behind an async mutex. Every public
//! operation holds the lock for its whole transaction, so transactions never
//! interleave on the connection.

use super::entity_store::{parse_millis, record_key, FolderColumns, NoteColumns};
use super::{Collection, EntityStore, IndexKey, StoreError};
use crate::config::StoreConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database, Rows};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Current on-disk schema version
pub const SCHEMA_VERSION: i64 = 1;

struct Handle {
    // Keeps the database alive for as long as the connection is open
    _db: Database,
    conn: Connection,
}

/// Persistent store on a local libsql database file
pub struct LibsqlStore {
    inner: Mutex<Option<Handle>>,
    db_path: PathBuf,
}

impl std::fmt::Debug for LibsqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibsqlStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl LibsqlStore {
    /// Open (or create) the database at `path` in a single attempt.
    ///
    /// Creates missing parent directories, then initializes the schema.
    /// `":memory:"` opens a private in-memory database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let handle = Self::connect(&db_path).await?;
        tracing::info!("Opened store at {}", db_path.display());

        Ok(Self {
            inner: Mutex::new(Some(handle)),
            db_path,
        })
    }

    /// Open with retries.
    ///
    /// Makes one attempt plus `config.open_retries` retries. Retry `n` waits
    /// `n * retry_backoff` first, and every attempt is bounded by
    /// `open_timeout`. Fails with [`StoreError::Connection`] carrying the
    /// last failure once attempts are exhausted.
    pub async fn open_with_retry(config: &StoreConfig) -> Result<Self, StoreError> {
        let attempts = config.open_retries.saturating_add(1);
        let mut last_error: Option<StoreError> = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = config.retry_backoff() * attempt;
                tracing::warn!(
                    "Store open attempt {}/{} failed, retrying in {:?}",
                    attempt,
                    attempts,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }

            match tokio::time::timeout(config.open_timeout(), Self::open(&config.database_path))
                .await
            {
                Ok(Ok(store)) => return Ok(store),
                Ok(Err(e)) => {
                    tracing::debug!("Store open failed: {}", e);
                    last_error = Some(e);
                }
                Err(_) => {
                    last_error = Some(StoreError::timeout("store open", config.open_timeout()));
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempts made".to_string());
        tracing::error!(
            "Giving up opening store at {} after {} attempts: {}",
            config.database_path.display(),
            attempts,
            reason
        );
        Err(StoreError::connection(&config.database_path, reason))
    }

    /// Re-establish the connection after [`EntityStore::close`] or a failure
    pub async fn reopen(&self) -> Result<(), StoreError> {
        let handle = Self::connect(&self.db_path).await?;
        let mut guard = self.inner.lock().await;
        *guard = Some(handle);
        tracing::info!("Reopened store at {}", self.db_path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn connect(db_path: &Path) -> Result<Handle, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::connection(
                        db_path,
                        format!("Failed to create parent directory: {}", e),
                    )
                })?;
            }
        }

        let db = Builder::new_local(db_path)
            .build()
            .await
            .map_err(|e| StoreError::connection(db_path, e.to_string()))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::connection(db_path, e.to_string()))?;

        Self::initialize_schema(&conn).await?;
        Ok(Handle { _db: db, conn })
    }

    /// PRAGMA statements return rows, so they go through `query` rather
    /// than `execute`.
    async fn execute_pragma(conn: &Connection, pragma: &str) -> Result<(), StoreError> {
        let mut stmt = conn.prepare(pragma).await.map_err(|e| {
            StoreError::transaction(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        let _ = stmt.query(()).await.map_err(|e| {
            StoreError::transaction(format!("Failed to execute '{}': {}", pragma, e))
        })?;
        Ok(())
    }

    async fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
        let mut rows = conn
            .query("PRAGMA user_version", ())
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to read schema version: {}", e)))?;
        let row = rows
            .next()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to read schema version: {}", e)))?;
        match row {
            Some(row) => row.get::<i64>(0).map_err(|e| {
                StoreError::transaction(format!("Failed to read schema version: {}", e))
            }),
            None => Ok(0),
        }
    }

    async fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        Self::execute_pragma(conn, "PRAGMA journal_mode = WAL").await?;
        Self::execute_pragma(conn, "PRAGMA busy_timeout = 5000").await?;

        let statements = [
            (
                "notes table",
                "CREATE TABLE IF NOT EXISTS notes (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL DEFAULT '',
                    created_ms INTEGER,
                    modified_ms INTEGER,
                    folder_id TEXT,
                    synced INTEGER NOT NULL DEFAULT 0,
                    body TEXT NOT NULL
                )",
            ),
            (
                "note_tags table",
                "CREATE TABLE IF NOT EXISTS note_tags (
                    note_id TEXT NOT NULL,
                    tag TEXT NOT NULL,
                    PRIMARY KEY (note_id, tag)
                )",
            ),
            (
                "folders table",
                "CREATE TABLE IF NOT EXISTS folders (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL DEFAULT '',
                    parent_id TEXT,
                    body TEXT NOT NULL
                )",
            ),
            (
                "settings table",
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    body TEXT NOT NULL
                )",
            ),
            ("idx_notes_title", "CREATE INDEX IF NOT EXISTS idx_notes_title ON notes(title)"),
            (
                "idx_notes_created",
                "CREATE INDEX IF NOT EXISTS idx_notes_created ON notes(created_ms)",
            ),
            (
                "idx_notes_modified",
                "CREATE INDEX IF NOT EXISTS idx_notes_modified ON notes(modified_ms)",
            ),
            (
                "idx_notes_folder",
                "CREATE INDEX IF NOT EXISTS idx_notes_folder ON notes(folder_id)",
            ),
            (
                "idx_notes_synced",
                "CREATE INDEX IF NOT EXISTS idx_notes_synced ON notes(synced)",
            ),
            (
                "idx_note_tags_tag",
                "CREATE INDEX IF NOT EXISTS idx_note_tags_tag ON note_tags(tag)",
            ),
            (
                "idx_folders_name",
                "CREATE INDEX IF NOT EXISTS idx_folders_name ON folders(name)",
            ),
            (
                "idx_folders_parent",
                "CREATE INDEX IF NOT EXISTS idx_folders_parent ON folders(parent_id)",
            ),
        ];

        for (name, sql) in statements {
            conn.execute(sql, ()).await.map_err(|e| {
                StoreError::transaction(format!("Failed to create {}: {}", name, e))
            })?;
        }

        let version = Self::schema_version(conn).await?;
        if version < SCHEMA_VERSION {
            Self::execute_pragma(conn, &format!("PRAGMA user_version = {}", SCHEMA_VERSION))
                .await?;
        } else if version > SCHEMA_VERSION {
            tracing::warn!(
                "Store schema version {} is newer than supported version {}",
                version,
                SCHEMA_VERSION
            );
        }

        Ok(())
    }

    fn conn(slot: &Option<Handle>) -> Result<&Connection, StoreError> {
        slot.as_ref().map(|h| &h.conn).ok_or(StoreError::Closed)
    }

    async fn begin(conn: &Connection) -> Result<(), StoreError> {
        // A write future dropped between BEGIN and COMMIT leaves its
        // transaction open on the shared connection
        if !conn.is_autocommit() {
            tracing::warn!("Rolling back a transaction left open by an abandoned write");
            conn.execute("ROLLBACK", ()).await.map_err(|e| {
                StoreError::transaction(format!("Failed to roll back abandoned transaction: {}", e))
            })?;
        }
        conn.execute("BEGIN TRANSACTION", ()).await.map_err(|e| {
            StoreError::transaction(format!("Failed to begin transaction: {}", e))
        })?;
        Ok(())
    }

    /// Commit on success, roll back on failure
    async fn finish<T>(conn: &Connection, result: Result<T, StoreError>) -> Result<T, StoreError> {
        match result {
            Ok(value) => {
                if let Err(e) = conn.execute("COMMIT", ()).await {
                    let _rollback = conn.execute("ROLLBACK", ()).await;
                    return Err(StoreError::transaction(format!(
                        "Failed to commit transaction: {}",
                        e
                    )));
                }
                Ok(value)
            }
            Err(e) => {
                let _rollback = conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }

    async fn write_record(
        conn: &Connection,
        collection: Collection,
        record: &Value,
    ) -> Result<(), StoreError> {
        let key = record_key(collection, record)?;
        let body = serde_json::to_string(record)?;

        match collection {
            Collection::Notes => Self::write_note(conn, &key, record, &body).await,
            Collection::Folders => {
                let columns = FolderColumns::extract(record);
                conn.execute(
                    "INSERT INTO folders (id, name, parent_id, body) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        parent_id = excluded.parent_id,
                        body = excluded.body",
                    (
                        key.as_str(),
                        columns.name.as_str(),
                        columns.parent_id.as_deref(),
                        body.as_str(),
                    ),
                )
                .await
                .map_err(|e| {
                    StoreError::transaction(format!("Failed to write folder {}: {}", key, e))
                })?;
                Ok(())
            }
            Collection::Settings => {
                conn.execute(
                    "INSERT INTO settings (key, body) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET body = excluded.body",
                    (key.as_str(), body.as_str()),
                )
                .await
                .map_err(|e| {
                    StoreError::transaction(format!("Failed to write setting {}: {}", key, e))
                })?;
                Ok(())
            }
        }
    }

    async fn write_note(
        conn: &Connection,
        id: &str,
        record: &Value,
        body: &str,
    ) -> Result<(), StoreError> {
        let columns = NoteColumns::extract(record);

        conn.execute(
            "INSERT INTO notes (id, title, created_ms, modified_ms, folder_id, synced, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                created_ms = excluded.created_ms,
                modified_ms = excluded.modified_ms,
                folder_id = excluded.folder_id,
                synced = excluded.synced,
                body = excluded.body",
            (
                id,
                columns.title.as_str(),
                columns.created_ms,
                columns.modified_ms,
                columns.folder_id.as_deref(),
                columns.synced as i64,
                body,
            ),
        )
        .await
        .map_err(|e| StoreError::transaction(format!("Failed to write note {}: {}", id, e)))?;

        conn.execute("DELETE FROM note_tags WHERE note_id = ?1", [id])
            .await
            .map_err(|e| {
                StoreError::transaction(format!("Failed to clear tags of note {}: {}", id, e))
            })?;

        for tag in &columns.tags {
            conn.execute(
                "INSERT INTO note_tags (note_id, tag) VALUES (?1, ?2)",
                (id, tag.as_str()),
            )
            .await
            .map_err(|e| {
                StoreError::transaction(format!("Failed to index tag of note {}: {}", id, e))
            })?;
        }

        Ok(())
    }

    async fn collect_bodies(mut rows: Rows, context: &str) -> Result<Vec<Value>, StoreError> {
        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to read {}: {}", context, e)))?
        {
            let body: String = row
                .get(0)
                .map_err(|e| StoreError::transaction(format!("Failed to read {}: {}", context, e)))?;
            records.push(decode_body(body));
        }
        Ok(records)
    }

    fn table(collection: Collection) -> &'static str {
        match collection {
            Collection::Notes => "notes",
            Collection::Folders => "folders",
            Collection::Settings => "settings",
        }
    }
}

/// Parse a stored body. Malformed JSON is surfaced as a string value so the
/// validator can reject it like any other bad record.
fn decode_body(body: String) -> Value {
    match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Stored record is not valid JSON: {}", e);
            Value::String(body)
        }
    }
}

#[async_trait]
impl EntityStore for LibsqlStore {
    async fn put(&self, collection: Collection, record: Value) -> Result<(), StoreError> {
        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        Self::begin(conn).await?;
        let result = Self::write_record(conn, collection, &record).await;
        Self::finish(conn, result).await
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError> {
        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        let sql = format!(
            "SELECT body FROM {} WHERE {} = ?1",
            Self::table(collection),
            collection.key_field()
        );
        let rows = conn
            .query(&sql, [id])
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to get {} {}: {}", collection, id, e)))?;
        Ok(Self::collect_bodies(rows, collection.as_str())
            .await?
            .into_iter()
            .next())
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>, StoreError> {
        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        let sql = format!("SELECT body FROM {} ORDER BY rowid", Self::table(collection));
        let rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| StoreError::transaction(format!("Failed to list {}: {}", collection, e)))?;
        Self::collect_bodies(rows, collection.as_str()).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        Self::begin(conn).await?;
        let result = async {
            if collection == Collection::Notes {
                conn.execute("DELETE FROM note_tags WHERE note_id = ?1", [id])
                    .await
                    .map_err(|e| {
                        StoreError::transaction(format!("Failed to clear tags of note {}: {}", id, e))
                    })?;
            }
            let sql = format!(
                "DELETE FROM {} WHERE {} = ?1",
                Self::table(collection),
                collection.key_field()
            );
            let affected = conn.execute(&sql, [id]).await.map_err(|e| {
                StoreError::transaction(format!("Failed to delete {} {}: {}", collection, id, e))
            })?;
            Ok::<bool, StoreError>(affected > 0)
        }
        .await;
        Self::finish(conn, result).await
    }

    async fn save_many(&self, notes: &[Value], folders: &[Value]) -> Result<(), StoreError> {
        if notes.is_empty() && folders.is_empty() {
            return Ok(());
        }

        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        Self::begin(conn).await?;
        let result = async {
            for folder in folders {
                Self::write_record(conn, Collection::Folders, folder).await?;
            }
            for note in notes {
                Self::write_record(conn, Collection::Notes, note).await?;
            }
            Ok::<(), StoreError>(())
        }
        .await;
        Self::finish(conn, result).await?;

        tracing::debug!("Saved {} notes and {} folders", notes.len(), folders.len());
        Ok(())
    }

    async fn mark_synced(&self, id: &str, version: u64) -> Result<bool, StoreError> {
        let version = i64::try_from(version)
            .map_err(|_| StoreError::transaction(format!("Version {} out of range", version)))?;

        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        Self::begin(conn).await?;
        let result = conn
            .execute(
                "UPDATE notes
                 SET synced = 1, body = json_set(body, '$.synced', json('true'))
                 WHERE id = ?1
                   AND json_valid(body)
                   AND COALESCE(json_extract(body, '$.metadata.version'), 1) = ?2",
                (id, version),
            )
            .await
            .map(|affected| affected > 0)
            .map_err(|e| StoreError::transaction(format!("Failed to mark note {} synced: {}", id, e)));
        Self::finish(conn, result).await
    }

    async fn find_by(&self, index: IndexKey, value: &str) -> Result<Vec<Value>, StoreError> {
        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        let query_error =
            |e: libsql::Error| StoreError::transaction(format!("Failed to query index {}: {}", index.name(), e));

        if index.is_temporal() {
            let Some(millis) = parse_millis(value) else {
                return Ok(Vec::new());
            };
            let sql = match index {
                IndexKey::NoteCreatedAt => {
                    "SELECT body FROM notes WHERE created_ms = ?1 ORDER BY rowid"
                }
                _ => "SELECT body FROM notes WHERE modified_ms = ?1 ORDER BY rowid",
            };
            let rows = conn.query(sql, [millis]).await.map_err(query_error)?;
            return Self::collect_bodies(rows, index.name()).await;
        }

        let sql = match index {
            IndexKey::NoteTitle => "SELECT body FROM notes WHERE title = ?1 ORDER BY rowid",
            IndexKey::NoteFolder => "SELECT body FROM notes WHERE folder_id = ?1 ORDER BY rowid",
            IndexKey::NoteTag => {
                "SELECT n.body FROM notes n
                 JOIN note_tags t ON t.note_id = n.id
                 WHERE t.tag = ?1
                 ORDER BY n.rowid"
            }
            IndexKey::FolderName => "SELECT body FROM folders WHERE name = ?1 ORDER BY rowid",
            IndexKey::FolderParent => {
                "SELECT body FROM folders WHERE parent_id = ?1 ORDER BY rowid"
            }
            IndexKey::NoteCreatedAt | IndexKey::NoteModifiedAt => {
                return Err(StoreError::UnsupportedIndex {
                    index: index.name(),
                })
            }
        };
        let rows = conn.query(sql, [value]).await.map_err(query_error)?;
        Self::collect_bodies(rows, index.name()).await
    }

    async fn find_in_range(
        &self,
        index: IndexKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Value>, StoreError> {
        let sql = match index {
            IndexKey::NoteCreatedAt => {
                "SELECT body FROM notes WHERE created_ms BETWEEN ?1 AND ?2 ORDER BY rowid"
            }
            IndexKey::NoteModifiedAt => {
                "SELECT body FROM notes WHERE modified_ms BETWEEN ?1 AND ?2 ORDER BY rowid"
            }
            _ => {
                return Err(StoreError::UnsupportedIndex {
                    index: index.name(),
                })
            }
        };

        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        let rows = conn
            .query(sql, (from.timestamp_millis(), to.timestamp_millis()))
            .await
            .map_err(|e| {
                StoreError::transaction(format!("Failed to query index {}: {}", index.name(), e))
            })?;
        Self::collect_bodies(rows, index.name()).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let guard = self.inner.lock().await;
        let conn = Self::conn(&guard)?;

        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(|e| StoreError::transaction(format!("Ping failed: {}", e)))?;
        rows.next()
            .await
            .map_err(|e| StoreError::transaction(format!("Ping failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().await;
        if guard.take().is_some() {
            tracing::info!("Closed store at {}", self.db_path.display());
        }
        Ok(())
    }
}
