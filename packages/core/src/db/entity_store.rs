//! Store abstraction
//!
//! [`EntityStore`] is the seam between the repository and the storage
//! backend. Records cross it as untyped JSON documents: the store never
//! validates them, it only extracts the handful of fields it indexes.
//!
//! # Collections
//!
//! - `notes`: keyed by `id`, indexed by title, created/modified time, folder,
//!   and (multi-valued) tag
//! - `folders`: keyed by `id`, indexed by name and parent
//! - `settings`: records of shape `{"key": .., "value": ..}` keyed by `key`
//!
//! # Ordering
//!
//! `get_all`, `find_by` and `find_in_range` return records in first-insertion
//! order; overwriting a record with `put` keeps its original position.

use super::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fmt;

/// Named keyed collections held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Notes,
    Folders,
    Settings,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Notes => "notes",
            Collection::Folders => "folders",
            Collection::Settings => "settings",
        }
    }

    /// Field holding the primary key
    pub fn key_field(&self) -> &'static str {
        match self {
            Collection::Settings => "key",
            _ => "id",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secondary indexes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKey {
    NoteTitle,
    NoteCreatedAt,
    NoteModifiedAt,
    NoteFolder,
    /// Multi-valued: a note matches when any of its tags equals the value
    NoteTag,
    FolderName,
    FolderParent,
}

impl IndexKey {
    pub fn collection(&self) -> Collection {
        match self {
            IndexKey::FolderName | IndexKey::FolderParent => Collection::Folders,
            _ => Collection::Notes,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            IndexKey::NoteTitle => "title",
            IndexKey::NoteCreatedAt => "createdAt",
            IndexKey::NoteModifiedAt => "modifiedAt",
            IndexKey::NoteFolder => "folderId",
            IndexKey::NoteTag => "tags",
            IndexKey::FolderName => "name",
            IndexKey::FolderParent => "parentId",
        }
    }

    /// Whether the index orders by time and can serve range queries
    pub fn is_temporal(&self) -> bool {
        matches!(self, IndexKey::NoteCreatedAt | IndexKey::NoteModifiedAt)
    }
}

/// Keyed document store with secondary indexes.
///
/// Every method is a single transaction: it either fully applies or leaves
/// the store unchanged.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert or overwrite the record under its key
    async fn put(&self, collection: Collection, record: Value) -> Result<(), StoreError>;

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError>;

    /// All records in insertion order
    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>, StoreError>;

    /// Remove a record. Returns whether anything was removed.
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError>;

    /// Write both collections in one transaction; nothing is written if any
    /// record fails.
    async fn save_many(&self, notes: &[Value], folders: &[Value]) -> Result<(), StoreError>;

    /// Set `synced = true` on an existing note whose `metadata.version`
    /// equals `version` (a missing version counts as 1). Never inserts.
    /// Returns whether the note was marked.
    async fn mark_synced(&self, id: &str, version: u64) -> Result<bool, StoreError>;

    /// Exact-match lookup on a secondary index.
    ///
    /// Temporal indexes take an RFC 3339 timestamp and match to the
    /// millisecond.
    async fn find_by(&self, index: IndexKey, value: &str) -> Result<Vec<Value>, StoreError>;

    /// Inclusive range lookup on a temporal index
    async fn find_in_range(
        &self,
        index: IndexKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Value>, StoreError>;

    /// Cheap liveness check on the underlying connection
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release the connection. Later operations fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;

    async fn get_setting(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let record = self.get(Collection::Settings, key).await?;
        Ok(record.and_then(|mut r| r.get_mut("value").map(Value::take)))
    }

    async fn put_setting(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.put(Collection::Settings, json!({ "key": key, "value": value }))
            .await
    }
}

/// Extract the primary key of a record
pub(crate) fn record_key(collection: Collection, record: &Value) -> Result<String, StoreError> {
    match record.get(collection.key_field()) {
        Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(StoreError::MissingId { collection }),
    }
}

/// Indexed columns of a note record
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct NoteColumns {
    pub title: String,
    pub created_ms: Option<i64>,
    pub modified_ms: Option<i64>,
    pub folder_id: Option<String>,
    pub tags: Vec<String>,
    pub synced: bool,
}

impl NoteColumns {
    pub fn extract(record: &Value) -> Self {
        let text = |field: &str| record.get(field).and_then(Value::as_str).map(str::to_string);
        let tags = record
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                let mut unique: Vec<String> = Vec::new();
                for tag in tags.iter().filter_map(Value::as_str) {
                    if !unique.iter().any(|t| t == tag) {
                        unique.push(tag.to_string());
                    }
                }
                unique
            })
            .unwrap_or_default();

        Self {
            title: text("title").unwrap_or_default(),
            created_ms: record.get("createdAt").and_then(timestamp_millis),
            modified_ms: record.get("modifiedAt").and_then(timestamp_millis),
            folder_id: text("folderId"),
            tags,
            synced: record.get("synced").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

/// Indexed columns of a folder record
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FolderColumns {
    pub name: String,
    pub parent_id: Option<String>,
}

impl FolderColumns {
    pub fn extract(record: &Value) -> Self {
        Self {
            name: record
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            parent_id: record
                .get("parentId")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// `metadata.version` of a note record, 1 when absent
pub(crate) fn note_version(record: &Value) -> u64 {
    record
        .pointer("/metadata/version")
        .and_then(Value::as_u64)
        .unwrap_or(1)
}

/// Millisecond timestamp of an RFC 3339 string or an epoch-millis number
pub(crate) fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => parse_millis(s),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

pub(crate) fn parse_millis(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key() {
        assert_eq!(
            record_key(Collection::Notes, &json!({"id": "n1"})).unwrap(),
            "n1"
        );
        assert_eq!(
            record_key(Collection::Settings, &json!({"key": "theme", "value": 1})).unwrap(),
            "theme"
        );
        assert!(matches!(
            record_key(Collection::Folders, &json!({"name": "x"})),
            Err(StoreError::MissingId { .. })
        ));
        assert!(record_key(Collection::Notes, &json!({"id": ""})).is_err());
    }

    #[test]
    fn test_note_columns_extraction() {
        let columns = NoteColumns::extract(&json!({
            "id": "n1",
            "title": "Hello",
            "createdAt": "2024-01-01T00:00:00.250Z",
            "modifiedAt": "2024-01-02T00:00:00Z",
            "folderId": "f1",
            "tags": ["a", "b", "a", 3],
            "synced": true
        }));

        assert_eq!(columns.title, "Hello");
        assert_eq!(columns.created_ms, Some(1_704_067_200_250));
        assert_eq!(columns.folder_id.as_deref(), Some("f1"));
        assert_eq!(columns.tags, vec!["a", "b"]);
        assert!(columns.synced);
    }

    #[test]
    fn test_note_columns_tolerate_garbage() {
        let columns = NoteColumns::extract(&json!({"id": "n1", "tags": "nope", "createdAt": {}}));
        assert_eq!(columns, NoteColumns::default());
    }

    #[test]
    fn test_index_collections() {
        assert_eq!(IndexKey::NoteTag.collection(), Collection::Notes);
        assert_eq!(IndexKey::FolderParent.collection(), Collection::Folders);
        assert!(IndexKey::NoteModifiedAt.is_temporal());
        assert!(!IndexKey::NoteTitle.is_temporal());
    }
}
