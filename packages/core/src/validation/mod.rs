//! Entity Validation and Sanitization
//!
//! Every entity entering or leaving the repository passes through this module
//! exactly once. Input is an untyped JSON document (a persisted record, an
//! import payload, or a serialized draft) and output is a well-formed
//! [`Note`] or [`Folder`].
//!
//! # Pipeline
//!
//! 1. Type check: the input must be a JSON object
//! 2. Required fields: `id` for both entities, plus a non-empty `name` for folders
//! 3. Field coercion and clamping: length truncation, color fallback, tag
//!    de-duplication and capping, folder reference existence, numeric clamping
//! 4. Timestamp defaulting: missing or unparseable timestamps become "now"
//!
//! Only step 1 and 2 can fail. Everything in step 3 and 4 degrades gracefully
//! and emits a `tracing` warning instead.
//!
//! # Strictness
//!
//! [`Strictness::Strict`] returns the failure as a [`ValidationError`]; used by
//! explicit create/update and bulk create. [`Strictness::Lenient`] logs the
//! failure and returns `Ok(None)` so bulk loads can skip bad records.
//!
//! Validation is idempotent: feeding a validated entity's serialized form
//! back in produces the same entity.

mod coerce;

use crate::models::{
    Folder, Note, NoteMetadata, DEFAULT_COLOR, MAX_CONTENT_BYTES, MAX_TAGS, MAX_TAG_CHARS,
    MAX_TITLE_CHARS,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub use coerce::normalize_color;
use coerce::{
    coerce_bool, coerce_string, coerce_string_list, coerce_timestamp, coerce_u64,
    truncate_bytes, truncate_chars,
};

/// Validation errors for entity input
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{entity} must be a JSON object")]
    NotAnObject { entity: &'static str },

    #[error("{entity} is missing required field '{field}'")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("{entity} field '{field}' must not be empty")]
    EmptyField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("{entity} field '{field}' is invalid: {reason}")]
    InvalidField {
        entity: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("record {index} rejected: {source}")]
    Batch {
        index: usize,
        #[source]
        source: Box<ValidationError>,
    },
}

impl ValidationError {
    /// Attach the position of the offending record in a batch
    pub fn in_batch(self, index: usize) -> Self {
        Self::Batch {
            index,
            source: Box::new(self),
        }
    }
}

/// Whether a hard validation failure is raised or swallowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Raise `ValidationError`
    Strict,
    /// Log a warning and return `None`
    Lenient,
}

/// Existence check for folder references
pub trait FolderLookup {
    fn contains_folder(&self, id: &str) -> bool;
}

impl FolderLookup for HashSet<String> {
    fn contains_folder(&self, id: &str) -> bool {
        self.contains(id)
    }
}

impl<V> FolderLookup for HashMap<String, V> {
    fn contains_folder(&self, id: &str) -> bool {
        self.contains_key(id)
    }
}

/// Validate and sanitize a note record.
///
/// Returns `Ok(Some(note))` on success. On a hard failure, returns the error
/// in strict mode and `Ok(None)` in lenient mode.
pub fn validate_note(
    input: &Value,
    strictness: Strictness,
    folders: &dyn FolderLookup,
) -> Result<Option<Note>, ValidationError> {
    apply_strictness("note", sanitize_note(input, folders, Utc::now()), strictness)
}

/// Validate and sanitize a folder record.
///
/// `folders` is the set of known folder identifiers used to check the parent
/// reference; it may include the folder itself (self-parenting is rejected).
pub fn validate_folder(
    input: &Value,
    strictness: Strictness,
    folders: &dyn FolderLookup,
) -> Result<Option<Folder>, ValidationError> {
    apply_strictness("folder", sanitize_folder(input, folders, Utc::now()), strictness)
}

fn apply_strictness<T>(
    entity: &str,
    result: Result<T, ValidationError>,
    strictness: Strictness,
) -> Result<Option<T>, ValidationError> {
    match (result, strictness) {
        (Ok(value), _) => Ok(Some(value)),
        (Err(e), Strictness::Strict) => Err(e),
        (Err(e), Strictness::Lenient) => {
            tracing::warn!("Skipping invalid {} record: {}", entity, e);
            Ok(None)
        }
    }
}

fn required_id(obj: &Map<String, Value>, entity: &'static str) -> Result<String, ValidationError> {
    match obj.get("id") {
        None | Some(Value::Null) => Err(ValidationError::MissingField { entity, field: "id" }),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(ValidationError::EmptyField { entity, field: "id" })
        }
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ValidationError::InvalidField {
            entity,
            field: "id",
            reason: format!("expected a string, found {}", json_kind(other)),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Resolve (created, modified) so that `modified >= created`
fn resolve_timestamps(
    obj: &Map<String, Value>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let created = obj.get("createdAt").and_then(coerce_timestamp).unwrap_or(now);
    let modified = obj
        .get("modifiedAt")
        .and_then(coerce_timestamp)
        .unwrap_or(now)
        .max(created);
    (created, modified)
}

fn sanitize_color(obj: &Map<String, Value>, id: &str) -> String {
    match obj.get("color") {
        None | Some(Value::Null) => DEFAULT_COLOR.to_string(),
        Some(value) => match value.as_str().and_then(normalize_color) {
            Some(color) => color,
            None => {
                tracing::warn!(id, "Invalid color {}, falling back to {}", value, DEFAULT_COLOR);
                DEFAULT_COLOR.to_string()
            }
        },
    }
}

fn sanitize_tags(value: Option<&Value>, id: &str) -> Vec<String> {
    let raw = match value {
        None | Some(Value::Null) => return Vec::new(),
        // A comma separated string is accepted as a tag list
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        Some(other) => coerce_string_list(other),
    };

    let mut tags: Vec<String> = Vec::new();
    for tag in raw {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        let clamped = truncate_chars(trimmed, MAX_TAG_CHARS).trim_end().to_string();
        if !tags.contains(&clamped) {
            tags.push(clamped);
        }
    }

    if tags.len() > MAX_TAGS {
        tracing::warn!(id, "Note has {} tags, keeping the first {}", tags.len(), MAX_TAGS);
        tags.truncate(MAX_TAGS);
    }
    tags
}

fn sanitize_metadata(value: Option<&Value>) -> NoteMetadata {
    let Some(Value::Object(meta)) = value else {
        return NoteMetadata::default();
    };

    let clean_list = |key: &str| -> Vec<String> {
        meta.get(key)
            .map(coerce_string_list)
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    };

    NoteMetadata {
        word_count: meta.get("wordCount").and_then(coerce_u64).unwrap_or(0),
        attachments: clean_list("attachments"),
        links: clean_list("links"),
        version: meta.get("version").and_then(coerce_u64).unwrap_or(1).max(1),
    }
}

pub(crate) fn sanitize_note(
    input: &Value,
    folders: &dyn FolderLookup,
    now: DateTime<Utc>,
) -> Result<Note, ValidationError> {
    let obj = input
        .as_object()
        .ok_or(ValidationError::NotAnObject { entity: "note" })?;
    let id = required_id(obj, "note")?;

    let title = coerce_string(obj.get("title")).unwrap_or_default();
    let title = if title.chars().count() > MAX_TITLE_CHARS {
        tracing::warn!(id = %id, "Title truncated to {} characters", MAX_TITLE_CHARS);
        truncate_chars(&title, MAX_TITLE_CHARS).to_string()
    } else {
        title
    };

    let content = coerce_string(obj.get("content")).unwrap_or_default();
    let content = if content.len() > MAX_CONTENT_BYTES {
        tracing::warn!(id = %id, "Content truncated to {} bytes", MAX_CONTENT_BYTES);
        truncate_bytes(&content, MAX_CONTENT_BYTES).to_string()
    } else {
        content
    };

    let folder_id = match coerce_string(obj.get("folderId")) {
        Some(folder) if folders.contains_folder(&folder) => Some(folder),
        Some(folder) if !folder.is_empty() => {
            tracing::warn!(id = %id, "Unknown folder '{}', note detached", folder);
            None
        }
        _ => None,
    };

    let (created_at, modified_at) = resolve_timestamps(obj, now);

    Ok(Note {
        color: sanitize_color(obj, &id),
        tags: sanitize_tags(obj.get("tags"), &id),
        favorite: obj.get("favorite").map(coerce_bool).unwrap_or(false),
        shared: obj.get("shared").map(coerce_bool).unwrap_or(false),
        synced: obj.get("synced").map(coerce_bool).unwrap_or(false),
        metadata: sanitize_metadata(obj.get("metadata")),
        id,
        title,
        content,
        folder_id,
        created_at,
        modified_at,
    })
}

pub(crate) fn sanitize_folder(
    input: &Value,
    folders: &dyn FolderLookup,
    now: DateTime<Utc>,
) -> Result<Folder, ValidationError> {
    let obj = input
        .as_object()
        .ok_or(ValidationError::NotAnObject { entity: "folder" })?;
    let id = required_id(obj, "folder")?;

    let name = match obj.get("name") {
        None | Some(Value::Null) => {
            return Err(ValidationError::MissingField {
                entity: "folder",
                field: "name",
            })
        }
        Some(value) => coerce_string(Some(value)).unwrap_or_default(),
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyField {
            entity: "folder",
            field: "name",
        });
    }
    let name = if name.chars().count() > MAX_TITLE_CHARS {
        tracing::warn!(id = %id, "Folder name truncated to {} characters", MAX_TITLE_CHARS);
        truncate_chars(name, MAX_TITLE_CHARS).trim_end().to_string()
    } else {
        name.to_string()
    };

    let parent_id = match coerce_string(obj.get("parentId")) {
        Some(parent) if parent != id && folders.contains_folder(&parent) => Some(parent),
        Some(parent) if !parent.is_empty() => {
            tracing::warn!(id = %id, "Invalid parent folder '{}', folder moved to top level", parent);
            None
        }
        _ => None,
    };

    let (created_at, modified_at) = resolve_timestamps(obj, now);

    Ok(Folder {
        color: sanitize_color(obj, &id),
        id,
        name,
        parent_id,
        created_at,
        modified_at,
    })
}
