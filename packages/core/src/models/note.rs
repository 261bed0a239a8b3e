//! Note Data Structures
//!
//! This module defines the `Note` entity and its metadata block.
//!
//! # Invariants
//!
//! - `id` is generated once at creation (UUID v4) and never reused
//! - `modified_at >= created_at`, both non-decreasing across updates
//! - `metadata.version >= 1` and never decreases
//! - `tags` are trimmed, non-empty, case-sensitive and unique within the note
//!
//! Every `Note` value handed out by the repository has passed through
//! [`crate::validation::validate_note`], so these invariants hold for any
//! note read from the public API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default color assigned to notes and folders with missing or invalid colors
pub const DEFAULT_COLOR: &str = "#ffffff";

/// Maximum title length in characters
pub const MAX_TITLE_CHARS: usize = 500;

/// Maximum content size in bytes (1 MiB)
pub const MAX_CONTENT_BYTES: usize = 1024 * 1024;

/// Maximum tag length in characters
pub const MAX_TAG_CHARS: usize = 50;

/// Maximum number of tags per note
pub const MAX_TAGS: usize = 20;

fn default_version() -> u64 {
    1
}

/// Derived and bookkeeping data attached to every note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMetadata {
    /// Number of words in the markup-stripped content
    #[serde(default)]
    pub word_count: u64,

    /// Attachment references (opaque strings, usually URLs or file names)
    #[serde(default)]
    pub attachments: Vec<String>,

    /// Outgoing links found in the content
    #[serde(default)]
    pub links: Vec<String>,

    /// Edit counter, starts at 1 and is bumped by every update
    #[serde(default = "default_version")]
    pub version: u64,
}

impl Default for NoteMetadata {
    fn default() -> Self {
        Self {
            word_count: 0,
            attachments: Vec::new(),
            links: Vec::new(),
            version: 1,
        }
    }
}

/// A single note.
///
/// Serialized with camelCase field names; this is the document format stored
/// in the `notes` collection and the format used by the JSON export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Opaque, globally unique identifier
    pub id: String,

    /// Title, at most 500 characters
    pub title: String,

    /// Rich markup content, at most 1 MiB
    pub content: String,

    /// `#rrggbb` color code
    pub color: String,

    /// Ordered, de-duplicated tag list (at most 20)
    pub tags: Vec<String>,

    /// Owning folder, `None` for unfiled notes
    pub folder_id: Option<String>,

    pub favorite: bool,

    pub shared: bool,

    /// Creation timestamp (immutable)
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub modified_at: DateTime<Utc>,

    /// Whether the current revision has been pushed to the remote endpoint.
    /// `false` is the dirty/unsynchronized state.
    pub synced: bool,

    pub metadata: NoteMetadata,
}

impl Note {
    /// Whether the note carries `tag` (exact, case-sensitive match)
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Serialize into the stored document representation
    pub fn to_record(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Fields accepted when creating a note.
///
/// Everything is optional; missing fields fall back to the validator's
/// defaults (empty title/content, white color, no tags, unfiled).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNote {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl NewNote {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder_id = Some(folder_id.into());
        self
    }

    pub fn favorite(mut self) -> Self {
        self.favorite = true;
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }
}
