//! Folder Data Structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A folder groups notes. Folders may nest through `parent_id`.
///
/// The note count is derived, never stored; see [`FolderSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,

    /// Non-empty, at most 500 characters
    pub name: String,

    /// Enclosing folder, `None` for top-level folders
    pub parent_id: Option<String>,

    /// `#rrggbb` color code
    pub color: String,

    pub created_at: DateTime<Utc>,

    pub modified_at: DateTime<Utc>,
}

impl Folder {
    /// Serialize into the stored document representation
    pub fn to_record(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Folder plus its derived note count
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSummary {
    #[serde(flatten)]
    pub folder: Folder,
    pub note_count: usize,
}

/// Fields accepted when creating a folder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFolder {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl NewFolder {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}
