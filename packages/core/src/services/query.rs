//! Note Query Evaluation
//!
//! Pure filter/sort evaluation over the repository's in-memory notes. Filters
//! apply in a fixed order:
//!
//! 1. quick filter (all / recently modified / favorites / shared)
//! 2. folder
//! 3. tag membership
//! 4. case-insensitive substring over title, stripped content and tags
//!
//! then the result is sorted. Every sort is stable over the input order, so
//! callers that pass notes in insertion order get insertion-order tie-breaks.

use crate::models::Note;
use crate::utils::strip_markup;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Window used by [`QuickFilter::Recent`]
pub const RECENT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuickFilter {
    #[default]
    All,
    /// Modified within the last [`RECENT_WINDOW_DAYS`] days
    Recent,
    Favorites,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FolderFilter {
    #[default]
    Any,
    Unfiled,
    Folder(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    ModifiedDesc,
    CreatedDesc,
    /// Case-insensitive alphabetical
    Title,
    /// Alphabetical by owning folder name, unfiled notes first
    FolderName,
}

/// A complete query: filters plus sort order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteQuery {
    pub quick: QuickFilter,
    pub folder: FolderFilter,
    pub tag: Option<String>,
    pub text: Option<String>,
    pub sort: SortKey,
}

impl NoteQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn quick(mut self, quick: QuickFilter) -> Self {
        self.quick = quick;
        self
    }

    pub fn in_folder(mut self, folder_id: impl Into<String>) -> Self {
        self.folder = FolderFilter::Folder(folder_id.into());
        self
    }

    pub fn unfiled(mut self) -> Self {
        self.folder = FolderFilter::Unfiled;
        self
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn containing(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }
}

fn passes_quick(note: &Note, quick: QuickFilter, now: DateTime<Utc>) -> bool {
    match quick {
        QuickFilter::All => true,
        QuickFilter::Recent => note.modified_at >= now - Duration::days(RECENT_WINDOW_DAYS),
        QuickFilter::Favorites => note.favorite,
        QuickFilter::Shared => note.shared,
    }
}

fn passes_folder(note: &Note, folder: &FolderFilter) -> bool {
    match folder {
        FolderFilter::Any => true,
        FolderFilter::Unfiled => note.folder_id.is_none(),
        FolderFilter::Folder(id) => note.folder_id.as_deref() == Some(id.as_str()),
    }
}

/// Case-insensitive substring match over title, stripped content and tags.
/// `needle` must already be lowercase.
pub(crate) fn contains_text(note: &Note, needle: &str) -> bool {
    note.title.to_lowercase().contains(needle)
        || strip_markup(&note.content).to_lowercase().contains(needle)
        || note.tags.iter().any(|t| t.to_lowercase().contains(needle))
}

/// Evaluate `query` over `notes`.
///
/// `notes` should be in insertion order; `folder_names` maps folder ids to
/// names for [`SortKey::FolderName`].
pub fn evaluate<'a, I>(
    notes: I,
    folder_names: &HashMap<String, String>,
    query: &NoteQuery,
    now: DateTime<Utc>,
) -> Vec<Note>
where
    I: IntoIterator<Item = &'a Note>,
{
    let needle = query
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase);

    let mut matches: Vec<Note> = notes
        .into_iter()
        .filter(|n| passes_quick(n, query.quick, now))
        .filter(|n| passes_folder(n, &query.folder))
        .filter(|n| query.tag.as_deref().is_none_or(|tag| n.has_tag(tag)))
        .filter(|n| needle.as_deref().is_none_or(|needle| contains_text(n, needle)))
        .cloned()
        .collect();

    sort_notes(&mut matches, query.sort, folder_names);
    matches
}

/// Stable sort by `key`
pub fn sort_notes(notes: &mut [Note], key: SortKey, folder_names: &HashMap<String, String>) {
    match key {
        SortKey::ModifiedDesc => notes.sort_by(|a, b| b.modified_at.cmp(&a.modified_at)),
        SortKey::CreatedDesc => notes.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        SortKey::Title => notes.sort_by_cached_key(|n| n.title.to_lowercase()),
        // Unfiled notes sort under the empty name
        SortKey::FolderName => notes.sort_by_cached_key(|note| {
            note.folder_id
                .as_ref()
                .and_then(|id| folder_names.get(id))
                .map(|name| name.to_lowercase())
                .unwrap_or_default()
        }),
    }
}
