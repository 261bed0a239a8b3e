//! Search Engine
//!
//! Multi-term search over the repository's notes, separate from the single
//! substring filter of [`NoteQuery`](super::NoteQuery).
//!
//! # Query syntax
//!
//! - Terms are split on whitespace and matched case-insensitively
//! - `"release notes"` keeps a double-quoted phrase as one term
//! - `-draft` (or `-"old plan"`) excludes notes containing the term
//! - All terms must hold for a note to match
//!
//! Text matching looks at the fields enabled in [`SearchFields`]. The
//! structural filters in [`SearchFilters`] (folders, tags, modified range)
//! are applied independently of the text terms.
//!
//! Filters and a short query history are persisted in the settings
//! collection so they survive restarts.

use crate::models::Note;
use crate::services::repository::NoteRepository;
use crate::settings::{Settings, SEARCH_FILTERS, SEARCH_HISTORY};
use crate::utils::strip_markup;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Maximum number of remembered queries
pub const HISTORY_LIMIT: usize = 10;

/// One parsed query term, lowercased
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTerm {
    Include(String),
    Exclude(String),
}

impl SearchTerm {
    fn matches(&self, haystack: &str) -> bool {
        match self {
            SearchTerm::Include(term) => haystack.contains(term.as_str()),
            SearchTerm::Exclude(term) => !haystack.contains(term.as_str()),
        }
    }
}

/// Split a query string into terms.
///
/// An unterminated quote runs to the end of the input. A bare `-` and empty
/// phrases are ignored.
pub fn parse_query(query: &str) -> Vec<SearchTerm> {
    let mut terms = Vec::new();
    let mut chars = query.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(&first) = chars.peek() else {
            break;
        };

        let exclude = first == '-';
        if exclude {
            chars.next();
        }

        let text: String = if chars.next_if_eq(&'"').is_some() {
            let phrase: String = chars.by_ref().take_while(|c| *c != '"').collect();
            phrase.trim().to_string()
        } else {
            let mut word = String::new();
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                word.push(c);
            }
            word
        };

        if text.is_empty() {
            continue;
        }
        let text = text.to_lowercase();
        terms.push(if exclude {
            SearchTerm::Exclude(text)
        } else {
            SearchTerm::Include(text)
        });
    }

    terms
}

/// Fields consulted by text terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchFields {
    pub title: bool,
    pub content: bool,
    pub tags: bool,
}

impl Default for SearchFields {
    fn default() -> Self {
        Self {
            title: true,
            content: true,
            tags: true,
        }
    }
}

/// Active search configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchFilters {
    pub fields: SearchFields,
    /// Only notes in one of these folders; empty means any folder
    pub folders: Vec<String>,
    /// Only notes carrying at least one of these tags; empty means any
    pub tags: Vec<String>,
    pub modified_from: Option<DateTime<Utc>>,
    pub modified_to: Option<DateTime<Utc>>,
}

impl SearchFilters {
    fn admits(&self, note: &Note) -> bool {
        if !self.folders.is_empty()
            && !note
                .folder_id
                .as_ref()
                .is_some_and(|id| self.folders.contains(id))
        {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| note.has_tag(t)) {
            return false;
        }
        if self.modified_from.is_some_and(|from| note.modified_at < from) {
            return false;
        }
        if self.modified_to.is_some_and(|to| note.modified_at > to) {
            return false;
        }
        true
    }

    /// Lowercased concatenation of the enabled fields
    fn haystack(&self, note: &Note) -> String {
        let mut parts = Vec::with_capacity(3);
        if self.fields.title {
            parts.push(note.title.clone());
        }
        if self.fields.content {
            parts.push(strip_markup(&note.content));
        }
        if self.fields.tags {
            parts.push(note.tags.join(" "));
        }
        parts.join("\n").to_lowercase()
    }
}

/// Evaluate parsed terms and filters over `notes`.
///
/// Results are ordered by modification time, newest first; ties keep their
/// input order.
pub fn search_notes<'a, I>(notes: I, terms: &[SearchTerm], filters: &SearchFilters) -> Vec<Note>
where
    I: IntoIterator<Item = &'a Note>,
{
    let mut results: Vec<Note> = notes
        .into_iter()
        .filter(|note| filters.admits(note))
        .filter(|note| {
            if terms.is_empty() {
                return true;
            }
            let haystack = filters.haystack(note);
            terms.iter().all(|term| term.matches(&haystack))
        })
        .cloned()
        .collect();

    results.sort_by(|a, b| b.modified_at.cmp(&a.modified_at));
    results
}

/// Stateful search over a repository
pub struct SearchEngine {
    repository: Arc<NoteRepository>,
    settings: Settings,
    filters: SearchFilters,
    history: VecDeque<String>,
}

impl SearchEngine {
    /// Engine with default filters and an empty history
    pub fn new(repository: Arc<NoteRepository>) -> Self {
        let settings = repository.settings();
        Self {
            repository,
            settings,
            filters: SearchFilters::default(),
            history: VecDeque::new(),
        }
    }

    /// Engine with filters and history read back from settings.
    ///
    /// Unreadable settings fall back to the defaults.
    pub async fn restore(repository: Arc<NoteRepository>) -> Self {
        let mut engine = Self::new(repository);

        match engine.settings.get::<SearchFilters>(SEARCH_FILTERS).await {
            Ok(Some(filters)) => engine.filters = filters,
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read search filters: {}", e),
        }
        match engine.settings.get::<Vec<String>>(SEARCH_HISTORY).await {
            Ok(Some(history)) => {
                for query in history {
                    let query = query.trim();
                    if query.is_empty() || engine.history.iter().any(|q| q == query) {
                        continue;
                    }
                    engine.history.push_back(query.to_string());
                }
                engine.history.truncate(HISTORY_LIMIT);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read search history: {}", e),
        }

        engine
    }

    pub fn filters(&self) -> &SearchFilters {
        &self.filters
    }

    /// Replace the active filters and persist them
    pub async fn set_filters(&mut self, filters: SearchFilters) {
        self.filters = filters;
        if let Err(e) = self.settings.set(SEARCH_FILTERS, &self.filters).await {
            tracing::warn!("Failed to persist search filters: {}", e);
        }
    }

    /// Recent queries, most recent first
    pub fn history(&self) -> Vec<String> {
        self.history.iter().cloned().collect()
    }

    pub async fn clear_history(&mut self) {
        self.history.clear();
        self.persist_history().await;
    }

    /// Run `query` against the repository and record it in the history
    pub async fn search(&mut self, query: &str) -> Vec<Note> {
        let terms = parse_query(query);
        let notes = self.repository.notes().await;
        let results = search_notes(&notes, &terms, &self.filters);

        tracing::debug!("Search '{}' matched {} notes", query, results.len());
        self.remember(query).await;
        results
    }

    async fn remember(&mut self, query: &str) {
        let query = query.trim();
        if query.is_empty() {
            return;
        }
        self.history.retain(|q| q != query);
        self.history.push_front(query.to_string());
        self.history.truncate(HISTORY_LIMIT);
        self.persist_history().await;
    }

    async fn persist_history(&self) {
        let history: Vec<&String> = self.history.iter().collect();
        if let Err(e) = self.settings.set(SEARCH_HISTORY, &history).await {
            tracing::warn!("Failed to persist search history: {}", e);
        }
    }
}
