//! Service Layer Error Types
//!
//! Errors surfaced by the repository to its callers. Store and validation
//! failures are wrapped unchanged so callers can still tell a transient
//! transaction failure from a rejected entity.

use crate::db::StoreError;
use crate::services::export::ExportError;
use crate::validation::ValidationError;
use thiserror::Error;

/// Repository operation errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Entity rejected by the validator (strict mode)
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Persistent store operation failed
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Note not found: {id}")]
    NoteNotFound { id: String },

    #[error("Folder not found: {id}")]
    FolderNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}

impl RepositoryError {
    pub fn note_not_found(id: impl Into<String>) -> Self {
        Self::NoteNotFound { id: id.into() }
    }

    pub fn folder_not_found(id: impl Into<String>) -> Self {
        Self::FolderNotFound { id: id.into() }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transient())
    }
}
