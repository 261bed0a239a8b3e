//! Data Models
//!
//! This module contains the entities managed by the note store:
//!
//! - `Note` - a single note with tags, folder membership and sync state
//! - `Folder` - a named, optionally nested grouping of notes
//!
//! Both are stored as JSON documents; the serde representation defined here
//! is the on-disk format.

mod folder;
mod note;

pub use folder::{Folder, FolderSummary, NewFolder};
pub use note::{
    NewNote, Note, NoteMetadata, DEFAULT_COLOR, MAX_CONTENT_BYTES, MAX_TAGS, MAX_TAG_CHARS,
    MAX_TITLE_CHARS,
};
