//! Business Services
//!
//! This module contains the engine's services:
//!
//! - `NoteRepository` - in-memory cache and sole writer of notes and folders
//! - `FlushProcessor` - background task draining the repository's dirty set
//! - `SearchEngine` - multi-term search with persisted filters and history
//! - `SyncQueue` - pushes unsynchronized notes to a remote endpoint
//!
//! plus the pure helpers they build on: query evaluation and export formats.
//!
//! Services are wired together by constructor injection; nothing here is a
//! global.

pub mod error;
pub mod export;
pub mod flusher;
pub mod query;
pub mod repository;
pub mod search;
pub mod sync_queue;

pub use error::RepositoryError;
pub use export::{ExportBundle, ExportError, ExportFormat, ImportRecords, EXPORT_VERSION};
pub use flusher::{flush_channel, FlushProcessor, FlushSignal, FlushWaker};
pub use query::{FolderFilter, NoteQuery, QuickFilter, SortKey, RECENT_WINDOW_DAYS};
pub use repository::{
    FolderDeletion, ImportSummary, LoadOutcome, NoteRepository, RepositoryStats, SaveOutcome,
};
pub use search::{parse_query, SearchEngine, SearchFields, SearchFilters, SearchTerm, HISTORY_LIMIT};
pub use sync_queue::{
    RemoteEndpoint, SimulatedRemote, SyncError, SyncObserver, SyncQueue, SyncReport, SyncState,
    SyncTrigger, SyncWorker,
};
