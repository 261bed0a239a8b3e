//! Notekeep Core
//!
//! Storage and data engine for a local-first note-taking application.
//!
//! # Architecture
//!
//! - **Document records**: notes and folders are stored as JSON documents
//!   next to extracted index columns
//! - **libsql**: embedded SQLite-compatible database
//! - **Repository as sole writer**: the UI layer talks to an in-memory cache;
//!   only the repository and the sync queue write to the store
//! - **Dirty set**: unsaved changes are tracked and drained by a background
//!   flusher
//!
//! # Modules
//!
//! - [`models`] - Data structures (Note, Folder)
//! - [`validation`] - Sanitizing untyped records into entities
//! - [`db`] - Persistent store trait and its libsql and in-memory backends
//! - [`services`] - Repository, search, flusher and sync queue
//! - [`settings`] - Typed access to persisted settings
//! - [`config`] - Engine configuration
//! - [`logging`] - Tracing subscriber setup for binaries

pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod services;
pub mod settings;
pub mod utils;
pub mod validation;

// Re-export commonly used types
pub use config::EngineConfig;
pub use db::{EntityStore, LibsqlStore, MemoryStore, StoreError};
pub use models::*;
pub use services::*;
pub use settings::Settings;
