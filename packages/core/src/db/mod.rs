//! Persistent Store Layer
//!
//! This module holds everything that touches durable storage:
//!
//! - [`EntityStore`]: the keyed document store trait the repository and the
//!   sync queue are written against
//! - [`LibsqlStore`]: the production backend on an embedded libsql database
//! - [`MemoryStore`]: an in-process backend with latency and failure
//!   injection for tests and benchmarks
//!
//! Stores hand records back as raw JSON. Turning them into [`crate::models`]
//! types is the validator's job, not the store's.

mod entity_store;
mod error;
mod libsql_store;
mod memory_store;

pub use entity_store::{Collection, EntityStore, IndexKey};
pub(crate) use entity_store::note_version;
pub use error::StoreError;
pub use libsql_store::{LibsqlStore, SCHEMA_VERSION};
pub use memory_store::MemoryStore;
