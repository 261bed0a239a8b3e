//! Store Error Types
//!
//! Errors raised by [`EntityStore`](super::EntityStore) implementations.
//! Callers branch on the variant to decide between retrying (timeouts,
//! failed transactions) and giving up (closed store, malformed records).

use super::Collection;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Persistent store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Opening the database failed after all retries
    #[error("Failed to open store at {path}: {reason}")]
    Connection { path: PathBuf, reason: String },

    /// A read or write transaction failed and was rolled back
    #[error("Transaction failed: {context}")]
    Transaction { context: String },

    /// An operation exceeded its time bound
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The connection was closed; callers must re-open before retrying
    #[error("Store connection is closed")]
    Closed,

    /// A record handed to `put` carries no usable primary key
    #[error("Record for '{collection}' has no string key")]
    MissingId { collection: Collection },

    /// Index does not belong to the collection or cannot serve the query
    #[error("Index '{index}' cannot serve this query")]
    UnsupportedIndex { index: &'static str },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn connection(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Connection {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn transaction(context: impl Into<String>) -> Self {
        Self::Transaction {
            context: context.into(),
        }
    }

    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transaction { .. } | Self::Timeout { .. })
    }
}
