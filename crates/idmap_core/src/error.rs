//! Error types for ID reconciliation.

use idmap_docstore::DocStoreError;
use thiserror::Error;

/// Result type for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors that can occur during reconciliation.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// Underlying document store failed. The operation did not commit.
    #[error("store error: {0}")]
    Store(#[from] DocStoreError),

    /// A store named by the configuration does not exist.
    #[error("unknown store `{name}` referenced by {context}")]
    UnknownStore {
        /// Missing collection name.
        name: String,
        /// What referenced it.
        context: String,
    },

    /// The foreign-key registry is malformed.
    #[error("invalid foreign-key registry: {0}")]
    InvalidRegistry(String),

    /// A persisted record could not be interpreted.
    #[error("invalid record in {collection}: {message}")]
    InvalidRecord {
        /// Collection holding the record.
        collection: String,
        /// Description of the problem.
        message: String,
    },

    /// No outbox entry with this local ID.
    #[error("outbox entry {local_id} not found")]
    OutboxEntryNotFound {
        /// The missing entry's local ID.
        local_id: u64,
    },

    /// JSON conversion failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// Creates an unknown store error.
    pub fn unknown_store(name: impl Into<String>, context: impl Into<String>) -> Self {
        Self::UnknownStore {
            name: name.into(),
            context: context.into(),
        }
    }

    /// Creates an invalid record error.
    pub fn invalid_record(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            collection: collection.into(),
            message: message.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    ///
    /// Only storage I/O failures are transient; configuration and data
    /// errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(DocStoreError::Storage(_)))
    }
}
