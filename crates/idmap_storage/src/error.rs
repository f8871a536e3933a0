//! Error types for journal operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for journal operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to truncate beyond the end of the journal.
    #[error("cannot truncate to {requested} bytes, journal holds {size}")]
    TruncatePastEnd {
        /// The requested size.
        requested: u64,
        /// The current journal size.
        size: u64,
    },

    /// Another process holds the journal lock.
    #[error("journal locked by another process: {}", path.display())]
    Locked {
        /// Path of the locked journal.
        path: PathBuf,
    },

    /// The journal is unavailable (used by fault injection).
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}
