//! Journal backend trait definition.

use crate::error::StorageResult;

/// An append-only journal that persists document store batches.
///
/// # Invariants
///
/// - `append` returns the offset where the data begins
/// - `read_all` returns every byte appended since the last `replace`
///   or `truncate`, in order
/// - `replace` is all-or-nothing: after a crash the journal holds either
///   the old contents or the new contents, never a mix
/// - After `sync` returns, appended data survives process termination
pub trait JournalBackend: Send + Sync {
    /// Appends bytes to the end of the journal.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Reads the full journal contents.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn read_all(&self) -> StorageResult<Vec<u8>>;

    /// Returns the current size of the journal in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Makes all appended data durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Drops every byte after `new_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` exceeds the current size or the
    /// truncation fails.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Atomically replaces the whole journal with `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new contents cannot be written. The old
    /// contents remain intact in that case.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
