//! In-memory journal for tests and ephemeral stores.

use crate::backend::JournalBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory journal.
///
/// Clones share the same underlying buffer, so a test can keep a handle
/// after moving the journal into a store, inspect the bytes, and reopen a
/// store over them to simulate a restart.
///
/// Writes can be made to fail with [`InMemoryJournal::set_fail_writes`]
/// to exercise error propagation.
///
/// # Example
///
/// ```rust
/// use idmap_storage::{InMemoryJournal, JournalBackend};
///
/// let journal = InMemoryJournal::new();
/// let mut writer = journal.clone();
/// writer.append(b"abc").unwrap();
/// assert_eq!(journal.data(), b"abc");
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryJournal {
    data: Arc<RwLock<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
    fail_replace: Arc<AtomicBool>,
}

impl InMemoryJournal {
    /// Creates a new empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a journal preloaded with bytes.
    ///
    /// Useful for replay and torn-write tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            fail_replace: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a copy of the journal bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Makes every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent [`JournalBackend::replace`] fail until reset,
    /// while appends keep working.
    pub fn set_fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("write failure injected".into()));
        }
        Ok(())
    }
}

impl JournalBackend for InMemoryJournal {
    fn append(&mut self, new_data: &[u8]) -> StorageResult<u64> {
        self.check_writable()?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn read_all(&self) -> StorageResult<Vec<u8>> {
        Ok(self.data())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check_writable()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.check_writable()?;
        let mut data = self.data.write();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace(&mut self, new_data: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("replace failure injected".into()));
        }
        *self.data.write() = new_data.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut journal = InMemoryJournal::new();
        assert_eq!(journal.append(b"hello").unwrap(), 0);
        assert_eq!(journal.append(b" world").unwrap(), 5);
        assert_eq!(journal.size().unwrap(), 11);
        assert_eq!(journal.read_all().unwrap(), b"hello world");
    }

    #[test]
    fn clones_share_buffer() {
        let journal = InMemoryJournal::new();
        let mut other = journal.clone();
        other.append(b"shared").unwrap();
        assert_eq!(journal.data(), b"shared");
    }

    #[test]
    fn truncate_drops_tail() {
        let mut journal = InMemoryJournal::with_data(b"abcdef".to_vec());
        journal.truncate(3).unwrap();
        assert_eq!(journal.data(), b"abc");
        assert!(matches!(
            journal.truncate(10),
            Err(StorageError::TruncatePastEnd { .. })
        ));
    }

    #[test]
    fn replace_swaps_contents() {
        let mut journal = InMemoryJournal::with_data(b"old".to_vec());
        journal.replace(b"brand new").unwrap();
        assert_eq!(journal.data(), b"brand new");
    }

    #[test]
    fn injected_failures_block_writes() {
        let mut journal = InMemoryJournal::new();
        journal.set_fail_writes(true);
        assert!(matches!(
            journal.append(b"x"),
            Err(StorageError::Unavailable(_))
        ));
        assert!(journal.sync().is_err());
        assert_eq!(journal.size().unwrap(), 0);

        journal.set_fail_writes(false);
        journal.append(b"x").unwrap();
        assert_eq!(journal.size().unwrap(), 1);
    }

    #[test]
    fn injected_replace_failure_keeps_appends_working() {
        let mut journal = InMemoryJournal::with_data(b"abc".to_vec());
        journal.set_fail_replace(true);
        assert!(matches!(
            journal.replace(b"new"),
            Err(StorageError::Unavailable(_))
        ));
        journal.append(b"d").unwrap();
        assert_eq!(journal.data(), b"abcd");

        journal.set_fail_replace(false);
        journal.replace(b"new").unwrap();
        assert_eq!(journal.data(), b"new");
    }

    proptest::proptest! {
        #[test]
        fn appends_concatenate_in_order(
            chunks in proptest::collection::vec(
                proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64),
                0..16,
            )
        ) {
            let mut journal = InMemoryJournal::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                let offset = journal.append(chunk).unwrap();
                proptest::prop_assert_eq!(offset, expected.len() as u64);
                expected.extend_from_slice(chunk);
            }
            proptest::prop_assert_eq!(journal.read_all().unwrap(), expected);
        }
    }
}
