//! # idmap storage
//!
//! Journal backends for the idmap document store.
//!
//! A journal is an **opaque append-only byte log**. Backends do not
//! interpret what they store; framing, checksums and replay belong to
//! `idmap_docstore`.
//!
//! ## Design Principles
//!
//! - Appends are the only way data enters a journal
//! - `replace` swaps the whole journal atomically (used by compaction)
//! - `truncate` drops a torn tail discovered during replay
//! - Backends must be `Send + Sync`
//!
//! ## Available Backends
//!
//! - [`InMemoryJournal`] - For tests and ephemeral stores
//! - [`FileJournal`] - Persistent journal using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use idmap_storage::{InMemoryJournal, JournalBackend};
//!
//! let mut journal = InMemoryJournal::new();
//! let offset = journal.append(b"frame").unwrap();
//! assert_eq!(offset, 0);
//! assert_eq!(journal.read_all().unwrap(), b"frame");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::JournalBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileJournal;
pub use memory::InMemoryJournal;
