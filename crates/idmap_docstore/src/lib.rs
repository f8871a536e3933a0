//! # idmap docstore
//!
//! Embedded document store backing offline ID reconciliation.
//!
//! This crate provides:
//! - Named collections of JSON documents keyed by an [`EntityId`]
//! - Optional hash indexes for equality lookups on any field
//! - Exclusive write transactions with read-your-writes
//! - A checksummed journal replayed on open, with torn-write recovery
//! - Snapshot compaction
//!
//! ## Key Invariants
//!
//! - One writer at a time; readers never block on the writer
//! - A committed transaction is visible in full or not at all, both to
//!   concurrent readers and after a crash
//! - A failed commit leaves committed state and the journal unchanged

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod config;
mod error;
mod id;
mod journal;
mod read;
mod store;
mod transaction;

pub use collection::{CollectionSpec, Document};
pub use config::StoreConfig;
pub use error::{DocStoreError, DocStoreResult};
pub use id::EntityId;
pub use journal::{compute_crc32, Batch, JournalOp, FRAME_MAGIC, FRAME_VERSION};
pub use read::DocumentRead;
pub use store::DocumentStore;
pub use transaction::WriteTransaction;
