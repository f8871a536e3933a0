//! # idmap_core
//!
//! Temporary-to-server ID reconciliation for offline-first stores.
//!
//! Entities created offline get a client-generated temporary ID
//! (`temp_…`). Other records reference them by that ID, and mutations
//! about them queue up in an outbox. When the server answers with the
//! permanent ID, [`IdMapper`] records the mapping and repairs everything:
//!
//! 1. the entity itself is re-keyed in its own store
//! 2. every registered foreign key holding the temporary ID is rewritten
//! 3. outbox entries are updated and their dependencies resolved
//!
//! All three steps run in one document-store write transaction.
//!
//! ## Key Invariants
//!
//! - At most one mapping per `(entity_type, temp_id)`; the first one wins
//! - Repair is atomic and idempotent
//! - Only fields named in the [`FkRegistry`] are rewritten
//! - Permanent IDs resolve to themselves without touching storage

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod error;
mod mapper;
mod mapping;
mod outbox;
mod registry;
mod repair;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{MapperConfig, DEFAULT_RETENTION};
pub use error::{ReconcileError, ReconcileResult};
pub use mapper::{DanglingReference, IdMapper, ReconcileStats};
pub use mapping::MappingRecord;
pub use outbox::{Dependency, Outbox, OutboxEntry, OutboxOperation, OutboxStatus};
pub use registry::{FkRegistry, ForeignKey};
pub use repair::RepairReport;

pub use idmap_docstore::{CollectionSpec, Document, DocumentStore, EntityId, StoreConfig};
