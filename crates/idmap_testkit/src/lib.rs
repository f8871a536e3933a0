//! # idmap testkit
//!
//! Test utilities for the idmap crates:
//! - Mapper fixtures over a small scouting schema, in memory or on disk
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust
//! use idmap_testkit::prelude::*;
//! use idmap_core::EntityId;
//!
//! let mapper = TestMapper::memory();
//! mapper.seed_offline_participant("temp_p1", "Ana", 2);
//! let report = mapper
//!     .complete_sync("participants", "temp_p1", EntityId::Int(7))
//!     .unwrap();
//! assert_eq!(report.repaired_count(), 4);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

pub use fixtures::*;
pub use generators::*;

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// Filtering follows `RUST_LOG` and defaults to `debug` for the idmap
/// crates. Safe to call from every test; only the first call installs
/// anything.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("idmap_core=debug,idmap_docstore=debug,idmap_storage=debug")
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
