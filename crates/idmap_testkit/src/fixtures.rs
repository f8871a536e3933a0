//! Test fixtures and mapper helpers.
//!
//! The fixtures model a small scouting app: participants belong to groups,
//! and attendance and honor records point at participants.

use idmap_core::{
    CollectionSpec, Document, DocumentStore, EntityId, FkRegistry, IdMapper, ManualClock,
    MapperConfig, StoreConfig,
};
use idmap_storage::{FileJournal, InMemoryJournal};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Start time of every fixture clock (2023-11-14T22:13:20Z).
pub const FIXTURE_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Entity stores of the scouting schema.
pub fn scouting_collections() -> Vec<CollectionSpec> {
    vec![
        CollectionSpec::new("groups", "id"),
        CollectionSpec::new("participants", "id").with_index("group_id"),
        CollectionSpec::new("attendance", "id").with_index("participant_id"),
        CollectionSpec::new("honors", "id").with_index("participant_id"),
    ]
}

/// Foreign keys of the scouting schema.
pub fn scouting_registry() -> FkRegistry {
    FkRegistry::new()
        .with_foreign_key("participant_id", "participants", ["attendance", "honors"])
        .with_foreign_key("group_id", "groups", ["participants"])
}

/// Converts a JSON object literal into a [`Document`].
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("fixture document must be an object, got {other}"),
    }
}

enum Backing {
    Memory(InMemoryJournal),
    File { _dir: TempDir, path: PathBuf },
}

/// An [`IdMapper`] over the scouting schema with a manual clock.
///
/// Dereferences to the mapper. [`TestMapper::reopen`] simulates an app
/// restart over the same journal.
pub struct TestMapper {
    /// The mapper under test.
    pub mapper: IdMapper,
    /// Clock driving mapping timestamps.
    pub clock: Arc<ManualClock>,
    config: MapperConfig,
    backing: Backing,
}

impl TestMapper {
    /// Creates a mapper backed by an in-memory journal.
    pub fn memory() -> Self {
        Self::memory_with_config(MapperConfig::default())
    }

    /// Creates a mapper with a custom configuration over an in-memory
    /// journal.
    pub fn memory_with_config(config: MapperConfig) -> Self {
        let journal = InMemoryJournal::new();
        let store = DocumentStore::open(StoreConfig::default(), Box::new(journal.clone()))
            .expect("failed to open in-memory store");
        let clock = Arc::new(ManualClock::new(FIXTURE_EPOCH_MILLIS));
        Self::build(store, config, clock, Backing::Memory(journal))
    }

    /// Creates a mapper backed by a journal file in a temporary directory.
    pub fn file() -> Self {
        let dir = TempDir::new().expect("failed to create temp directory");
        let path = dir.path().join("idmap.journal");
        let store = DocumentStore::open_path(&path, StoreConfig::default())
            .expect("failed to open file store");
        let clock = Arc::new(ManualClock::new(FIXTURE_EPOCH_MILLIS));
        Self::build(
            store,
            MapperConfig::default(),
            clock,
            Backing::File { _dir: dir, path },
        )
    }

    fn build(
        store: DocumentStore,
        config: MapperConfig,
        clock: Arc<ManualClock>,
        backing: Backing,
    ) -> Self {
        for spec in scouting_collections() {
            store
                .ensure_collection(spec)
                .expect("failed to create fixture collection");
        }
        let mapper = IdMapper::open(Arc::new(store), scouting_registry(), config.clone())
            .expect("failed to open mapper")
            .with_clock(clock.clone());
        Self {
            mapper,
            clock,
            config,
            backing,
        }
    }

    /// Drops the mapper and store and opens them again from the journal.
    ///
    /// The clock keeps its current time. Any other handle to the old store
    /// must be dropped first, or a file journal stays locked.
    pub fn reopen(self) -> Self {
        let Self {
            mapper,
            clock,
            config,
            backing,
        } = self;
        drop(mapper);

        let store = match &backing {
            Backing::Memory(journal) => {
                DocumentStore::open(StoreConfig::default(), Box::new(journal.clone()))
            }
            Backing::File { path, .. } => {
                let journal = FileJournal::open(path).expect("failed to reopen journal");
                DocumentStore::open(StoreConfig::default(), Box::new(journal))
            }
        }
        .expect("failed to replay journal");
        Self::build(store, config, clock, backing)
    }

    /// The in-memory journal, if this mapper uses one.
    pub fn journal(&self) -> Option<&InMemoryJournal> {
        match &self.backing {
            Backing::Memory(journal) => Some(journal),
            Backing::File { .. } => None,
        }
    }

    /// The journal file path, if this mapper uses one.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { path, .. } => Some(path),
        }
    }

    /// Stores a participant created offline, plus `attendance` records and
    /// one honor pointing at it. Returns the attendance keys.
    pub fn seed_offline_participant(
        &self,
        temp_id: &str,
        name: &str,
        attendance: usize,
    ) -> Vec<EntityId> {
        let store = self.mapper.store();
        store
            .put(
                "participants",
                doc(json!({"id": temp_id, "name": name, "locally_modified": true})),
            )
            .expect("failed to seed participant");
        store
            .put(
                "honors",
                doc(json!({"id": format!("{temp_id}-honor"), "participant_id": temp_id})),
            )
            .expect("failed to seed honor");
        (0..attendance)
            .map(|i| {
                store
                    .put(
                        "attendance",
                        doc(json!({
                            "id": format!("{temp_id}-att-{i}"),
                            "participant_id": temp_id,
                            "present": true,
                        })),
                    )
                    .expect("failed to seed attendance")
            })
            .collect()
    }
}

impl std::ops::Deref for TestMapper {
    type Target = IdMapper;

    fn deref(&self) -> &Self::Target {
        &self.mapper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_fixture_has_schema() {
        let mapper = TestMapper::memory();
        for spec in scouting_collections() {
            assert!(mapper.store().has_collection(&spec.name));
        }
        assert!(mapper.journal().is_some());
        assert!(mapper.path().is_none());
    }

    #[test]
    fn seeded_participant_is_referenced() {
        let mapper = TestMapper::memory();
        let keys = mapper.seed_offline_participant("temp_p1", "Ana", 3);
        assert_eq!(keys.len(), 3);
        let refs = mapper
            .store()
            .find_by("attendance", "participant_id", &json!("temp_p1"))
            .unwrap();
        assert_eq!(refs.len(), 3);
        assert_eq!(mapper.store().count("honors").unwrap(), 1);
    }

    #[test]
    fn reopen_keeps_data() {
        let mapper = TestMapper::file();
        mapper.seed_offline_participant("temp_p1", "Ana", 1);
        let mapper = mapper.reopen();
        assert_eq!(mapper.store().count("participants").unwrap(), 1);
        assert!(mapper.path().is_some());
    }
}
