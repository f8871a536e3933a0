//! Behavioral properties of the ID mapper.

use idmap_core::{
    CollectionSpec, Dependency, Document, DocumentStore, EntityId, FkRegistry, IdMapper,
    ManualClock, MapperConfig, OutboxEntry, OutboxOperation,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn mapper() -> (IdMapper, Arc<ManualClock>) {
    let store = Arc::new(DocumentStore::open_in_memory().unwrap());
    store
        .create_collection(CollectionSpec::new("participants", "id"))
        .unwrap();
    for name in ["attendance", "honors"] {
        store
            .create_collection(CollectionSpec::new(name, "id").with_index("participant_id"))
            .unwrap();
    }
    let registry =
        FkRegistry::new().with_foreign_key("participant_id", "participants", ["attendance", "honors"]);
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let mapper = IdMapper::open(store, registry, MapperConfig::default())
        .unwrap()
        .with_clock(clock.clone());
    (mapper, clock)
}

fn temp_id() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,12}".prop_map(|s| format!("temp_{s}"))
}

fn server_id() -> impl Strategy<Value = EntityId> {
    prop_oneof![
        (1i64..1_000_000).prop_map(EntityId::Int),
        "srv_[a-f0-9]{6}".prop_map(EntityId::Text),
    ]
}

#[test]
fn idempotent_add_keeps_one_record() {
    let (mapper, _) = mapper();
    for _ in 0..3 {
        mapper
            .add_mapping("participants", "temp_abc", EntityId::Int(42))
            .unwrap();
    }
    assert_eq!(mapper.get_all_mappings().unwrap().len(), 1);
}

#[test]
fn bidirectional_lookup() {
    let (mapper, _) = mapper();
    mapper
        .add_mapping("participants", "temp_abc", EntityId::Int(42))
        .unwrap();
    assert_eq!(
        mapper.get_server_id("participants", "temp_abc").unwrap(),
        Some(EntityId::Int(42))
    );
    assert_eq!(
        mapper
            .get_temp_id("participants", &EntityId::Int(42))
            .unwrap()
            .as_deref(),
        Some("temp_abc")
    );
}

#[test]
fn repair_rewrites_every_registered_reference() {
    let (mapper, _) = mapper();
    let store = mapper.store().clone();
    for i in 0..3 {
        store
            .put("attendance", doc(json!({"id": i, "participant_id": "temp_abc"})))
            .unwrap();
    }
    for i in 0..2 {
        store
            .put("honors", doc(json!({"id": i, "participant_id": "temp_abc"})))
            .unwrap();
    }

    let report = mapper
        .repair_references("participants", "temp_abc", EntityId::Int(42))
        .unwrap();
    assert_eq!(report.dependents_repaired, 5);

    for name in ["attendance", "honors"] {
        assert!(store
            .find_by(name, "participant_id", &json!("temp_abc"))
            .unwrap()
            .is_empty());
    }
    assert_eq!(store.find_by("attendance", "participant_id", &json!(42)).unwrap().len(), 3);
    assert_eq!(store.find_by("honors", "participant_id", &json!(42)).unwrap().len(), 2);
}

#[test]
fn self_repair_swaps_keys() {
    let (mapper, _) = mapper();
    let store = mapper.store().clone();
    store
        .put(
            "participants",
            doc(json!({"id": "temp_abc", "name": "Ana", "locally_modified": true})),
        )
        .unwrap();

    mapper
        .repair_references("participants", "temp_abc", EntityId::Int(42))
        .unwrap();

    assert!(store
        .get("participants", &EntityId::from("temp_abc"))
        .unwrap()
        .is_none());
    let swapped = store.get("participants", &EntityId::Int(42)).unwrap().unwrap();
    assert_eq!(swapped["id"], json!(42));
    assert_eq!(swapped["name"], json!("Ana"));
    assert_eq!(swapped["locally_modified"], json!(false));
}

#[test]
fn outbox_dependency_resolution_touches_only_matches() {
    let (mapper, _) = mapper();
    let id = mapper
        .outbox()
        .enqueue(
            OutboxEntry::new("attendance", "temp_att", OutboxOperation::Create)
                .with_dependency(Dependency::new("participants", "temp_abc"))
                .with_dependency(Dependency::new("participants", "temp_xyz")),
        )
        .unwrap();

    mapper
        .repair_references("participants", "temp_abc", EntityId::Int(42))
        .unwrap();

    let entry = mapper.outbox().get(id).unwrap().unwrap();
    assert!(entry.dependencies[0].resolved);
    assert_eq!(entry.dependencies[0].server_id, Some(EntityId::Int(42)));
    assert!(!entry.dependencies[1].resolved);
    assert_eq!(entry.dependencies[1].server_id, None);
    assert!(!entry.is_ready());
}

#[test]
fn resolve_pass_through_and_pending() {
    let (mapper, _) = mapper();
    let permanent = EntityId::from("srv_99");
    assert_eq!(mapper.resolve_id("participants", &permanent).unwrap(), permanent);

    let pending = EntityId::from("temp_unmapped");
    assert_eq!(mapper.resolve_id("participants", &pending).unwrap(), pending);
}

#[test]
fn retention_31_vs_29_days() {
    let (mapper, clock) = mapper();
    mapper
        .add_mapping("participants", "temp_old", EntityId::Int(1))
        .unwrap();
    clock.advance(2 * DAY);
    mapper
        .add_mapping("participants", "temp_new", EntityId::Int(2))
        .unwrap();
    clock.advance(29 * DAY);

    assert_eq!(mapper.purge_old_mappings(30 * DAY).unwrap(), 1);
    let left = mapper.get_all_mappings().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].temp_id, "temp_new");
}

#[test]
fn second_repair_reports_zero() {
    let (mapper, _) = mapper();
    let store = mapper.store().clone();
    store
        .put("participants", doc(json!({"id": "temp_abc"})))
        .unwrap();
    store
        .put("attendance", doc(json!({"id": 1, "participant_id": "temp_abc"})))
        .unwrap();

    let first = mapper
        .repair_references("participants", "temp_abc", EntityId::Int(42))
        .unwrap();
    assert_eq!(first.repaired_count(), 2);
    let second = mapper
        .repair_references("participants", "temp_abc", EntityId::Int(42))
        .unwrap();
    assert_eq!(second.repaired_count(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn add_is_idempotent_and_first_wins(
        temp in temp_id(),
        first in server_id(),
        others in prop::collection::vec(server_id(), 0..4),
    ) {
        let (mapper, _) = mapper();
        mapper.add_mapping("participants", &temp, first.clone()).unwrap();
        for other in others {
            mapper.add_mapping("participants", &temp, other).unwrap();
        }
        prop_assert_eq!(mapper.get_all_mappings().unwrap().len(), 1);
        prop_assert_eq!(mapper.get_server_id("participants", &temp).unwrap(), Some(first));
    }

    #[test]
    fn lookups_are_inverse(
        pairs in prop::collection::btree_map(temp_id(), 1i64..1_000_000, 1..8),
    ) {
        let (mapper, _) = mapper();
        let mut used = std::collections::HashSet::new();
        for (temp, server) in &pairs {
            if !used.insert(*server) {
                continue;
            }
            mapper.add_mapping("participants", temp, EntityId::Int(*server)).unwrap();
            prop_assert_eq!(
                mapper.get_temp_id("participants", &EntityId::Int(*server)).unwrap(),
                Some(temp.clone())
            );
            prop_assert_eq!(
                mapper
                    .resolve_id("participants", &EntityId::from(temp.as_str()))
                    .unwrap(),
                EntityId::Int(*server)
            );
        }
    }

    #[test]
    fn repair_leaves_no_temp_references(
        temp in temp_id(),
        server in server_id(),
        attendance in 0usize..6,
        honors in 0usize..4,
    ) {
        let (mapper, _) = mapper();
        let store = mapper.store().clone();
        store.put("participants", doc(json!({"id": temp}))).unwrap();
        for i in 0..attendance {
            store
                .put("attendance", doc(json!({"id": i, "participant_id": temp})))
                .unwrap();
        }
        for i in 0..honors {
            store
                .put("honors", doc(json!({"id": i, "participant_id": temp})))
                .unwrap();
        }

        let report = mapper.complete_sync("participants", &temp, server.clone()).unwrap();
        prop_assert_eq!(report.repaired_count(), 1 + attendance + honors);
        prop_assert!(mapper.find_dangling_references().unwrap().is_empty());
        prop_assert_eq!(store.count("participants").unwrap(), 1);
        prop_assert!(store.get("participants", &server).unwrap().is_some());

        let again = mapper.repair_references("participants", &temp, server).unwrap();
        prop_assert_eq!(again.repaired_count(), 0);
    }
}
