//! Property-based test generators using proptest.

use idmap_core::EntityId;
use proptest::prelude::*;

/// Strategy for temporary IDs with the default `temp_` prefix.
pub fn temp_id_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,16}".prop_map(|suffix| format!("temp_{suffix}"))
}

/// Strategy for server-assigned IDs, either integers or opaque strings.
pub fn server_id_strategy() -> impl Strategy<Value = EntityId> {
    prop_oneof![
        (1i64..1_000_000).prop_map(EntityId::Int),
        "srv_[a-f0-9]{8}".prop_map(EntityId::Text),
    ]
}

/// Strategy for IDs that are never temporary.
pub fn permanent_id_strategy() -> impl Strategy<Value = EntityId> {
    prop_oneof![
        any::<i64>().prop_map(EntityId::Int),
        "[a-su-z][a-z0-9_]{0,15}".prop_map(EntityId::Text),
    ]
}

/// Strategy for entity type names from the scouting schema.
pub fn entity_type_strategy() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["groups", "participants", "attendance", "honors"])
}

/// Strategy for `(temp_id, server_id)` pairs with distinct temporary IDs.
pub fn mapping_batch_strategy(max: usize) -> impl Strategy<Value = Vec<(String, EntityId)>> {
    prop::collection::btree_map(temp_id_strategy(), server_id_strategy(), 1..=max)
        .prop_map(|pairs| pairs.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use idmap_core::MapperConfig;

    proptest! {
        #[test]
        fn temp_ids_are_temporary(id in temp_id_strategy()) {
            prop_assert!(MapperConfig::default().is_temporary_str(&id));
        }

        #[test]
        fn permanent_ids_are_not_temporary(id in permanent_id_strategy()) {
            prop_assert!(!MapperConfig::default().is_temporary(&id));
        }
    }
}
