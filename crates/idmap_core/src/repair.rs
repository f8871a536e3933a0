//! Reference repair.
//!
//! Runs inside a single write transaction, so the entity swap, every
//! foreign-key rewrite and every outbox adjustment commit together. A
//! crash before commit leaves no trace; re-running after a completed
//! repair finds nothing left to rewrite.

use crate::config::MapperConfig;
use crate::error::ReconcileResult;
use crate::outbox;
use crate::registry::FkRegistry;
use idmap_docstore::{EntityId, WriteTransaction};
use serde_json::Value;
use tracing::{debug, warn};

/// What a repair changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Entity re-keyed in its own store (0 or 1).
    pub self_repaired: usize,
    /// Dependent-store documents whose foreign key was rewritten.
    pub dependents_repaired: usize,
    /// Outbox adjustments: subject IDs (with the payload's own key),
    /// dependency descriptors and payload foreign keys.
    pub outbox_repaired: usize,
}

impl RepairReport {
    /// Total number of mutations.
    #[must_use]
    pub fn repaired_count(&self) -> usize {
        self.self_repaired + self.dependents_repaired + self.outbox_repaired
    }
}

pub(crate) struct Repairer<'r> {
    pub(crate) config: &'r MapperConfig,
    pub(crate) registry: &'r FkRegistry,
}

impl Repairer<'_> {
    pub(crate) fn repair(
        &self,
        txn: &mut WriteTransaction<'_>,
        entity_type: &str,
        temp_id: &str,
        server_id: &EntityId,
    ) -> ReconcileResult<RepairReport> {
        let report = RepairReport {
            self_repaired: self.repair_self(txn, entity_type, temp_id, server_id)?,
            dependents_repaired: self.repair_dependents(txn, entity_type, temp_id, server_id)?,
            outbox_repaired: self.repair_outbox(txn, entity_type, temp_id, server_id)?,
        };

        debug!(
            entity_type,
            temp_id,
            server_id = %server_id,
            self_repaired = report.self_repaired,
            dependents_repaired = report.dependents_repaired,
            outbox_repaired = report.outbox_repaired,
            "references repaired"
        );
        Ok(report)
    }

    /// Moves the entity from its temporary key to its server key.
    fn repair_self(
        &self,
        txn: &mut WriteTransaction<'_>,
        entity_type: &str,
        temp_id: &str,
        server_id: &EntityId,
    ) -> ReconcileResult<usize> {
        if !txn.has_collection(entity_type) {
            debug!(entity_type, "no local store for entity type, skipping self-repair");
            return Ok(0);
        }

        let temp_key = EntityId::from(temp_id);
        let Some(mut doc) = txn.get(entity_type, &temp_key)? else {
            return Ok(0);
        };

        let key_field = txn.spec(entity_type)?.key_field;
        doc.insert(key_field, server_id.to_value());
        if doc.contains_key(&self.config.modified_flag_field) {
            doc.insert(self.config.modified_flag_field.clone(), Value::Bool(false));
        }

        if txn.get(entity_type, server_id)?.is_some() {
            debug!(
                entity_type,
                server_id = %server_id,
                "server copy already present, local version replaces it"
            );
        }

        txn.put(entity_type, doc)?;
        txn.delete(entity_type, &temp_key)?;
        Ok(1)
    }

    /// Rewrites every registered foreign key that holds the temporary ID.
    fn repair_dependents(
        &self,
        txn: &mut WriteTransaction<'_>,
        entity_type: &str,
        temp_id: &str,
        server_id: &EntityId,
    ) -> ReconcileResult<usize> {
        let temp_value = Value::String(temp_id.to_owned());
        let server_value = server_id.to_value();
        let mut repaired = 0;
        let mut any_registered = false;

        for fk in self.registry.references_to(entity_type) {
            any_registered = true;
            for store in &fk.dependent_stores {
                for mut doc in txn.find_by(store, &fk.field, &temp_value)? {
                    doc.insert(fk.field.clone(), server_value.clone());
                    txn.put(store, doc)?;
                    repaired += 1;
                }
            }
        }

        if !any_registered {
            warn!(
                entity_type,
                temp_id, "no foreign keys registered for entity type; references are not repaired"
            );
        }
        Ok(repaired)
    }

    /// Updates outbox subjects, dependency descriptors and payloads.
    fn repair_outbox(
        &self,
        txn: &mut WriteTransaction<'_>,
        entity_type: &str,
        temp_id: &str,
        server_id: &EntityId,
    ) -> ReconcileResult<usize> {
        let collection = self.config.outbox_collection.as_str();
        let temp_value = Value::String(temp_id.to_owned());
        let server_value = server_id.to_value();
        let mut repaired = 0;

        for doc in txn.find_by(collection, outbox::ENTITY_ID_FIELD, &temp_value)? {
            let mut entry = outbox::OutboxEntry::from_document(collection, doc)?;
            if entry.entity_type != entity_type {
                continue;
            }
            entry.entity_id = server_id.clone();
            outbox::rewrite_payload_key(txn, &mut entry, temp_id, server_id)?;
            outbox::save(txn, collection, &entry)?;
            repaired += 1;
        }

        for mut entry in outbox::load_pending(&*txn, collection)? {
            let mut changed = 0;

            for dep in &mut entry.dependencies {
                if !dep.resolved && dep.refers_to(entity_type, temp_id) {
                    dep.resolved = true;
                    dep.server_id = Some(server_id.clone());
                    changed += 1;
                }
            }

            for fk in self.registry.references_to(entity_type) {
                if !fk.dependent_stores.contains(&entry.entity_type) {
                    continue;
                }
                if entry.payload.get(&fk.field) == Some(&temp_value) {
                    entry.payload.insert(fk.field.clone(), server_value.clone());
                    changed += 1;
                }
            }

            if changed > 0 {
                outbox::save(txn, collection, &entry)?;
                repaired += changed;
            }
        }

        Ok(repaired)
    }
}
