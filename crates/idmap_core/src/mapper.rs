//! The reconciliation service.

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::config::MapperConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::mapping::{self, MappingRecord};
use crate::outbox::{self, Outbox, OutboxEntry};
use crate::registry::FkRegistry;
use crate::repair::{RepairReport, Repairer};
use idmap_docstore::{Document, DocumentStore, EntityId, WriteTransaction};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counters for reconciliation activity since the mapper was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Mapping records inserted.
    pub mappings_added: u64,
    /// `add_mapping` calls that found an existing record.
    pub duplicate_mappings: u64,
    /// Repair runs completed.
    pub repairs: u64,
    /// Records mutated across all repairs.
    pub records_repaired: u64,
    /// Mapping records removed by retention sweeps.
    pub mappings_purged: u64,
}

/// A document field still holding a temporary ID that already has a
/// server ID. Usually means the foreign-key registry is incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    /// Collection holding the document.
    pub collection: String,
    /// Key of the document.
    pub key: EntityId,
    /// Field holding the stale ID.
    pub field: String,
    /// The stale temporary ID.
    pub temp_id: String,
    /// Entity type the temporary ID was mapped under.
    pub entity_type: String,
    /// Server ID it maps to.
    pub server_id: EntityId,
}

/// Resolves temporary IDs to server IDs and repairs every reference.
///
/// The mapper owns two collections in the document store (mappings and
/// outbox) and reads and writes the entity stores named by its
/// [`FkRegistry`]. All writes go through the store's exclusive write
/// transaction, so repairs never interleave.
///
/// # Example
///
/// ```rust
/// use idmap_core::{FkRegistry, IdMapper, MapperConfig};
/// use idmap_docstore::{CollectionSpec, DocumentStore, EntityId};
/// use std::sync::Arc;
///
/// let store = Arc::new(DocumentStore::open_in_memory().unwrap());
/// for name in ["participants", "attendance"] {
///     store.create_collection(CollectionSpec::new(name, "id")).unwrap();
/// }
/// let registry = FkRegistry::new()
///     .with_foreign_key("participant_id", "participants", ["attendance"]);
/// let mapper = IdMapper::open(store, registry, MapperConfig::default()).unwrap();
///
/// let report = mapper
///     .complete_sync("participants", "temp_abc", EntityId::Int(42))
///     .unwrap();
/// assert_eq!(report.repaired_count(), 0);
/// assert_eq!(
///     mapper.resolve_id("participants", &EntityId::from("temp_abc")).unwrap(),
///     EntityId::Int(42)
/// );
/// ```
pub struct IdMapper {
    pub(crate) store: Arc<DocumentStore>,
    pub(crate) registry: FkRegistry,
    pub(crate) config: MapperConfig,
    pub(crate) clock: Arc<dyn Clock>,
    stats: RwLock<ReconcileStats>,
}

impl IdMapper {
    /// Opens the mapper over a document store.
    ///
    /// Creates the mapping and outbox collections if missing, then checks
    /// that every store the registry names exists.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidRegistry`] for a malformed
    /// registry and [`ReconcileError::UnknownStore`] for a registry entry
    /// naming a store that does not exist.
    pub fn open(
        store: Arc<DocumentStore>,
        registry: FkRegistry,
        config: MapperConfig,
    ) -> ReconcileResult<Self> {
        registry.validate()?;

        store.ensure_collection(mapping::collection_spec(&config.mapping_collection))?;
        store.ensure_collection(outbox::collection_spec(&config.outbox_collection))?;
        store.ensure_collection(outbox::sequence_collection_spec(&config.outbox_collection))?;

        for fk in registry.iter() {
            if !store.has_collection(&fk.referenced_entity_type) {
                return Err(ReconcileError::unknown_store(
                    &fk.referenced_entity_type,
                    format!("registry field `{}`", fk.field),
                ));
            }
            for dependent in &fk.dependent_stores {
                if !store.has_collection(dependent) {
                    return Err(ReconcileError::unknown_store(
                        dependent,
                        format!("registry field `{}`", fk.field),
                    ));
                }
            }
        }

        info!(
            foreign_keys = registry.len(),
            mapping_collection = %config.mapping_collection,
            outbox_collection = %config.outbox_collection,
            "id mapper opened"
        );

        Ok(Self {
            store,
            registry,
            config,
            clock: Arc::new(SystemClock),
            stats: RwLock::new(ReconcileStats::default()),
        })
    }

    /// Replaces the time source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Returns the foreign-key registry.
    #[must_use]
    pub fn registry(&self) -> &FkRegistry {
        &self.registry
    }

    /// Returns the underlying document store.
    #[must_use]
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Returns activity counters.
    #[must_use]
    pub fn stats(&self) -> ReconcileStats {
        self.stats.read().clone()
    }

    /// Returns a handle to the outbox.
    #[must_use]
    pub fn outbox(&self) -> Outbox<'_> {
        Outbox::new(self)
    }

    /// Generates a fresh temporary ID.
    #[must_use]
    pub fn generate_temp_id(&self) -> String {
        format!("{}{}", self.config.temp_prefix, Uuid::new_v4().simple())
    }

    /// Returns true if `id` is a temporary ID.
    #[must_use]
    pub fn is_temp_id(&self, id: &EntityId) -> bool {
        self.config.is_temporary(id)
    }

    /// Records that `temp_id` of `entity_type` is now `server_id`.
    ///
    /// Idempotent: if a record for `(entity_type, temp_id)` exists nothing
    /// is written, even if it names a different server ID.
    pub fn add_mapping(
        &self,
        entity_type: &str,
        temp_id: &str,
        server_id: EntityId,
    ) -> ReconcileResult<()> {
        let added = self
            .store
            .write_transaction(|txn| self.add_mapping_in(txn, entity_type, temp_id, &server_id))?;
        self.record_mapping(added);
        Ok(())
    }

    /// Looks up the server ID for a temporary ID.
    pub fn get_server_id(
        &self,
        entity_type: &str,
        temp_id: &str,
    ) -> ReconcileResult<Option<EntityId>> {
        Ok(mapping::find_by_temp(
            &*self.store,
            &self.config.mapping_collection,
            entity_type,
            temp_id,
        )?
        .map(|record| record.server_id))
    }

    /// Looks up the temporary ID a server ID replaced, if any.
    pub fn get_temp_id(
        &self,
        entity_type: &str,
        server_id: &EntityId,
    ) -> ReconcileResult<Option<String>> {
        Ok(mapping::find_by_server(
            &*self.store,
            &self.config.mapping_collection,
            entity_type,
            server_id,
        )?
        .map(|record| record.temp_id))
    }

    /// Translates `id` to its current server form.
    ///
    /// Permanent IDs are returned unchanged without touching the store.
    /// A temporary ID with no mapping yet is also returned unchanged:
    /// callers treat that as "not yet resolvable".
    pub fn resolve_id(&self, entity_type: &str, id: &EntityId) -> ReconcileResult<EntityId> {
        let Some(temp_id) = id.as_text().filter(|s| self.config.is_temporary_str(s)) else {
            return Ok(id.clone());
        };
        Ok(self
            .get_server_id(entity_type, temp_id)?
            .unwrap_or_else(|| id.clone()))
    }

    /// Resolves every registered foreign key in a document of
    /// `entity_type`, typically right before upload.
    pub fn resolve_document(
        &self,
        entity_type: &str,
        document: &Document,
    ) -> ReconcileResult<Document> {
        let mut resolved = document.clone();
        for fk in self.registry.fields_in(entity_type) {
            let Some(current) = document.get(&fk.field).and_then(EntityId::from_value) else {
                continue;
            };
            let server = self.resolve_id(&fk.referenced_entity_type, &current)?;
            if server != current {
                resolved.insert(fk.field.clone(), server.to_value());
            }
        }
        Ok(resolved)
    }

    /// Rewrites the entity's own key, every registered foreign key and the
    /// outbox from `temp_id` to `server_id`, atomically.
    ///
    /// Safe to re-run: a second call with the same arguments rewrites
    /// nothing and reports a zero count.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails; nothing is committed then and
    /// the caller should retry.
    pub fn repair_references(
        &self,
        entity_type: &str,
        temp_id: &str,
        server_id: EntityId,
    ) -> ReconcileResult<RepairReport> {
        let report = self.store.write_transaction(|txn| {
            self.repairer().repair(txn, entity_type, temp_id, &server_id)
        })?;
        self.record_repair(&report);
        Ok(report)
    }

    /// Records the mapping and repairs all references in one transaction.
    ///
    /// This is what a sync engine calls when the server answers an upload
    /// of an offline-created entity.
    pub fn complete_sync(
        &self,
        entity_type: &str,
        temp_id: &str,
        server_id: EntityId,
    ) -> ReconcileResult<RepairReport> {
        let (added, report) = self.store.write_transaction(|txn| {
            let added = self.add_mapping_in(txn, entity_type, temp_id, &server_id)?;
            let report = self.repairer().repair(txn, entity_type, temp_id, &server_id)?;
            Ok::<_, ReconcileError>((added, report))
        })?;
        self.record_mapping(added);
        self.record_repair(&report);
        info!(
            entity_type,
            temp_id,
            server_id = %server_id,
            repaired = report.repaired_count(),
            "offline entity reconciled"
        );
        Ok(report)
    }

    /// Deletes mappings synced more than `max_age` ago.
    ///
    /// With the cross-check enabled (the default), a mapping whose
    /// temporary ID still appears in a pending outbox entry is kept.
    /// Returns the number of records deleted.
    pub fn purge_old_mappings(&self, max_age: Duration) -> ReconcileResult<usize> {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_millis(max_age));
        let mappings = self.config.mapping_collection.as_str();
        let outbox_collection = self.config.outbox_collection.as_str();

        let (purged, retained) = self.store.write_transaction(|txn| {
            let protected = if self.config.retention_cross_check {
                pending_temp_refs(&*txn, outbox_collection)?
            } else {
                HashSet::new()
            };

            let mut purged = 0usize;
            let mut retained = 0usize;
            for doc in txn.scan(mappings)? {
                let record = MappingRecord::from_document(mappings, doc)?;
                if record.synced_at >= cutoff {
                    continue;
                }
                if protected.contains(&(record.entity_type.clone(), record.temp_id.clone())) {
                    retained += 1;
                    continue;
                }
                txn.delete(mappings, &record.key())?;
                purged += 1;
            }
            Ok::<_, ReconcileError>((purged, retained))
        })?;

        if retained > 0 {
            warn!(
                retained,
                "expired mappings kept because pending outbox entries still reference them"
            );
        }
        self.stats.write().mappings_purged += purged as u64;
        info!(purged, cutoff, "mapping retention sweep finished");
        Ok(purged)
    }

    /// Purges mappings older than the configured retention window.
    pub fn purge_expired_mappings(&self) -> ReconcileResult<usize> {
        self.purge_old_mappings(self.config.retention)
    }

    /// Returns every mapping record, ordered by `(entity_type, temp_id)`.
    pub fn get_all_mappings(&self) -> ReconcileResult<Vec<MappingRecord>> {
        let mappings = self.config.mapping_collection.as_str();
        let mut records = self
            .store
            .scan(mappings)?
            .into_iter()
            .map(|doc| MappingRecord::from_document(mappings, doc))
            .collect::<ReconcileResult<Vec<_>>>()?;
        records.sort_by(|a, b| {
            (a.entity_type.as_str(), a.temp_id.as_str()).cmp(&(b.entity_type.as_str(), b.temp_id.as_str()))
        });
        Ok(records)
    }

    /// Finds fields that still hold a temporary ID which already has a
    /// mapping.
    ///
    /// Scans every top-level field of every entity store, plus the
    /// subject and unresolved dependencies of pending outbox entries.
    pub fn find_dangling_references(&self) -> ReconcileResult<Vec<DanglingReference>> {
        let mappings = self.config.mapping_collection.as_str();
        let outbox_collection = self.config.outbox_collection.as_str();
        let sequences = outbox::sequence_collection(outbox_collection);
        let mut dangling = Vec::new();

        for collection in self.store.collection_names() {
            if collection == mappings || collection == outbox_collection || collection == sequences {
                continue;
            }
            let key_field = self.store.spec(&collection)?.key_field;
            for doc in self.store.scan(&collection)? {
                let Some(key) = doc.get(&key_field).and_then(EntityId::from_value) else {
                    continue;
                };
                for (field, value) in &doc {
                    let Value::String(candidate) = value else {
                        continue;
                    };
                    if !self.config.is_temporary_str(candidate) {
                        continue;
                    }
                    for record in mapping::find_any_by_temp(&*self.store, mappings, candidate)? {
                        dangling.push(DanglingReference {
                            collection: collection.clone(),
                            key: key.clone(),
                            field: field.clone(),
                            temp_id: candidate.clone(),
                            entity_type: record.entity_type,
                            server_id: record.server_id,
                        });
                    }
                }
            }
        }

        for entry in outbox::load_pending(&*self.store, outbox_collection)? {
            if let Some(temp) = entry.entity_id.as_text() {
                if let Some(server_id) = self.get_server_id(&entry.entity_type, temp)? {
                    dangling.push(DanglingReference {
                        collection: outbox_collection.to_owned(),
                        key: entry.key(),
                        field: outbox::ENTITY_ID_FIELD.to_owned(),
                        temp_id: temp.to_owned(),
                        entity_type: entry.entity_type.clone(),
                        server_id,
                    });
                }
            }
            for dep in entry.dependencies.iter().filter(|d| !d.resolved) {
                if let Some(server_id) = self.get_server_id(&dep.entity_type, &dep.temp_id)? {
                    dangling.push(DanglingReference {
                        collection: outbox_collection.to_owned(),
                        key: entry.key(),
                        field: "dependencies".to_owned(),
                        temp_id: dep.temp_id.clone(),
                        entity_type: dep.entity_type.clone(),
                        server_id,
                    });
                }
            }
        }

        if !dangling.is_empty() {
            warn!(
                count = dangling.len(),
                "temporary IDs with known server IDs are still referenced"
            );
        }
        Ok(dangling)
    }

    fn repairer(&self) -> Repairer<'_> {
        Repairer {
            config: &self.config,
            registry: &self.registry,
        }
    }

    /// Inserts a mapping inside `txn`. Returns true if a record was added.
    fn add_mapping_in(
        &self,
        txn: &mut WriteTransaction<'_>,
        entity_type: &str,
        temp_id: &str,
        server_id: &EntityId,
    ) -> ReconcileResult<bool> {
        let mappings = self.config.mapping_collection.as_str();

        if !self.config.is_temporary_str(temp_id) {
            warn!(
                entity_type,
                temp_id, "mapping recorded for an id without the temporary prefix"
            );
        }

        if let Some(existing) = mapping::find_by_temp(&*txn, mappings, entity_type, temp_id)? {
            if existing.server_id == *server_id {
                debug!(entity_type, temp_id, "mapping already recorded");
            } else {
                warn!(
                    entity_type,
                    temp_id,
                    existing = %existing.server_id,
                    requested = %server_id,
                    "mapping already recorded with a different server id, keeping the original"
                );
            }
            return Ok(false);
        }

        let now = self.clock.now_millis();
        let record = MappingRecord {
            entity_type: entity_type.to_owned(),
            temp_id: temp_id.to_owned(),
            server_id: server_id.clone(),
            created_at: now,
            synced_at: now,
        };
        txn.put(mappings, record.to_document()?)?;
        debug!(entity_type, temp_id, server_id = %server_id, "mapping recorded");
        Ok(true)
    }

    fn record_mapping(&self, added: bool) {
        let mut stats = self.stats.write();
        if added {
            stats.mappings_added += 1;
        } else {
            stats.duplicate_mappings += 1;
        }
    }

    fn record_repair(&self, report: &RepairReport) {
        let mut stats = self.stats.write();
        stats.repairs += 1;
        stats.records_repaired += report.repaired_count() as u64;
    }
}

impl std::fmt::Debug for IdMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdMapper")
            .field("config", &self.config)
            .field("foreign_keys", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// `(entity_type, temp_id)` pairs still referenced by pending outbox
/// entries, either as the subject or as a dependency.
fn pending_temp_refs(
    reader: &impl idmap_docstore::DocumentRead,
    outbox_collection: &str,
) -> ReconcileResult<HashSet<(String, String)>> {
    let mut refs = HashSet::new();
    for entry in outbox::load_pending(reader, outbox_collection)? {
        let OutboxEntry {
            entity_type,
            entity_id,
            dependencies,
            ..
        } = entry;
        if let EntityId::Text(temp) = entity_id {
            refs.insert((entity_type, temp));
        }
        for dep in dependencies {
            refs.insert((dep.entity_type, dep.temp_id));
        }
    }
    Ok(refs)
}
