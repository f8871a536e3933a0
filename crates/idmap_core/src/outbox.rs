//! The outbox: pending mutations awaiting upload.
//!
//! Entries created offline may depend on other entities that only have
//! temporary IDs so far. Such an entry stays out of [`Outbox::ready`]
//! until every dependency has been resolved by the repairer.

use crate::error::{ReconcileError, ReconcileResult};
use crate::mapper::IdMapper;
use crate::mapping;
use idmap_docstore::{CollectionSpec, Document, DocumentRead, EntityId, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub(crate) const KEY_FIELD: &str = "local_id";
pub(crate) const ENTITY_ID_FIELD: &str = "entity_id";
pub(crate) const STATUS_FIELD: &str = "status";

/// Lifecycle of an outbox entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting to be sent.
    Pending,
    /// Handed to the transport.
    Syncing,
    /// Acknowledged by the server.
    Synced,
    /// The last attempt failed.
    Failed,
}

/// Kind of mutation an entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOperation {
    /// Entity created locally.
    Create,
    /// Entity updated locally.
    Update,
    /// Entity deleted locally.
    Delete,
}

/// Another not-yet-synced entity an entry depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Entity type of the dependency.
    pub entity_type: String,
    /// Its temporary ID.
    pub temp_id: String,
    /// Whether the temporary ID has been mapped.
    pub resolved: bool,
    /// Server ID, once resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<EntityId>,
}

impl Dependency {
    /// Creates an unresolved dependency.
    pub fn new(entity_type: impl Into<String>, temp_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            temp_id: temp_id.into(),
            resolved: false,
            server_id: None,
        }
    }

    /// Returns true if this descriptor refers to `(entity_type, temp_id)`.
    #[must_use]
    pub fn refers_to(&self, entity_type: &str, temp_id: &str) -> bool {
        self.entity_type == entity_type && self.temp_id == temp_id
    }
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Local queue position, assigned on enqueue.
    pub local_id: u64,
    /// Entity type (store name) of the subject.
    pub entity_type: String,
    /// Subject entity ID; temporary until the subject is synced.
    pub entity_id: EntityId,
    /// Mutation kind.
    pub operation: OutboxOperation,
    /// Lifecycle status.
    pub status: OutboxStatus,
    /// Entities this mutation waits on.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Entity data to upload.
    #[serde(default)]
    pub payload: Document,
    /// Enqueue time, in Unix milliseconds.
    pub created_at: u64,
    /// Number of send attempts.
    #[serde(default)]
    pub attempts: u32,
    /// Error from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// Creates an entry for `entity_id` with an empty payload.
    ///
    /// `local_id`, `status` and `created_at` are filled in by
    /// [`Outbox::enqueue`].
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<EntityId>,
        operation: OutboxOperation,
    ) -> Self {
        Self {
            local_id: 0,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            status: OutboxStatus::Pending,
            dependencies: Vec::new(),
            payload: Document::new(),
            created_at: 0,
            attempts: 0,
            last_error: None,
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Document) -> Self {
        self.payload = payload;
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Returns true if any dependency is still unresolved.
    #[must_use]
    pub fn has_unresolved_dependencies(&self) -> bool {
        self.dependencies.iter().any(|d| !d.resolved)
    }

    /// Returns true if the entry may be transmitted now.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == OutboxStatus::Pending && !self.has_unresolved_dependencies()
    }

    pub(crate) fn key(&self) -> EntityId {
        EntityId::Int(self.local_id as i64)
    }

    pub(crate) fn to_document(&self) -> ReconcileResult<Document> {
        match serde_json::to_value(self)? {
            Value::Object(doc) => Ok(doc),
            _ => Err(ReconcileError::invalid_record(
                &self.entity_type,
                "outbox entry did not serialize to an object",
            )),
        }
    }

    pub(crate) fn from_document(collection: &str, doc: Document) -> ReconcileResult<Self> {
        serde_json::from_value(Value::Object(doc))
            .map_err(|e| ReconcileError::invalid_record(collection, e.to_string()))
    }
}

pub(crate) fn collection_spec(name: &str) -> CollectionSpec {
    CollectionSpec::new(name, KEY_FIELD)
        .with_index(ENTITY_ID_FIELD)
        .with_index(STATUS_FIELD)
}

const SEQUENCE_NAME_FIELD: &str = "name";
const SEQUENCE_LAST_FIELD: &str = "last";

/// Collection holding the local ID counter of the outbox `name`.
pub(crate) fn sequence_collection(name: &str) -> String {
    format!("{name}_sequence")
}

pub(crate) fn sequence_collection_spec(name: &str) -> CollectionSpec {
    CollectionSpec::new(sequence_collection(name), SEQUENCE_NAME_FIELD)
}

/// Bumps the persisted counter and returns the next local ID.
///
/// IDs are never reused, even after the newest entries are removed.
fn next_local_id(txn: &mut WriteTransaction<'_>, collection: &str) -> ReconcileResult<u64> {
    let sequences = sequence_collection(collection);
    let counter = EntityId::from(KEY_FIELD);
    let last = match txn.get(&sequences, &counter)? {
        Some(doc) => doc
            .get(SEQUENCE_LAST_FIELD)
            .and_then(Value::as_u64)
            .ok_or_else(|| ReconcileError::invalid_record(&sequences, "counter without `last`"))?,
        // journals written before the counter existed
        None => load_all(&*txn, collection)?
            .iter()
            .map(|e| e.local_id)
            .max()
            .unwrap_or(0),
    };

    let next = last + 1;
    let mut doc = Document::new();
    doc.insert(SEQUENCE_NAME_FIELD.into(), counter.to_value());
    doc.insert(SEQUENCE_LAST_FIELD.into(), Value::from(next));
    txn.put(&sequences, doc)?;
    Ok(next)
}

/// Replaces the subject's temporary key inside the payload. Returns true
/// if the payload changed.
pub(crate) fn rewrite_payload_key(
    txn: &WriteTransaction<'_>,
    entry: &mut OutboxEntry,
    temp_id: &str,
    server_id: &EntityId,
) -> ReconcileResult<bool> {
    if !txn.has_collection(&entry.entity_type) {
        return Ok(false);
    }
    let key_field = txn.spec(&entry.entity_type)?.key_field;
    if entry.payload.get(&key_field).and_then(Value::as_str) != Some(temp_id) {
        return Ok(false);
    }
    entry.payload.insert(key_field, server_id.to_value());
    Ok(true)
}

/// Applies every mapping already known to `entry`: the subject ID and its
/// payload key, explicit dependencies and registered payload foreign keys.
/// Payload foreign keys without a mapping become dependencies.
fn resolve_known_ids(
    mapper: &IdMapper,
    txn: &WriteTransaction<'_>,
    entry: &mut OutboxEntry,
) -> ReconcileResult<()> {
    let mappings = mapper.config.mapping_collection.as_str();

    if let Some(temp) = entry
        .entity_id
        .as_text()
        .filter(|s| mapper.config.is_temporary_str(s))
        .map(str::to_owned)
    {
        if let Some(record) = mapping::find_by_temp(txn, mappings, &entry.entity_type, &temp)? {
            rewrite_payload_key(txn, entry, &temp, &record.server_id)?;
            entry.entity_id = record.server_id;
        }
    }

    for dep in entry.dependencies.iter_mut().filter(|d| !d.resolved) {
        if let Some(record) = mapping::find_by_temp(txn, mappings, &dep.entity_type, &dep.temp_id)? {
            dep.resolved = true;
            dep.server_id = Some(record.server_id);
        }
    }

    for fk in mapper.registry.fields_in(&entry.entity_type) {
        let Some(Value::String(value)) = entry.payload.get(&fk.field) else {
            continue;
        };
        if !mapper.config.is_temporary_str(value) {
            continue;
        }
        let temp = value.clone();
        match mapping::find_by_temp(txn, mappings, &fk.referenced_entity_type, &temp)? {
            Some(record) => {
                entry.payload.insert(fk.field.clone(), record.server_id.to_value());
            }
            None => {
                if !entry
                    .dependencies
                    .iter()
                    .any(|d| d.refers_to(&fk.referenced_entity_type, &temp))
                {
                    entry
                        .dependencies
                        .push(Dependency::new(fk.referenced_entity_type.clone(), temp));
                }
            }
        }
    }
    Ok(())
}

fn load_one(
    txn: &WriteTransaction<'_>,
    collection: &str,
    local_id: u64,
) -> ReconcileResult<OutboxEntry> {
    let doc = txn
        .get(collection, &EntityId::Int(local_id as i64))?
        .ok_or(ReconcileError::OutboxEntryNotFound { local_id })?;
    OutboxEntry::from_document(collection, doc)
}

pub(crate) fn load_all(
    reader: &impl DocumentRead,
    collection: &str,
) -> ReconcileResult<Vec<OutboxEntry>> {
    reader
        .scan_documents(collection)?
        .into_iter()
        .map(|doc| OutboxEntry::from_document(collection, doc))
        .collect()
}

pub(crate) fn load_pending(
    reader: &impl DocumentRead,
    collection: &str,
) -> ReconcileResult<Vec<OutboxEntry>> {
    let status = serde_json::to_value(OutboxStatus::Pending)?;
    reader
        .find_documents(collection, STATUS_FIELD, &status)?
        .into_iter()
        .map(|doc| OutboxEntry::from_document(collection, doc))
        .collect()
}

pub(crate) fn save(
    txn: &mut WriteTransaction<'_>,
    collection: &str,
    entry: &OutboxEntry,
) -> ReconcileResult<()> {
    txn.put(collection, entry.to_document()?)?;
    Ok(())
}

/// Handle to the outbox collection of an [`IdMapper`].
#[derive(Debug, Clone, Copy)]
pub struct Outbox<'m> {
    mapper: &'m IdMapper,
}

impl<'m> Outbox<'m> {
    pub(crate) fn new(mapper: &'m IdMapper) -> Self {
        Self { mapper }
    }

    fn collection(&self) -> &'m str {
        &self.mapper.config.outbox_collection
    }

    /// Queues a mutation and returns its local ID.
    ///
    /// Registered foreign-key fields in the payload that hold temporary
    /// IDs are resolved when a mapping already exists, and otherwise
    /// recorded as dependencies. A temporary subject ID or explicit
    /// dependency that has already been mapped is resolved right away.
    pub fn enqueue(&self, mut entry: OutboxEntry) -> ReconcileResult<u64> {
        let mapper = self.mapper;
        let collection = self.collection();

        mapper.store.write_transaction(|txn| {
            let local_id = next_local_id(txn, collection)?;
            resolve_known_ids(mapper, txn, &mut entry)?;

            entry.local_id = local_id;
            entry.status = OutboxStatus::Pending;
            entry.created_at = mapper.clock.now_millis();
            save(txn, collection, &entry)?;

            debug!(
                local_id,
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                dependencies = entry.dependencies.len(),
                "outbox entry queued"
            );
            Ok(local_id)
        })
    }

    /// Gets an entry by local ID.
    pub fn get(&self, local_id: u64) -> ReconcileResult<Option<OutboxEntry>> {
        let collection = self.collection();
        self.mapper
            .store
            .get(collection, &EntityId::Int(local_id as i64))?
            .map(|doc| OutboxEntry::from_document(collection, doc))
            .transpose()
    }

    /// All entries, ordered by local ID.
    pub fn entries(&self) -> ReconcileResult<Vec<OutboxEntry>> {
        load_all(&*self.mapper.store, self.collection())
    }

    /// Entries in `pending` status, ordered by local ID.
    pub fn pending(&self) -> ReconcileResult<Vec<OutboxEntry>> {
        load_pending(&*self.mapper.store, self.collection())
    }

    /// Pending entries with every dependency resolved, in queue order.
    pub fn ready(&self) -> ReconcileResult<Vec<OutboxEntry>> {
        Ok(self
            .pending()?
            .into_iter()
            .filter(OutboxEntry::is_ready)
            .collect())
    }

    /// Marks an entry as handed to the transport and counts the attempt.
    pub fn mark_syncing(&self, local_id: u64) -> ReconcileResult<OutboxEntry> {
        self.update(local_id, |entry| {
            entry.status = OutboxStatus::Syncing;
            entry.attempts += 1;
        })
    }

    /// Marks an entry as acknowledged by the server.
    pub fn mark_synced(&self, local_id: u64) -> ReconcileResult<OutboxEntry> {
        self.update(local_id, |entry| {
            entry.status = OutboxStatus::Synced;
            entry.last_error = None;
        })
    }

    /// Marks an entry as failed with the transport's error.
    pub fn mark_failed(&self, local_id: u64, error: impl Into<String>) -> ReconcileResult<OutboxEntry> {
        let error = error.into();
        self.update(local_id, move |entry| {
            entry.status = OutboxStatus::Failed;
            entry.last_error = Some(error);
        })
    }

    /// Puts a failed or in-flight entry back into `pending`.
    ///
    /// Repairs only touch dependencies of pending entries, so IDs mapped
    /// while the entry was away are resolved here.
    pub fn requeue(&self, local_id: u64) -> ReconcileResult<OutboxEntry> {
        let mapper = self.mapper;
        let collection = self.collection();
        mapper.store.write_transaction(|txn| {
            let mut entry = load_one(txn, collection, local_id)?;
            entry.status = OutboxStatus::Pending;
            resolve_known_ids(mapper, txn, &mut entry)?;
            save(txn, collection, &entry)?;
            Ok(entry)
        })
    }

    /// Removes an entry. Returns true if it existed.
    pub fn remove(&self, local_id: u64) -> ReconcileResult<bool> {
        Ok(self
            .mapper
            .store
            .delete(self.collection(), &EntityId::Int(local_id as i64))?)
    }

    /// Removes every `synced` entry. Returns how many were removed.
    pub fn clear_synced(&self) -> ReconcileResult<usize> {
        let collection = self.collection();
        self.mapper.store.write_transaction(|txn| {
            let synced: Vec<_> = load_all(&*txn, collection)?
                .into_iter()
                .filter(|e| e.status == OutboxStatus::Synced)
                .collect();
            for entry in &synced {
                txn.delete(collection, &entry.key())?;
            }
            Ok(synced.len())
        })
    }

    fn update(
        &self,
        local_id: u64,
        change: impl FnOnce(&mut OutboxEntry),
    ) -> ReconcileResult<OutboxEntry> {
        let collection = self.collection();
        self.mapper.store.write_transaction(|txn| {
            let mut entry = load_one(txn, collection, local_id)?;
            change(&mut entry);
            save(txn, collection, &entry)?;
            Ok(entry)
        })
    }
}
