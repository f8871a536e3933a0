//! Mapping records and their persisted form.

use crate::error::{ReconcileError, ReconcileResult};
use idmap_docstore::{CollectionSpec, Document, DocumentRead, EntityId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Primary key field of the mapping collection.
pub(crate) const KEY_FIELD: &str = "key";
pub(crate) const TEMP_ID_FIELD: &str = "temp_id";
pub(crate) const SERVER_ID_FIELD: &str = "server_id";

/// A resolved temporary ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRecord {
    /// Entity type (store name) of the mapped entity.
    pub entity_type: String,
    /// Client-generated temporary ID.
    pub temp_id: String,
    /// Server-assigned permanent ID.
    pub server_id: EntityId,
    /// When the record was created, in Unix milliseconds.
    pub created_at: u64,
    /// When the entity was synced, in Unix milliseconds.
    pub synced_at: u64,
}

impl MappingRecord {
    /// Primary key of the record: one record per `(entity_type, temp_id)`.
    #[must_use]
    pub fn key(&self) -> EntityId {
        mapping_key(&self.entity_type, &self.temp_id)
    }

    pub(crate) fn to_document(&self) -> ReconcileResult<Document> {
        let Value::Object(mut doc) = serde_json::to_value(self)? else {
            return Err(ReconcileError::invalid_record(
                &self.entity_type,
                "mapping record did not serialize to an object",
            ));
        };
        doc.insert(KEY_FIELD.into(), self.key().to_value());
        Ok(doc)
    }

    pub(crate) fn from_document(collection: &str, doc: Document) -> ReconcileResult<Self> {
        serde_json::from_value(Value::Object(doc))
            .map_err(|e| ReconcileError::invalid_record(collection, e.to_string()))
    }
}

/// `"{len(entity_type)}:{entity_type}/{temp_id}"`. The length prefix keeps
/// keys unique when either part contains `/`.
pub(crate) fn mapping_key(entity_type: &str, temp_id: &str) -> EntityId {
    EntityId::Text(format!("{}:{entity_type}/{temp_id}", entity_type.len()))
}

pub(crate) fn collection_spec(name: &str) -> CollectionSpec {
    CollectionSpec::new(name, KEY_FIELD)
        .with_index(TEMP_ID_FIELD)
        .with_index(SERVER_ID_FIELD)
}

/// Point lookup by `(entity_type, temp_id)`.
pub(crate) fn find_by_temp(
    reader: &impl DocumentRead,
    collection: &str,
    entity_type: &str,
    temp_id: &str,
) -> ReconcileResult<Option<MappingRecord>> {
    let Some(doc) = reader.get_document(collection, &mapping_key(entity_type, temp_id))? else {
        return Ok(None);
    };
    let record = MappingRecord::from_document(collection, doc)?;
    if record.entity_type != entity_type || record.temp_id != temp_id {
        return Err(ReconcileError::invalid_record(
            collection,
            format!(
                "record under key for ({entity_type}, {temp_id}) belongs to ({}, {})",
                record.entity_type, record.temp_id
            ),
        ));
    }
    Ok(Some(record))
}

/// Reverse lookup by `(entity_type, server_id)`.
pub(crate) fn find_by_server(
    reader: &impl DocumentRead,
    collection: &str,
    entity_type: &str,
    server_id: &EntityId,
) -> ReconcileResult<Option<MappingRecord>> {
    for doc in reader.find_documents(collection, SERVER_ID_FIELD, &server_id.to_value())? {
        let record = MappingRecord::from_document(collection, doc)?;
        if record.entity_type == entity_type {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

/// Every mapping of `temp_id`, across entity types.
pub(crate) fn find_any_by_temp(
    reader: &impl DocumentRead,
    collection: &str,
    temp_id: &str,
) -> ReconcileResult<Vec<MappingRecord>> {
    reader
        .find_documents(collection, TEMP_ID_FIELD, &Value::String(temp_id.to_owned()))?
        .into_iter()
        .map(|doc| MappingRecord::from_document(collection, doc))
        .collect()
}
