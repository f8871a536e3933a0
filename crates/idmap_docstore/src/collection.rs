//! Collections and their hash indexes.

use crate::error::{DocStoreError, DocStoreResult};
use crate::id::EntityId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A stored document: a JSON object.
pub type Document = Map<String, Value>;

/// Declaration of a collection.
///
/// Every document in the collection carries its primary key in
/// `key_field`. Fields listed in `indexed_fields` get a hash index used
/// by equality lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    /// Collection name.
    pub name: String,
    /// Field holding the primary key.
    pub key_field: String,
    /// Fields with a hash index.
    pub indexed_fields: Vec<String>,
}

impl CollectionSpec {
    /// Declares a collection keyed by `key_field`.
    #[must_use]
    pub fn new(name: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_field: key_field.into(),
            indexed_fields: Vec::new(),
        }
    }

    /// Adds a hash index on `field`.
    #[must_use]
    pub fn with_index(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.indexed_fields.contains(&field) {
            self.indexed_fields.push(field);
        }
        self
    }

    /// Extracts the primary key from a document.
    pub fn key_of(&self, document: &Document) -> DocStoreResult<EntityId> {
        document
            .get(&self.key_field)
            .and_then(EntityId::from_value)
            .ok_or_else(|| DocStoreError::MissingKey {
                collection: self.name.clone(),
                field: self.key_field.clone(),
            })
    }
}

/// Index key for a field value. JSON text keeps `42` and `"42"` apart.
fn index_key(value: &Value) -> String {
    value.to_string()
}

/// Committed contents of one collection.
#[derive(Debug)]
pub(crate) struct Collection {
    spec: CollectionSpec,
    documents: BTreeMap<EntityId, Document>,
    indexes: HashMap<String, HashMap<String, BTreeSet<EntityId>>>,
}

impl Collection {
    pub(crate) fn new(spec: CollectionSpec) -> Self {
        let indexes = spec
            .indexed_fields
            .iter()
            .map(|field| (field.clone(), HashMap::new()))
            .collect();
        Self {
            spec,
            documents: BTreeMap::new(),
            indexes,
        }
    }

    pub(crate) fn spec(&self) -> &CollectionSpec {
        &self.spec
    }

    pub(crate) fn len(&self) -> usize {
        self.documents.len()
    }

    pub(crate) fn get(&self, key: &EntityId) -> Option<&Document> {
        self.documents.get(key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&EntityId, &Document)> {
        self.documents.iter()
    }

    /// Inserts or replaces a document. The key must already be validated.
    pub(crate) fn insert(&mut self, key: EntityId, document: Document) {
        self.unindex(&key);
        for (field, index) in &mut self.indexes {
            if let Some(value) = document.get(field) {
                index
                    .entry(index_key(value))
                    .or_default()
                    .insert(key.clone());
            }
        }
        self.documents.insert(key, document);
    }

    pub(crate) fn remove(&mut self, key: &EntityId) -> Option<Document> {
        self.unindex(key);
        self.documents.remove(key)
    }

    /// Keys of documents whose `field` equals `value`.
    pub(crate) fn keys_where(&self, field: &str, value: &Value) -> Vec<EntityId> {
        match self.indexes.get(field) {
            Some(index) => index
                .get(&index_key(value))
                .map(|keys| keys.iter().cloned().collect())
                .unwrap_or_default(),
            None => self
                .documents
                .iter()
                .filter(|(_, doc)| doc.get(field) == Some(value))
                .map(|(key, _)| key.clone())
                .collect(),
        }
    }

    fn unindex(&mut self, key: &EntityId) {
        let Some(old) = self.documents.get(key) else {
            return;
        };
        for (field, index) in &mut self.indexes {
            if let Some(value) = old.get(field) {
                let slot = index_key(value);
                if let Some(keys) = index.get_mut(&slot) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&slot);
                    }
                }
            }
        }
    }
}
