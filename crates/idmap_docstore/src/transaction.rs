//! Write transactions.

use crate::collection::{CollectionSpec, Document};
use crate::error::{DocStoreError, DocStoreResult};
use crate::id::EntityId;
use crate::journal::JournalOp;
use crate::store::DocumentStore;
use parking_lot::MutexGuard;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// An exclusive write transaction.
///
/// Holds the store's writer lock from creation until commit or drop, so
/// at most one write transaction is active at a time. Reads made through
/// the transaction see its own pending writes; other readers keep seeing
/// the last committed state until [`DocumentStore::commit`] applies the
/// whole batch at once.
///
/// Dropping a transaction without committing discards its writes.
pub struct WriteTransaction<'a> {
    pub(crate) store: &'a DocumentStore,
    pub(crate) _writer: MutexGuard<'a, ()>,
    pub(crate) ops: Vec<JournalOp>,
    created: HashMap<String, CollectionSpec>,
    overlay: HashMap<String, BTreeMap<EntityId, Option<Document>>>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(store: &'a DocumentStore, writer: MutexGuard<'a, ()>) -> Self {
        Self {
            store,
            _writer: writer,
            ops: Vec::new(),
            created: HashMap::new(),
            overlay: HashMap::new(),
        }
    }

    /// Returns true if no writes have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of recorded writes.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the collection exists, committed or created here.
    #[must_use]
    pub fn has_collection(&self, name: &str) -> bool {
        self.created.contains_key(name) || self.store.has_collection(name)
    }

    /// Declares a new collection.
    pub fn create_collection(&mut self, spec: CollectionSpec) -> DocStoreResult<()> {
        if self.has_collection(&spec.name) {
            return Err(DocStoreError::CollectionExists { name: spec.name });
        }
        self.created.insert(spec.name.clone(), spec.clone());
        self.ops.push(JournalOp::CreateCollection(spec));
        Ok(())
    }

    /// Returns the declaration of a collection.
    pub fn spec(&self, collection: &str) -> DocStoreResult<CollectionSpec> {
        match self.created.get(collection) {
            Some(spec) => Ok(spec.clone()),
            None => self.store.spec(collection),
        }
    }

    /// Gets a document by key, including this transaction's writes.
    pub fn get(&self, collection: &str, key: &EntityId) -> DocStoreResult<Option<Document>> {
        if let Some(pending) = self.overlay.get(collection).and_then(|o| o.get(key)) {
            return Ok(pending.clone());
        }
        if self.created.contains_key(collection) {
            return Ok(None);
        }
        self.store.get(collection, key)
    }

    /// Inserts or replaces a document, keyed by the collection's key field.
    ///
    /// Returns the document's key.
    pub fn put(&mut self, collection: &str, document: Document) -> DocStoreResult<EntityId> {
        let spec = self.spec(collection)?;
        let key = spec.key_of(&document)?;
        self.overlay
            .entry(collection.to_owned())
            .or_default()
            .insert(key.clone(), Some(document.clone()));
        self.ops.push(JournalOp::Put {
            collection: collection.to_owned(),
            document,
        });
        Ok(key)
    }

    /// Deletes a document. Returns true if it existed.
    pub fn delete(&mut self, collection: &str, key: &EntityId) -> DocStoreResult<bool> {
        let existed = self.get(collection, key)?.is_some();
        if !existed {
            return Ok(false);
        }
        self.overlay
            .entry(collection.to_owned())
            .or_default()
            .insert(key.clone(), None);
        self.ops.push(JournalOp::Delete {
            collection: collection.to_owned(),
            key: key.clone(),
        });
        Ok(true)
    }

    /// Returns every document in the collection, ordered by key.
    pub fn scan(&self, collection: &str) -> DocStoreResult<Vec<Document>> {
        let mut merged: BTreeMap<EntityId, Document> = if self.created.contains_key(collection) {
            BTreeMap::new()
        } else {
            self.store.scan_keyed(collection)?
        };
        self.merge_overlay(collection, &mut merged, |_| true);
        Ok(merged.into_values().collect())
    }

    /// Returns documents whose `field` equals `value`, ordered by key.
    pub fn find_by(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> DocStoreResult<Vec<Document>> {
        let mut merged: BTreeMap<EntityId, Document> = if self.created.contains_key(collection) {
            BTreeMap::new()
        } else {
            self.store.find_by_keyed(collection, field, value)?
        };
        self.merge_overlay(collection, &mut merged, |doc| doc.get(field) == Some(value));
        Ok(merged.into_values().collect())
    }

    fn merge_overlay(
        &self,
        collection: &str,
        merged: &mut BTreeMap<EntityId, Document>,
        keep: impl Fn(&Document) -> bool,
    ) {
        let Some(overlay) = self.overlay.get(collection) else {
            return;
        };
        for (key, pending) in overlay {
            match pending {
                Some(doc) if keep(doc) => {
                    merged.insert(key.clone(), doc.clone());
                }
                _ => {
                    merged.remove(key);
                }
            }
        }
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("ops", &self.ops.len())
            .finish_non_exhaustive()
    }
}
