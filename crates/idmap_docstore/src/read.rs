//! Read access shared by the store and write transactions.

use crate::collection::Document;
use crate::error::DocStoreResult;
use crate::id::EntityId;
use crate::store::DocumentStore;
use crate::transaction::WriteTransaction;
use serde_json::Value;

/// Read operations available both on committed state and inside a write
/// transaction.
///
/// Code that only reads can take `&impl DocumentRead` and run unchanged
/// against either view.
pub trait DocumentRead {
    /// Gets a document by key.
    fn get_document(&self, collection: &str, key: &EntityId) -> DocStoreResult<Option<Document>>;

    /// Returns every document in the collection, ordered by key.
    fn scan_documents(&self, collection: &str) -> DocStoreResult<Vec<Document>>;

    /// Returns documents whose `field` equals `value`, ordered by key.
    fn find_documents(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> DocStoreResult<Vec<Document>>;
}

impl DocumentRead for DocumentStore {
    fn get_document(&self, collection: &str, key: &EntityId) -> DocStoreResult<Option<Document>> {
        self.get(collection, key)
    }

    fn scan_documents(&self, collection: &str) -> DocStoreResult<Vec<Document>> {
        self.scan(collection)
    }

    fn find_documents(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> DocStoreResult<Vec<Document>> {
        self.find_by(collection, field, value)
    }
}

impl DocumentRead for WriteTransaction<'_> {
    fn get_document(&self, collection: &str, key: &EntityId) -> DocStoreResult<Option<Document>> {
        self.get(collection, key)
    }

    fn scan_documents(&self, collection: &str) -> DocStoreResult<Vec<Document>> {
        self.scan(collection)
    }

    fn find_documents(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> DocStoreResult<Vec<Document>> {
        self.find_by(collection, field, value)
    }
}
