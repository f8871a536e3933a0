//! The document store.

use crate::collection::{Collection, CollectionSpec, Document};
use crate::config::StoreConfig;
use crate::error::{DocStoreError, DocStoreResult};
use crate::id::EntityId;
use crate::journal::{self, Batch, JournalOp};
use crate::transaction::WriteTransaction;
use idmap_storage::{FileJournal, InMemoryJournal, JournalBackend};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// An embedded store of named document collections.
///
/// State lives in memory and is rebuilt on open by replaying the journal.
/// Each committed [`WriteTransaction`] is appended as one checksummed
/// batch, so multi-document writes are atomic both for concurrent readers
/// and across crashes.
///
/// # Example
///
/// ```rust
/// use idmap_docstore::{CollectionSpec, DocumentStore, EntityId};
/// use serde_json::json;
///
/// let store = DocumentStore::open_in_memory().unwrap();
/// store.create_collection(CollectionSpec::new("participants", "id")).unwrap();
/// store
///     .put("participants", json!({"id": "temp_abc", "name": "X"}).as_object().cloned().unwrap())
///     .unwrap();
/// assert!(store.get("participants", &EntityId::from("temp_abc")).unwrap().is_some());
/// ```
pub struct DocumentStore {
    config: StoreConfig,
    collections: RwLock<BTreeMap<String, Collection>>,
    journal: Mutex<Box<dyn JournalBackend>>,
    writer: Mutex<()>,
    sequence: AtomicU64,
    batches_since_compact: AtomicU64,
}

impl DocumentStore {
    /// Opens a store over a journal backend, replaying its contents.
    ///
    /// A torn final batch is discarded and cut from the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or is corrupted
    /// before its tail.
    pub fn open(config: StoreConfig, mut backend: Box<dyn JournalBackend>) -> DocStoreResult<Self> {
        let data = backend.read_all()?;
        let replay = journal::replay(&data)?;

        if replay.has_torn_tail(data.len() as u64) {
            warn!(
                valid_len = replay.valid_len,
                journal_len = data.len(),
                "discarding torn batch at journal tail"
            );
            backend.truncate(replay.valid_len)?;
        }

        let mut collections = BTreeMap::new();
        let mut sequence = 0;
        for batch in &replay.batches {
            apply_ops(&mut collections, &batch.ops)?;
            sequence = batch.sequence;
        }

        info!(
            batches = replay.batches.len(),
            collections = collections.len(),
            sequence,
            "document store opened"
        );

        Ok(Self {
            config,
            collections: RwLock::new(collections),
            journal: Mutex::new(backend),
            writer: Mutex::new(()),
            sequence: AtomicU64::new(sequence),
            batches_since_compact: AtomicU64::new(replay.batches.len() as u64),
        })
    }

    /// Opens an empty in-memory store.
    pub fn open_in_memory() -> DocStoreResult<Self> {
        Self::open(StoreConfig::default(), Box::new(InMemoryJournal::new()))
    }

    /// Opens or creates a file-backed store at `path`.
    pub fn open_path(path: &Path, config: StoreConfig) -> DocStoreResult<Self> {
        let backend = FileJournal::open_with_create_dirs(path)?;
        Self::open(config, Box::new(backend))
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Sequence number of the last committed batch.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Current journal size in bytes.
    pub fn journal_size(&self) -> DocStoreResult<u64> {
        Ok(self.journal.lock().size()?)
    }

    /// Returns true if a collection with this name exists.
    #[must_use]
    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    /// Names of all collections, sorted.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }

    /// Returns the declaration of a collection.
    pub fn spec(&self, name: &str) -> DocStoreResult<CollectionSpec> {
        self.collections
            .read()
            .get(name)
            .map(|c| c.spec().clone())
            .ok_or_else(|| DocStoreError::collection_not_found(name))
    }

    /// Declares a new collection.
    pub fn create_collection(&self, spec: CollectionSpec) -> DocStoreResult<()> {
        self.write_transaction(|txn| txn.create_collection(spec))
    }

    /// Declares a collection unless one with the same name exists.
    ///
    /// Returns true if the collection was created.
    pub fn ensure_collection(&self, spec: CollectionSpec) -> DocStoreResult<bool> {
        self.write_transaction(|txn| {
            if txn.has_collection(&spec.name) {
                return Ok(false);
            }
            txn.create_collection(spec)?;
            Ok(true)
        })
    }

    /// Gets the committed version of a document.
    pub fn get(&self, collection: &str, key: &EntityId) -> DocStoreResult<Option<Document>> {
        let collections = self.collections.read();
        let coll = lookup(&collections, collection)?;
        Ok(coll.get(key).cloned())
    }

    /// Returns all committed documents in a collection, ordered by key.
    pub fn scan(&self, collection: &str) -> DocStoreResult<Vec<Document>> {
        Ok(self.scan_keyed(collection)?.into_values().collect())
    }

    /// Returns committed documents whose `field` equals `value`.
    ///
    /// Uses the field's hash index when one is declared.
    pub fn find_by(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> DocStoreResult<Vec<Document>> {
        Ok(self
            .find_by_keyed(collection, field, value)?
            .into_values()
            .collect())
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> DocStoreResult<usize> {
        let collections = self.collections.read();
        Ok(lookup(&collections, collection)?.len())
    }

    /// Inserts or replaces a single document.
    pub fn put(&self, collection: &str, document: Document) -> DocStoreResult<EntityId> {
        self.write_transaction(|txn| txn.put(collection, document))
    }

    /// Deletes a single document. Returns true if it existed.
    pub fn delete(&self, collection: &str, key: &EntityId) -> DocStoreResult<bool> {
        self.write_transaction(|txn| txn.delete(collection, key))
    }

    /// Begins a write transaction, blocking until the writer lock is free.
    pub fn begin_write(&self) -> WriteTransaction<'_> {
        WriteTransaction::new(self, self.writer.lock())
    }

    /// Commits a write transaction.
    ///
    /// The batch is journaled (and synced if configured) before it becomes
    /// visible. If journaling fails nothing is applied and any partially
    /// written bytes are cut from the journal.
    ///
    /// Returns the commit sequence number.
    pub fn commit(&self, txn: WriteTransaction<'_>) -> DocStoreResult<u64> {
        if txn.is_empty() {
            return Ok(self.sequence());
        }

        let batch = Batch {
            sequence: self.sequence() + 1,
            ops: txn.ops.clone(),
        };
        let frame = batch.encode_frame()?;

        {
            let mut backend = self.journal.lock();
            let offset = backend.size()?;
            let written = backend.append(&frame).and_then(|_| {
                if self.config.sync_on_commit {
                    backend.sync()
                } else {
                    Ok(())
                }
            });
            if let Err(e) = written {
                if let Err(cleanup) = backend.truncate(offset) {
                    warn!(error = %cleanup, "failed to cut aborted batch from journal");
                }
                return Err(e.into());
            }
        }

        apply_ops(&mut self.collections.write(), &batch.ops)?;
        self.sequence.store(batch.sequence, Ordering::SeqCst);
        debug!(sequence = batch.sequence, ops = batch.ops.len(), "batch committed");

        let threshold = self.config.compact_after_batches;
        let pending = self.batches_since_compact.fetch_add(1, Ordering::SeqCst) + 1;
        if threshold > 0 && pending >= threshold {
            // the batch is already durable; a failed snapshot is retried
            // after the next batch
            if let Err(e) = self.compact_locked() {
                warn!(error = %e, sequence = batch.sequence, "automatic compaction failed");
            }
        }

        drop(txn);
        Ok(batch.sequence)
    }

    /// Runs `f` inside a write transaction.
    ///
    /// If `f` returns `Ok` the transaction is committed; if it returns
    /// `Err` every write it made is discarded.
    pub fn write_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> Result<T, E>,
        E: From<DocStoreError>,
    {
        let mut txn = self.begin_write();
        match f(&mut txn) {
            Ok(value) => {
                self.commit(txn)?;
                Ok(value)
            }
            Err(e) => {
                debug!(ops = txn.op_count(), "write transaction aborted");
                Err(e)
            }
        }
    }

    /// Rewrites the journal as a single snapshot batch.
    pub fn compact(&self) -> DocStoreResult<()> {
        let _writer = self.writer.lock();
        self.compact_locked()
    }

    fn compact_locked(&self) -> DocStoreResult<()> {
        let ops = {
            let collections = self.collections.read();
            let mut ops = Vec::new();
            for coll in collections.values() {
                ops.push(JournalOp::CreateCollection(coll.spec().clone()));
            }
            for (name, coll) in collections.iter() {
                for (_, doc) in coll.iter() {
                    ops.push(JournalOp::Put {
                        collection: name.clone(),
                        document: doc.clone(),
                    });
                }
            }
            ops
        };

        let snapshot = Batch {
            sequence: self.sequence(),
            ops,
        };
        let frame = snapshot.encode_frame()?;
        self.journal.lock().replace(&frame)?;
        self.batches_since_compact.store(0, Ordering::SeqCst);
        info!(
            sequence = snapshot.sequence,
            bytes = frame.len(),
            "journal compacted"
        );
        Ok(())
    }

    pub(crate) fn scan_keyed(&self, collection: &str) -> DocStoreResult<BTreeMap<EntityId, Document>> {
        let collections = self.collections.read();
        let coll = lookup(&collections, collection)?;
        Ok(coll.iter().map(|(k, d)| (k.clone(), d.clone())).collect())
    }

    pub(crate) fn find_by_keyed(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> DocStoreResult<BTreeMap<EntityId, Document>> {
        let collections = self.collections.read();
        let coll = lookup(&collections, collection)?;
        Ok(coll
            .keys_where(field, value)
            .into_iter()
            .filter_map(|key| coll.get(&key).cloned().map(|doc| (key, doc)))
            .collect())
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("sequence", &self.sequence())
            .field("collections", &self.collection_names())
            .finish_non_exhaustive()
    }
}

fn lookup<'c>(
    collections: &'c BTreeMap<String, Collection>,
    name: &str,
) -> DocStoreResult<&'c Collection> {
    collections
        .get(name)
        .ok_or_else(|| DocStoreError::collection_not_found(name))
}

fn apply_ops(collections: &mut BTreeMap<String, Collection>, ops: &[JournalOp]) -> DocStoreResult<()> {
    for op in ops {
        match op {
            JournalOp::CreateCollection(spec) => {
                collections
                    .entry(spec.name.clone())
                    .or_insert_with(|| Collection::new(spec.clone()));
            }
            JournalOp::Put {
                collection,
                document,
            } => {
                let coll = collections
                    .get_mut(collection)
                    .ok_or_else(|| DocStoreError::collection_not_found(collection))?;
                let key = coll.spec().key_of(document)?;
                coll.insert(key, document.clone());
            }
            JournalOp::Delete { collection, key } => {
                let coll = collections
                    .get_mut(collection)
                    .ok_or_else(|| DocStoreError::collection_not_found(collection))?;
                coll.remove(key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn store_with(journal: &InMemoryJournal) -> DocumentStore {
        DocumentStore::open(StoreConfig::default(), Box::new(journal.clone())).unwrap()
    }

    #[test]
    fn put_get_delete() {
        let store = DocumentStore::open_in_memory().unwrap();
        store
            .create_collection(CollectionSpec::new("participants", "id"))
            .unwrap();

        let key = store
            .put("participants", doc(json!({"id": "temp_abc", "name": "X"})))
            .unwrap();
        assert_eq!(key, EntityId::from("temp_abc"));
        assert_eq!(store.count("participants").unwrap(), 1);
        assert_eq!(
            store.get("participants", &key).unwrap().unwrap()["name"],
            json!("X")
        );

        assert!(store.delete("participants", &key).unwrap());
        assert!(!store.delete("participants", &key).unwrap());
        assert!(store.get("participants", &key).unwrap().is_none());
    }

    #[test]
    fn unknown_collection_is_an_error() {
        let store = DocumentStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get("nope", &EntityId::Int(1)),
            Err(DocStoreError::CollectionNotFound { .. })
        ));
        assert!(matches!(
            store.put("nope", doc(json!({"id": 1}))),
            Err(DocStoreError::CollectionNotFound { .. })
        ));
    }

    #[test]
    fn duplicate_collection_rejected_but_ensure_is_idempotent() {
        let store = DocumentStore::open_in_memory().unwrap();
        let spec = CollectionSpec::new("outbox", "local_id");
        assert!(store.ensure_collection(spec.clone()).unwrap());
        assert!(!store.ensure_collection(spec.clone()).unwrap());
        assert!(matches!(
            store.create_collection(spec),
            Err(DocStoreError::CollectionExists { .. })
        ));
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = DocumentStore::open_in_memory().unwrap();
        store
            .create_collection(CollectionSpec::new("honors", "id").with_index("participant_id"))
            .unwrap();
        store
            .put("honors", doc(json!({"id": 1, "participant_id": "temp_a"})))
            .unwrap();

        store
            .write_transaction(|txn| {
                txn.put("honors", doc(json!({"id": 1, "participant_id": 42})))?;
                txn.put("honors", doc(json!({"id": 2, "participant_id": "temp_a"})))?;

                let pending = txn.find_by("honors", "participant_id", &json!("temp_a"))?;
                assert_eq!(pending.len(), 1);
                assert_eq!(pending[0]["id"], json!(2));
                assert_eq!(txn.scan("honors")?.len(), 2);

                // Outside the transaction nothing has changed yet.
                assert_eq!(
                    store
                        .find_by("honors", "participant_id", &json!("temp_a"))
                        .map(|d| d.len())
                        .unwrap_or(0),
                    1
                );
                Ok::<_, DocStoreError>(())
            })
            .unwrap();

        assert_eq!(
            store
                .find_by("honors", "participant_id", &json!(42))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn failed_closure_discards_writes() {
        let store = DocumentStore::open_in_memory().unwrap();
        store
            .create_collection(CollectionSpec::new("participants", "id"))
            .unwrap();
        let before = store.sequence();

        let result: DocStoreResult<()> = store.write_transaction(|txn| {
            txn.put("participants", doc(json!({"id": 1})))?;
            Err(DocStoreError::transaction_aborted("test"))
        });

        assert!(result.is_err());
        assert_eq!(store.count("participants").unwrap(), 0);
        assert_eq!(store.sequence(), before);
    }

    #[test]
    fn reopen_replays_journal() {
        let journal = InMemoryJournal::new();
        {
            let store = store_with(&journal);
            store
                .create_collection(CollectionSpec::new("participants", "id").with_index("name"))
                .unwrap();
            store
                .put("participants", doc(json!({"id": 42, "name": "X"})))
                .unwrap();
            store
                .put("participants", doc(json!({"id": "temp_b", "name": "Y"})))
                .unwrap();
            store
                .delete("participants", &EntityId::from("temp_b"))
                .unwrap();
        }

        let store = store_with(&journal);
        assert_eq!(store.sequence(), 4);
        assert_eq!(store.count("participants").unwrap(), 1);
        assert_eq!(
            store
                .find_by("participants", "name", &json!("X"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn torn_batch_is_discarded_on_reopen() {
        let journal = InMemoryJournal::new();
        {
            let store = store_with(&journal);
            store
                .create_collection(CollectionSpec::new("participants", "id"))
                .unwrap();
            store
                .put("participants", doc(json!({"id": "temp_abc"})))
                .unwrap();
        }
        let intact = journal.data();

        // Simulate a crash halfway through appending the swap batch.
        {
            let store = store_with(&journal);
            store
                .write_transaction(|txn| {
                    txn.put("participants", doc(json!({"id": 42})))?;
                    txn.delete("participants", &EntityId::from("temp_abc"))?;
                    Ok::<_, DocStoreError>(())
                })
                .unwrap();
        }
        let full = journal.data();
        let torn = full[..intact.len() + (full.len() - intact.len()) / 2].to_vec();

        let reopened_journal = InMemoryJournal::with_data(torn);
        let store = store_with(&reopened_journal);
        assert!(store
            .get("participants", &EntityId::from("temp_abc"))
            .unwrap()
            .is_some());
        assert!(store.get("participants", &EntityId::Int(42)).unwrap().is_none());
        assert_eq!(reopened_journal.data(), intact);
    }

    #[test]
    fn journal_failure_leaves_state_untouched() {
        let journal = InMemoryJournal::new();
        let store = store_with(&journal);
        store
            .create_collection(CollectionSpec::new("participants", "id"))
            .unwrap();
        let size = store.journal_size().unwrap();

        journal.set_fail_writes(true);
        let result = store.put("participants", doc(json!({"id": 1})));
        assert!(matches!(result, Err(DocStoreError::Storage(_))));
        journal.set_fail_writes(false);

        assert_eq!(store.count("participants").unwrap(), 0);
        assert_eq!(store.journal_size().unwrap(), size);
    }

    #[test]
    fn failed_auto_compaction_still_commits() {
        let journal = InMemoryJournal::new();
        {
            let store = DocumentStore::open(
                StoreConfig::new().compact_after_batches(1),
                Box::new(journal.clone()),
            )
            .unwrap();
            store
                .create_collection(CollectionSpec::new("participants", "id"))
                .unwrap();

            journal.set_fail_replace(true);
            let sequence = store
                .put("participants", doc(json!({"id": 42, "name": "Ana"})))
                .map(|_| store.sequence())
                .unwrap();
            assert_eq!(sequence, 2);
            assert!(store.get("participants", &EntityId::Int(42)).unwrap().is_some());
            journal.set_fail_replace(false);
        }

        let store = store_with(&journal);
        assert_eq!(store.count("participants").unwrap(), 1);
        assert_eq!(store.sequence(), 2);
    }

    #[test]
    fn compaction_preserves_contents() {
        let journal = InMemoryJournal::new();
        {
            let store = DocumentStore::open(
                StoreConfig::new().compact_after_batches(3),
                Box::new(journal.clone()),
            )
            .unwrap();
            store
                .create_collection(CollectionSpec::new("attendance", "id"))
                .unwrap();
            for i in 0..10 {
                store
                    .put("attendance", doc(json!({"id": i, "participant_id": i * 2})))
                    .unwrap();
            }
            store.delete("attendance", &EntityId::Int(0)).unwrap();
            store.compact().unwrap();
        }

        let store = store_with(&journal);
        assert_eq!(store.count("attendance").unwrap(), 9);
        assert_eq!(store.sequence(), 12);
        assert!(store.get("attendance", &EntityId::Int(0)).unwrap().is_none());
    }

    proptest::proptest! {
        #[test]
        fn replay_reproduces_committed_state(
            writes in proptest::collection::vec((0i64..16, proptest::option::of(0i64..4)), 1..40)
        ) {
            let journal = InMemoryJournal::new();
            let store = store_with(&journal);
            store
                .create_collection(CollectionSpec::new("attendance", "id").with_index("participant_id"))
                .unwrap();
            for (id, participant) in &writes {
                match participant {
                    Some(p) => {
                        store
                            .put("attendance", doc(json!({"id": id, "participant_id": p})))
                            .unwrap();
                    }
                    None => {
                        store.delete("attendance", &EntityId::Int(*id)).unwrap();
                    }
                }
            }
            let expected = store.scan("attendance").unwrap();
            drop(store);

            let reopened = store_with(&journal);
            proptest::prop_assert_eq!(reopened.scan("attendance").unwrap(), expected);
            for p in 0i64..4 {
                proptest::prop_assert_eq!(
                    reopened.find_by("attendance", "participant_id", &json!(p)).unwrap().len(),
                    reopened
                        .scan("attendance")
                        .unwrap()
                        .iter()
                        .filter(|d| d["participant_id"] == json!(p))
                        .count()
                );
            }
        }
    }

    #[test]
    fn file_backed_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.journal");
        {
            let store = DocumentStore::open_path(&path, StoreConfig::default()).unwrap();
            store
                .create_collection(CollectionSpec::new("participants", "id"))
                .unwrap();
            store
                .put("participants", doc(json!({"id": 42, "name": "X"})))
                .unwrap();
        }

        let store = DocumentStore::open_path(&path, StoreConfig::default()).unwrap();
        assert_eq!(
            store.get("participants", &EntityId::Int(42)).unwrap().unwrap()["name"],
            json!("X")
        );
    }
}
