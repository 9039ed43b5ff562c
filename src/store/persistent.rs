//! Sled-backed document store.
//!
//! Durable implementation of the store contract. Each entry is a bincode
//! payload of (revision, document) keyed by the node key's string form.
//! Batch commits run inside a single sled transaction so the all-or-nothing
//! guarantee holds across process crashes as well.

use crate::document::Document;
use crate::error::StorageError;
use crate::store::{DocumentOperation, DocumentStore};
use crate::types::{NodeKey, Revision};
use sled::transaction::ConflictableTransactionError;
use std::path::Path;
use tracing::debug;

pub struct SledDocumentStore {
    tree: sled::Tree,
    _db: sled::Db,
}

fn encode(revision: Revision, document: &Document) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(&(revision, document))?)
}

fn decode(bytes: &[u8]) -> Result<(Revision, Document), StorageError> {
    Ok(bincode::deserialize(bytes)?)
}

impl SledDocumentStore {
    /// Open (or create) a store under the given directory.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let tree = db.open_tree("documents")?;
        debug!(path = %path.display(), entries = tree.len(), "Opened document store");
        Ok(SledDocumentStore { tree, _db: db })
    }
}

impl DocumentStore for SledDocumentStore {
    fn get(&self, key: &NodeKey) -> Result<Option<(Document, Revision)>, StorageError> {
        match self.tree.get(key.as_str())? {
            None => Ok(None),
            Some(bytes) => {
                let (revision, document) = decode(&bytes)?;
                Ok(Some((document, revision)))
            }
        }
    }

    fn compare_and_put(
        &self,
        key: &NodeKey,
        expected: Option<Revision>,
        document: Document,
    ) -> Result<bool, StorageError> {
        let old = match self.tree.get(key.as_str())? {
            Some(bytes) => {
                let (revision, _) = decode(&bytes)?;
                if expected != Some(revision) {
                    return Ok(false);
                }
                Some(bytes)
            }
            None => {
                if expected.is_some() {
                    return Ok(false);
                }
                None
            }
        };
        let next = expected.map(|rev| rev + 1).unwrap_or(1);
        let new = encode(next, &document)?;
        let swapped = self
            .tree
            .compare_and_swap(key.as_str(), old, Some(new))?
            .is_ok();
        Ok(swapped)
    }

    fn remove(&self, key: &NodeKey) -> Result<bool, StorageError> {
        Ok(self.tree.remove(key.as_str())?.is_some())
    }

    fn commit(
        &self,
        operations: Vec<DocumentOperation>,
    ) -> Result<Vec<(NodeKey, Revision)>, StorageError> {
        let result = self.tree.transaction(|tx| {
            let mut committed = Vec::new();
            for op in &operations {
                let current = match tx.get(op.key().as_str())? {
                    Some(bytes) => Some(
                        decode(&bytes)
                            .map_err(ConflictableTransactionError::Abort)?
                            .0,
                    ),
                    None => None,
                };
                match op {
                    DocumentOperation::Put {
                        key,
                        expected,
                        document,
                    } => {
                        if current != *expected {
                            return Err(ConflictableTransactionError::Abort(
                                StorageError::StaleRevision {
                                    key: key.clone(),
                                    expected: *expected,
                                    found: current,
                                },
                            ));
                        }
                        let next = expected.map(|rev| rev + 1).unwrap_or(1);
                        let bytes = encode(next, document)
                            .map_err(ConflictableTransactionError::Abort)?;
                        tx.insert(key.as_str(), bytes)?;
                        committed.push((key.clone(), next));
                    }
                    DocumentOperation::Remove { key, expected } => {
                        if current != Some(*expected) {
                            return Err(ConflictableTransactionError::Abort(
                                StorageError::StaleRevision {
                                    key: key.clone(),
                                    expected: Some(*expected),
                                    found: current,
                                },
                            ));
                        }
                        tx.remove(key.as_str())?;
                    }
                }
            }
            Ok(committed)
        });

        match result {
            Ok(committed) => {
                self.tree.flush()?;
                Ok(committed)
            }
            Err(sled::transaction::TransactionError::Abort(err)) => Err(err),
            Err(sled::transaction::TransactionError::Storage(err)) => Err(err.into()),
        }
    }

    fn entries(&self) -> Result<Vec<(NodeKey, Document, Revision)>, StorageError> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (key_bytes, value) = item?;
            let key = NodeKey::from(String::from_utf8_lossy(&key_bytes).as_ref());
            let (revision, document) = decode(&value)?;
            entries.push((key, document, revision));
        }
        Ok(entries)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.tree.clear()?;
        self.tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> NodeKey {
        NodeKey::new("ws", id)
    }

    fn open_store() -> (tempfile::TempDir, SledDocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledDocumentStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_round_trip_document() {
        let (_dir, store) = open_store();
        let mut doc = Document::new("nt:unstructured", None);
        doc.set_property("title", crate::value::PropertyValue::from("hello"));

        assert!(store.compare_and_put(&key("a"), None, doc.clone()).unwrap());
        let (loaded, revision) = store.get(&key("a")).unwrap().unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(revision, 1);
    }

    #[test]
    fn test_compare_and_put_rejects_stale_revision() {
        let (_dir, store) = open_store();
        let doc = Document::new("nt:unstructured", None);
        store.compare_and_put(&key("a"), None, doc.clone()).unwrap();
        assert!(!store.compare_and_put(&key("a"), Some(3), doc).unwrap());
    }

    #[test]
    fn test_commit_batch_atomicity_on_disk() {
        let (_dir, store) = open_store();
        let doc = Document::new("nt:unstructured", None);
        store.compare_and_put(&key("a"), None, doc.clone()).unwrap();

        let err = store
            .commit(vec![
                DocumentOperation::Put {
                    key: key("b"),
                    expected: None,
                    document: doc.clone(),
                },
                DocumentOperation::Remove {
                    key: key("a"),
                    expected: 42,
                },
            ])
            .unwrap_err();
        assert!(matches!(err, StorageError::StaleRevision { .. }));
        assert!(store.get(&key("b")).unwrap().is_none());
        assert!(store.get(&key("a")).unwrap().is_some());
    }

    #[test]
    fn test_documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Document::new("nt:file", None);
        {
            let store = SledDocumentStore::open(dir.path()).unwrap();
            store.compare_and_put(&key("a"), None, doc.clone()).unwrap();
        }
        let store = SledDocumentStore::open(dir.path()).unwrap();
        let (loaded, revision) = store.get(&key("a")).unwrap().unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(revision, 1);
    }
}
