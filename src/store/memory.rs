//! In-memory document store.
//!
//! The reference implementation of the store contract: a map guarded by a
//! single read-write lock. Commit batches validate and apply under one write
//! guard, which gives the atomicity the session save path relies on. Used
//! as the test double throughout the crate and as a non-durable backend.

use crate::document::Document;
use crate::error::StorageError;
use crate::store::{DocumentOperation, DocumentStore};
use crate::types::{NodeKey, Revision};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<NodeKey, (Document, Revision)>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

fn check_expected(
    key: &NodeKey,
    current: Option<Revision>,
    expected: Option<Revision>,
) -> Result<(), StorageError> {
    if current != expected {
        return Err(StorageError::StaleRevision {
            key: key.clone(),
            expected,
            found: current,
        });
    }
    Ok(())
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, key: &NodeKey) -> Result<Option<(Document, Revision)>, StorageError> {
        Ok(self.documents.read().get(key).cloned())
    }

    fn compare_and_put(
        &self,
        key: &NodeKey,
        expected: Option<Revision>,
        document: Document,
    ) -> Result<bool, StorageError> {
        let mut documents = self.documents.write();
        let current = documents.get(key).map(|(_, rev)| *rev);
        if current != expected {
            return Ok(false);
        }
        let next = current.map(|rev| rev + 1).unwrap_or(1);
        documents.insert(key.clone(), (document, next));
        Ok(true)
    }

    fn remove(&self, key: &NodeKey) -> Result<bool, StorageError> {
        Ok(self.documents.write().remove(key).is_some())
    }

    fn commit(
        &self,
        operations: Vec<DocumentOperation>,
    ) -> Result<Vec<(NodeKey, Revision)>, StorageError> {
        let mut documents = self.documents.write();

        // Validate every expected revision before touching anything.
        for op in &operations {
            let current = documents.get(op.key()).map(|(_, rev)| *rev);
            match op {
                DocumentOperation::Put { key, expected, .. } => {
                    check_expected(key, current, *expected)?;
                }
                DocumentOperation::Remove { key, expected } => {
                    check_expected(key, current, Some(*expected))?;
                }
            }
        }

        let mut committed = Vec::new();
        for op in operations {
            match op {
                DocumentOperation::Put {
                    key,
                    expected,
                    document,
                } => {
                    let next = expected.map(|rev| rev + 1).unwrap_or(1);
                    documents.insert(key.clone(), (document, next));
                    committed.push((key, next));
                }
                DocumentOperation::Remove { key, .. } => {
                    documents.remove(&key);
                }
            }
        }
        Ok(committed)
    }

    fn entries(&self) -> Result<Vec<(NodeKey, Document, Revision)>, StorageError> {
        let mut entries: Vec<(NodeKey, Document, Revision)> = self
            .documents
            .read()
            .iter()
            .map(|(key, (doc, rev))| (key.clone(), doc.clone(), *rev))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.documents.write().clear();
        Ok(())
    }
}
