//! Document store contract.
//!
//! The store is the single point of shared mutable state: a keyed population
//! of node documents with per-document optimistic versioning. Sessions never
//! share in-memory structures; every cross-session effect goes through this
//! trait. The narrow boundary exists so the core can be exercised against
//! the in-memory implementation in tests while production runs on sled.

pub mod memory;
pub mod persistent;

use crate::document::Document;
use crate::error::StorageError;
use crate::types::{NodeKey, Revision};

pub use memory::InMemoryDocumentStore;
pub use persistent::SledDocumentStore;

/// One write in an atomic commit batch.
#[derive(Debug, Clone)]
pub enum DocumentOperation {
    /// Write a document. `expected` is the revision the writer last observed
    /// (None for a brand-new node, which must not exist yet).
    Put {
        key: NodeKey,
        expected: Option<Revision>,
        document: Document,
    },
    /// Remove a document, which must still be at the expected revision.
    Remove { key: NodeKey, expected: Revision },
}

impl DocumentOperation {
    pub fn key(&self) -> &NodeKey {
        match self {
            DocumentOperation::Put { key, .. } => key,
            DocumentOperation::Remove { key, .. } => key,
        }
    }
}

/// Shared, keyed store of immutable-once-written node documents.
///
/// Implementations must provide atomic compare-and-set per document and an
/// atomic multi-document `commit` so a session's save can detect lost
/// updates without holding any repository-wide lock.
pub trait DocumentStore: Send + Sync {
    /// Read the current document and revision for a key.
    fn get(&self, key: &NodeKey) -> Result<Option<(Document, Revision)>, StorageError>;

    /// Write `document` only if the current revision matches `expected`
    /// (None = the key must be absent). Returns false on a mismatch without
    /// writing anything.
    fn compare_and_put(
        &self,
        key: &NodeKey,
        expected: Option<Revision>,
        document: Document,
    ) -> Result<bool, StorageError>;

    /// Remove a document unconditionally, returning true if it existed.
    fn remove(&self, key: &NodeKey) -> Result<bool, StorageError>;

    /// Apply a whole batch atomically. Every operation's expected revision
    /// is validated first; any mismatch fails the entire batch with
    /// `StorageError::StaleRevision` and writes nothing. On success returns
    /// the new revision for every put, in batch order.
    fn commit(
        &self,
        operations: Vec<DocumentOperation>,
    ) -> Result<Vec<(NodeKey, Revision)>, StorageError>;

    /// Snapshot of the full document population, for backup and restore.
    fn entries(&self) -> Result<Vec<(NodeKey, Document, Revision)>, StorageError>;

    /// Remove every document. Used when restoring from a backup.
    fn clear(&self) -> Result<(), StorageError>;
}
