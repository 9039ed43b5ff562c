//! Error types for the repository core.
//!
//! Two layers: `StorageError` covers the document store and on-disk codecs,
//! `RepositoryError` covers session, lock, and configuration failures and
//! wraps storage errors for propagation with `?`.

use crate::types::{NodeKey, Revision};
use thiserror::Error;

/// Errors raised by document store implementations and the backup codec.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    /// The expected revision did not match the store's current revision.
    /// Surfaced to sessions as a stale-state conflict.
    #[error("revision mismatch for {key}: expected {expected:?}, found {found:?}")]
    StaleRevision {
        key: NodeKey,
        expected: Option<Revision>,
        found: Option<Revision>,
    },
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Errors raised by sessions, the lock registry, and repository lifecycle.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Another session committed a newer revision of a dirty node. The
    /// caller must refresh and retry; nothing was written.
    #[error("stale state: {0} was modified by another session; refresh and retry")]
    StaleState(NodeKey),

    #[error("node {0} not found")]
    NodeNotFound(NodeKey),

    /// Only nodes with a persisted document may be locked.
    #[error("cannot lock transient node {0}; the session must be saved first")]
    TransientNode(NodeKey),

    #[error("node {key} is locked by \"{owner}\"")]
    Locked { key: NodeKey, owner: String },

    #[error("cannot convert {from} value to {to}")]
    ValueConversion {
        from: &'static str,
        to: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transaction error: {0}")]
    Transaction(String),
}

impl RepositoryError {
    /// True when the caller can recover by calling `refresh` and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepositoryError::StaleState(_)
                | RepositoryError::Storage(StorageError::StaleRevision { .. })
        )
    }
}
