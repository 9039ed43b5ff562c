//! Transaction coordination hooks.
//!
//! The repository does not implement distributed transactions itself; it
//! exposes this seam so an external coordinator can wrap one or more
//! sessions' commits into a larger unit. Every save runs between begin and
//! commit on the configured coordinator, with rollback on failure. The
//! default coordinator is a no-op: each save stands alone.

use crate::error::RepositoryError;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait TransactionCoordinator: Send + Sync {
    fn begin(&self) -> Result<(), RepositoryError>;
    fn commit(&self) -> Result<(), RepositoryError>;
    fn rollback(&self) -> Result<(), RepositoryError>;
}

/// Default coordinator: every session save is its own transaction and the
/// store's atomic batch commit is the only atomicity in play.
#[derive(Default)]
pub struct LocalTransactions {
    active: AtomicUsize,
}

impl LocalTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl TransactionCoordinator for LocalTransactions {
    fn begin(&self) -> Result<(), RepositoryError> {
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self) -> Result<(), RepositoryError> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<(), RepositoryError> {
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_transactions_balance() {
        let txn = LocalTransactions::new();
        txn.begin().unwrap();
        assert_eq!(txn.active(), 1);
        txn.commit().unwrap();
        assert_eq!(txn.active(), 0);

        txn.begin().unwrap();
        txn.rollback().unwrap();
        assert_eq!(txn.active(), 0);
    }
}
