//! Repository lifecycle: the owned registry of repository-wide services.
//!
//! Created once at start-up and torn down explicitly at shutdown; sessions
//! and lock managers receive handles to it rather than reaching through
//! ambient global state. Owns the document store, the change bus, the lock
//! registry (including the reaper schedule), and the transaction
//! coordinator seam.

use crate::backup::{self, BackupOptions, Problems};
use crate::bus::ChangeBus;
use crate::config::RepositoryConfiguration;
use crate::document::Document;
use crate::error::RepositoryError;
use crate::lock::RepositoryLockManager;
use crate::session::SessionCache;
use crate::store::{DocumentStore, InMemoryDocumentStore, SledDocumentStore};
use crate::txn::{LocalTransactions, TransactionCoordinator};
use crate::types::NodeKey;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct Repository {
    config: RepositoryConfiguration,
    process_key: String,
    store: Arc<dyn DocumentStore>,
    bus: Arc<ChangeBus>,
    locks: Arc<RepositoryLockManager>,
    txn: Arc<dyn TransactionCoordinator>,
}

impl Repository {
    /// Start a repository: open the store, wire the bus and lock registry,
    /// start the reaper, and make sure the default workspace exists.
    pub fn start(config: RepositoryConfiguration) -> Result<Self, RepositoryError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => Arc::new(SledDocumentStore::open(path)?),
            None => Arc::new(InMemoryDocumentStore::new()),
        };
        Self::start_with(config, store, Arc::new(LocalTransactions::new()))
    }

    /// Start over an externally provided store and transaction coordinator.
    pub fn start_with(
        config: RepositoryConfiguration,
        store: Arc<dyn DocumentStore>,
        txn: Arc<dyn TransactionCoordinator>,
    ) -> Result<Self, RepositoryError> {
        let locks = Arc::new(RepositoryLockManager::new(store.clone()));
        locks.start_reaper(Duration::from_millis(config.lock_sweep_interval_ms));

        let repository = Repository {
            process_key: Uuid::new_v4().to_string(),
            store,
            bus: Arc::new(ChangeBus::new()),
            locks,
            txn,
            config,
        };
        repository.ensure_workspace(&repository.config.default_workspace.clone())?;
        info!(
            name = %repository.config.name,
            workspace = %repository.config.default_workspace,
            "Repository started"
        );
        Ok(repository)
    }

    /// Create the workspace's root document if it does not exist yet.
    /// Races between starters resolve through the store's CAS.
    ///
    /// Workspace names must not contain the key separator; node keys embed
    /// the workspace name as `workspace:identifier`.
    pub fn ensure_workspace(&self, workspace: &str) -> Result<(), RepositoryError> {
        if workspace.is_empty() || workspace.contains(':') {
            return Err(RepositoryError::Config(format!(
                "invalid workspace name {:?}: must be non-empty and must not contain ':'",
                workspace
            )));
        }
        let root = NodeKey::root(workspace);
        if self.store.get(&root)?.is_none() {
            self.store
                .compare_and_put(&root, None, Document::new("grove:root", None))?;
        }
        Ok(())
    }

    /// Open a session on the default workspace.
    pub fn login(&self, user_id: &str) -> Result<SessionCache, RepositoryError> {
        let workspace = self.config.default_workspace.clone();
        self.login_to(&workspace, user_id, HashMap::new())
    }

    /// Open a session on a named workspace, creating it on first use.
    pub fn login_to(
        &self,
        workspace: &str,
        user_id: &str,
        user_data: HashMap<String, String>,
    ) -> Result<SessionCache, RepositoryError> {
        self.ensure_workspace(workspace)?;
        Ok(SessionCache::new(
            workspace,
            user_id,
            user_data,
            self.store.clone(),
            self.bus.clone(),
            self.locks.clone(),
            self.txn.clone(),
            &self.process_key,
            &self.config.name,
        ))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn change_bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn lock_manager(&self) -> &Arc<RepositoryLockManager> {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Stream the full document population into `directory`, bypassing the
    /// session layer.
    pub fn backup(&self, directory: &Path, options: &BackupOptions) -> Arc<Problems> {
        backup::backup_repository(&*self.store, directory, options)
    }

    /// Replace the document population from a backup directory.
    pub fn restore(&self, directory: &Path) -> Arc<Problems> {
        backup::restore_repository(&*self.store, directory)
    }

    /// Stop the reaper and the change bus deterministically. Idempotent.
    pub fn shutdown(&self) {
        self.locks.shutdown();
        self.bus.shutdown();
        info!(name = %self.config.name, "Repository shut down");
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.shutdown();
    }
}
