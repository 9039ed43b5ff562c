//! Lock registry: exclusive access to subtrees across sessions.
//!
//! Two tiers: a repository-level `RepositoryLockManager` hands out one
//! `WorkspaceLockManager` per workspace. Locks are validated on every save,
//! may cover a single node or a whole subtree (deep), and carry an optional
//! lease. Persistent locks are written into the store's system area so a
//! process restart does not silently lose them; session-scoped locks live
//! only as long as their owning session. A background reaper sweeps expired
//! leases on a fixed, configurable interval and is stopped deterministically
//! at repository shutdown.

use crate::document::Document;
use crate::error::{RepositoryError, StorageError};
use crate::store::DocumentStore;
use crate::types::NodeKey;
use crate::value::PropertyValue;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Workspace key of the store's system area, where persistent lock records
/// live alongside (but apart from) user content.
const SYSTEM_WORKSPACE: &str = "grove-system";
const LOCK_TYPE: &str = "grove:lock";

/// A granted lock over a node or subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub node_key: NodeKey,
    pub token: Uuid,
    pub session_id: String,
    pub owner: String,
    /// True: the node and its entire subtree. False: the node only.
    pub deep: bool,
    /// Session-scoped locks die with their owning session and are never
    /// persisted.
    pub session_scoped: bool,
    /// None = the lock never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expiry) if expiry <= now)
    }

    fn record_key(node_key: &NodeKey) -> NodeKey {
        NodeKey::new(SYSTEM_WORKSPACE, &format!("lock-{}", node_key))
    }

    fn to_document(&self, workspace: &str) -> Document {
        let mut doc = Document::new(LOCK_TYPE, None);
        doc.set_property("lockedKey", PropertyValue::String(self.node_key.to_string()));
        doc.set_property("workspace", PropertyValue::String(workspace.to_string()));
        doc.set_property("owner", PropertyValue::String(self.owner.clone()));
        doc.set_property("sessionId", PropertyValue::String(self.session_id.clone()));
        doc.set_property("token", PropertyValue::String(self.token.to_string()));
        doc.set_property("deep", PropertyValue::Boolean(self.deep));
        doc.set_property("sessionScoped", PropertyValue::Boolean(self.session_scoped));
        if let Some(expiry) = self.expires_at {
            doc.set_property("expires", PropertyValue::Date(expiry));
        }
        doc
    }

    fn from_document(doc: &Document) -> Option<(String, Lock)> {
        if doc.primary_type != LOCK_TYPE {
            return None;
        }
        let workspace = doc.property("workspace")?.as_string();
        let lock = Lock {
            node_key: NodeKey::from(doc.property("lockedKey")?.as_string().as_str()),
            token: Uuid::parse_str(&doc.property("token")?.as_string()).ok()?,
            session_id: doc.property("sessionId")?.as_string(),
            owner: doc.property("owner")?.as_string(),
            deep: doc.property("deep")?.as_boolean().ok()?,
            session_scoped: doc.property("sessionScoped")?.as_boolean().ok()?,
            expires_at: match doc.property("expires") {
                Some(value) => Some(value.as_date().ok()?),
                None => None,
            },
        };
        Some((workspace, lock))
    }
}

/// Lock manager for one workspace.
pub struct WorkspaceLockManager {
    workspace: String,
    store: Arc<dyn DocumentStore>,
    locks_by_key: RwLock<HashMap<NodeKey, Lock>>,
}

impl WorkspaceLockManager {
    fn new(workspace: &str, store: Arc<dyn DocumentStore>) -> Self {
        WorkspaceLockManager {
            workspace: workspace.to_string(),
            store,
            locks_by_key: RwLock::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// Create a lock on `node_key`.
    ///
    /// Fails with `TransientNode` when the key has no persisted document,
    /// and with `Locked` when the node, an ancestor (deep lock above), or —
    /// for a deep request — a descendant is already locked.
    pub fn lock(
        &self,
        session_id: &str,
        owner: &str,
        node_key: &NodeKey,
        deep: bool,
        session_scoped: bool,
        timeout: Option<Duration>,
    ) -> Result<Lock, RepositoryError> {
        // Only committed nodes may be locked.
        if self.store.get(node_key)?.is_none() {
            return Err(RepositoryError::TransientNode(node_key.clone()));
        }

        let now = Utc::now();
        let mut locks = self.locks_by_key.write();

        if let Some(existing) = Self::effective_lock_in(&locks, &*self.store, node_key, now)? {
            return Err(RepositoryError::Locked {
                key: node_key.clone(),
                owner: existing.owner,
            });
        }
        if deep {
            // A deep lock must not swallow an existing lock below it.
            for held in locks.values() {
                if !held.is_expired_at(now)
                    && is_ancestor(&*self.store, node_key, &held.node_key)?
                {
                    return Err(RepositoryError::Locked {
                        key: node_key.clone(),
                        owner: held.owner.clone(),
                    });
                }
            }
        }

        let lock = Lock {
            node_key: node_key.clone(),
            token: Uuid::new_v4(),
            session_id: session_id.to_string(),
            owner: owner.to_string(),
            deep,
            session_scoped,
            expires_at: timeout.map(|t| now + ChronoDuration::milliseconds(t.as_millis() as i64)),
        };
        if !session_scoped {
            self.persist(&lock)?;
        }
        locks.insert(node_key.clone(), lock.clone());
        debug!(
            workspace = %self.workspace,
            node = %node_key,
            deep,
            session_scoped,
            "Locked node"
        );
        Ok(lock)
    }

    /// Remove a lock. Returns false when no matching lock exists — a lock
    /// the reaper already expired simply is not found, which is not an
    /// error. The durable record is deleted under the same write guard, so
    /// a racing lock() can never persist a successor record only to have
    /// this removal delete it.
    pub fn unlock(&self, lock: &Lock) -> Result<bool, RepositoryError> {
        let mut locks = self.locks_by_key.write();
        match locks.get(&lock.node_key) {
            Some(held) if held.token == lock.token => {
                locks.remove(&lock.node_key);
                self.remove_record(&lock.node_key)?;
                debug!(workspace = %self.workspace, node = %lock.node_key, "Unlocked node");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// The lock governing `node_key`, if any: a direct lock on the node, or
    /// a deep lock on any ancestor. Expired locks are treated as absent even
    /// before the reaper removes them.
    pub fn find_lock(&self, node_key: &NodeKey) -> Result<Option<Lock>, RepositoryError> {
        let locks = self.locks_by_key.read();
        Self::effective_lock_in(&locks, &*self.store, node_key, Utc::now())
    }

    pub fn is_locked(&self, node_key: &NodeKey) -> Result<bool, RepositoryError> {
        Ok(self.find_lock(node_key)?.is_some())
    }

    /// Reject a write to `node_key` by anyone but the lock-owning session.
    pub fn check_writable(
        &self,
        node_key: &NodeKey,
        session_id: &str,
    ) -> Result<(), RepositoryError> {
        match self.find_lock(node_key)? {
            Some(lock) if lock.session_id != session_id => Err(RepositoryError::Locked {
                key: node_key.clone(),
                owner: lock.owner,
            }),
            _ => Ok(()),
        }
    }

    fn effective_lock_in(
        locks: &HashMap<NodeKey, Lock>,
        store: &dyn DocumentStore,
        node_key: &NodeKey,
        now: DateTime<Utc>,
    ) -> Result<Option<Lock>, RepositoryError> {
        if let Some(lock) = locks.get(node_key) {
            if !lock.is_expired_at(now) {
                return Ok(Some(lock.clone()));
            }
        }
        // Walk the parent chain looking for a live deep lock above.
        let mut current = node_key.clone();
        while let Some((doc, _)) = store.get(&current)? {
            let Some(parent) = doc.parent else { break };
            if let Some(lock) = locks.get(&parent) {
                if lock.deep && !lock.is_expired_at(now) {
                    return Ok(Some(lock.clone()));
                }
            }
            current = parent;
        }
        Ok(None)
    }

    /// Remove every expired lock. Idempotent and safe to race with
    /// lock/unlock calls.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let expired: Vec<NodeKey> = {
            let locks = self.locks_by_key.read();
            locks
                .values()
                .filter(|lock| lock.is_expired_at(now))
                .map(|lock| lock.node_key.clone())
                .collect()
        };
        let mut removed = 0;
        for key in expired {
            let mut locks = self.locks_by_key.write();
            // Re-check under the write guard; the lock may have been
            // replaced or removed since the scan. The record is removed
            // before the guard drops so a racing lock() cannot lose its
            // freshly persisted record to this sweep.
            if locks.get(&key).map(|l| l.is_expired_at(now)) == Some(true) {
                locks.remove(&key);
                self.remove_record(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(workspace = %self.workspace, removed, "Reaped expired locks");
        }
        Ok(removed)
    }

    /// Drop every session-scoped lock owned by `session_id` (logout path).
    pub fn release_session_locks(&self, session_id: &str) -> usize {
        let mut locks = self.locks_by_key.write();
        let before = locks.len();
        locks.retain(|_, lock| !(lock.session_scoped && lock.session_id == session_id));
        before - locks.len()
    }

    fn persist(&self, lock: &Lock) -> Result<(), RepositoryError> {
        let record_key = Lock::record_key(&lock.node_key);
        for attempt in 0..3 {
            let expected = self.store.get(&record_key)?.map(|(_, rev)| rev);
            if self.store.compare_and_put(
                &record_key,
                expected,
                lock.to_document(&self.workspace),
            )? {
                return Ok(());
            }
            warn!(node = %lock.node_key, attempt, "Concurrent update of lock record; retrying");
        }
        // A lock that cannot be made durable must not be granted at all.
        Err(RepositoryError::Storage(StorageError::Backend(format!(
            "could not persist lock record for {}",
            lock.node_key
        ))))
    }

    fn remove_record(&self, node_key: &NodeKey) -> Result<(), RepositoryError> {
        self.store.remove(&Lock::record_key(node_key))?;
        Ok(())
    }

    /// Reload persisted lock records for this workspace from the store's
    /// system area. Session-scoped records are never written, so everything
    /// found here is a persistent lock that survived a restart.
    fn refresh_from_store(&self) -> Result<usize, RepositoryError> {
        let mut loaded = 0;
        let mut locks = self.locks_by_key.write();
        for (key, document, _) in self.store.entries()? {
            if key.workspace_key() != SYSTEM_WORKSPACE {
                continue;
            }
            if let Some((workspace, lock)) = Lock::from_document(&document) {
                if workspace == self.workspace {
                    locks.insert(lock.node_key.clone(), lock);
                    loaded += 1;
                }
            }
        }
        if loaded > 0 {
            info!(workspace = %self.workspace, loaded, "Restored persistent locks");
        }
        Ok(loaded)
    }
}

/// True when `ancestor` lies on `descendant`'s parent chain (strictly
/// above it).
fn is_ancestor(
    store: &dyn DocumentStore,
    ancestor: &NodeKey,
    descendant: &NodeKey,
) -> Result<bool, RepositoryError> {
    let mut current = descendant.clone();
    while let Some((doc, _)) = store.get(&current)? {
        match doc.parent {
            Some(parent) if &parent == ancestor => return Ok(true),
            Some(parent) => current = parent,
            None => break,
        }
    }
    Ok(false)
}

struct ReaperHandle {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Repository-level lock manager: owns one workspace manager per workspace
/// plus the reaper schedule.
pub struct RepositoryLockManager {
    store: Arc<dyn DocumentStore>,
    workspaces: RwLock<HashMap<String, Arc<WorkspaceLockManager>>>,
    reaper: Mutex<Option<ReaperHandle>>,
}

impl RepositoryLockManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        RepositoryLockManager {
            store,
            workspaces: RwLock::new(HashMap::new()),
            reaper: Mutex::new(None),
        }
    }

    /// Get (or create) the lock manager for a workspace, restoring any
    /// persisted lock records on first access.
    pub fn workspace(&self, name: &str) -> Result<Arc<WorkspaceLockManager>, RepositoryError> {
        if let Some(manager) = self.workspaces.read().get(name) {
            return Ok(manager.clone());
        }
        let mut workspaces = self.workspaces.write();
        if let Some(manager) = workspaces.get(name) {
            return Ok(manager.clone());
        }
        let manager = Arc::new(WorkspaceLockManager::new(name, self.store.clone()));
        manager.refresh_from_store()?;
        workspaces.insert(name.to_string(), manager.clone());
        Ok(manager)
    }

    /// Lock a node. `timeout_ms` of 0 means the lock never expires.
    #[allow(clippy::too_many_arguments)]
    pub fn lock_node_in_repository(
        &self,
        workspace: &str,
        session_id: &str,
        node_key: &NodeKey,
        owner: &str,
        deep: bool,
        session_scoped: bool,
        timeout_ms: u64,
    ) -> Result<Lock, RepositoryError> {
        let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
        self.workspace(workspace)?
            .lock(session_id, owner, node_key, deep, session_scoped, timeout)
    }

    pub fn unlock_node_in_repository(
        &self,
        workspace: &str,
        lock: &Lock,
    ) -> Result<bool, RepositoryError> {
        self.workspace(workspace)?.unlock(lock)
    }

    /// One reaper pass over every workspace.
    pub fn sweep_expired(&self) -> Result<usize, RepositoryError> {
        let managers: Vec<Arc<WorkspaceLockManager>> =
            self.workspaces.read().values().cloned().collect();
        let now = Utc::now();
        let mut removed = 0;
        for manager in managers {
            removed += manager.sweep_expired(now)?;
        }
        Ok(removed)
    }

    /// Drop session-scoped locks across all workspaces (logout path).
    pub fn release_session_locks(&self, session_id: &str) -> usize {
        self.workspaces
            .read()
            .values()
            .map(|manager| manager.release_session_locks(session_id))
            .sum()
    }

    /// Start the background reaper. The task holds only a weak reference,
    /// so it stops on its own if the manager is dropped, and `shutdown`
    /// stops it deterministically.
    pub fn start_reaper(self: &Arc<Self>, interval: Duration) {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let weak: Weak<RepositoryLockManager> = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("grove-lock-reaper".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let Some(manager) = weak.upgrade() else { break };
                        if let Err(err) = manager.sweep_expired() {
                            warn!(error = %err, "Lock reaper sweep failed");
                        }
                    }
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            })
            .ok();
        if let Some(handle) = handle {
            info!(interval_ms = interval.as_millis() as u64, "Started lock reaper");
            *reaper = Some(ReaperHandle { stop_tx, handle });
        }
    }

    /// Stop the reaper, joining its thread. Idempotent.
    pub fn shutdown(&self) {
        if let Some(ReaperHandle { stop_tx, handle }) = self.reaper.lock().take() {
            let _ = stop_tx.send(());
            let _ = handle.join();
            debug!("Lock reaper stopped");
        }
    }
}
