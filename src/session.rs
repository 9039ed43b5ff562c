//! Session cache: the per-login read/write overlay over the shared store.
//!
//! Every logged-in client gets its own `SessionCache`. Reads consult the
//! session's dirty set first, then a clean read cache, then the document
//! store; writes only ever touch the dirty set, so nothing a session does is
//! visible anywhere else until `save` commits. Commits are optimistic: the
//! save aborts with a stale-state conflict if any dirty node's revision has
//! advanced in the store, and the caller refreshes and retries. A session is
//! meant for single-threaded use; mutating calls take `&mut self` and there
//! is no internal locking against concurrent callers on the same session.

use crate::bus::ChangeBus;
use crate::changes::{Change, ChangeSet};
use crate::document::Document;
use crate::error::RepositoryError;
use crate::lock::RepositoryLockManager;
use crate::store::{DocumentOperation, DocumentStore};
use crate::txn::TransactionCoordinator;
use crate::types::{NodeKey, Revision};
use crate::value::PropertyValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// Read-only view of one node as this session sees it.
#[derive(Debug, Clone)]
pub struct Node {
    key: NodeKey,
    document: Document,
}

impl Node {
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn primary_type(&self) -> &str {
        &self.document.primary_type
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.document.property(name)
    }

    pub fn parent(&self) -> Option<&NodeKey> {
        self.document.parent.as_ref()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }
}

/// Local state of one dirty node.
#[derive(Debug, Clone)]
enum SessionNode {
    /// Created in this session; no persisted document exists yet.
    New { document: Document },
    /// Mutated copy layered over the persisted document at `base_revision`.
    Changed {
        base_revision: Revision,
        document: Document,
    },
    /// Marked for removal; the persisted document was at `base_revision`.
    Removed { base_revision: Revision },
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

pub struct SessionCache {
    session_id: String,
    user_id: String,
    user_data: HashMap<String, String>,
    workspace: String,
    store: Arc<dyn DocumentStore>,
    bus: Arc<ChangeBus>,
    locks: Arc<RepositoryLockManager>,
    txn: Arc<dyn TransactionCoordinator>,
    process_key: String,
    repository_key: String,
    dirty: HashMap<NodeKey, SessionNode>,
    /// Keys in first-touch order, so commit batches and change sets are
    /// deterministic.
    dirty_order: Vec<NodeKey>,
    /// Changes recorded in mutation order, drained into the ChangeSet at
    /// save time.
    changes: Vec<Change>,
    clean: HashMap<NodeKey, (Document, Revision)>,
}

impl SessionCache {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        workspace: &str,
        user_id: &str,
        user_data: HashMap<String, String>,
        store: Arc<dyn DocumentStore>,
        bus: Arc<ChangeBus>,
        locks: Arc<RepositoryLockManager>,
        txn: Arc<dyn TransactionCoordinator>,
        process_key: &str,
        repository_key: &str,
    ) -> Self {
        SessionCache {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            user_data,
            workspace: workspace.to_string(),
            store,
            bus,
            locks,
            txn,
            process_key: process_key.to_string(),
            repository_key: repository_key.to_string(),
            dirty: HashMap::new(),
            dirty_order: Vec::new(),
            changes: Vec::new(),
            clean: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The root node key of this session's workspace.
    pub fn root_key(&self) -> NodeKey {
        NodeKey::root(&self.workspace)
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Find a node as this session sees it: the dirty set wins, then the
    /// clean cache, then the store (materializing a local read-only view).
    pub fn find_node(&mut self, key: &NodeKey) -> Result<Option<Node>, RepositoryError> {
        match self.dirty.get(key) {
            Some(SessionNode::Removed { .. }) => return Ok(None),
            Some(SessionNode::New { document })
            | Some(SessionNode::Changed { document, .. }) => {
                return Ok(Some(Node {
                    key: key.clone(),
                    document: document.clone(),
                }))
            }
            None => {}
        }
        if let Some((document, _)) = self.clean.get(key) {
            return Ok(Some(Node {
                key: key.clone(),
                document: document.clone(),
            }));
        }
        match self.store.get(key)? {
            Some((document, revision)) => {
                self.clean.insert(key.clone(), (document.clone(), revision));
                Ok(Some(Node {
                    key: key.clone(),
                    document,
                }))
            }
            None => Ok(None),
        }
    }

    /// Create a child node under `parent_key`. The new node exists only in
    /// this session until save.
    pub fn create_node(
        &mut self,
        parent_key: &NodeKey,
        name: &str,
        primary_type: &str,
    ) -> Result<Node, RepositoryError> {
        let key = NodeKey::random(key_workspace(parent_key));
        {
            let parent = self.dirty_document(parent_key)?;
            parent.add_child(name, key.clone());
        }
        let document = Document::new(primary_type, Some(parent_key.clone()));
        self.track(key.clone(), SessionNode::New {
            document: document.clone(),
        });
        self.changes.push(Change::NodeCreated {
            key: key.clone(),
            parent: Some(parent_key.clone()),
            name: name.to_string(),
        });
        trace!(session = %self.session_id, node = %key, name, "Created node");
        Ok(Node { key, document })
    }

    /// Set a property on a node visible to this session.
    pub fn set_property(
        &mut self,
        key: &NodeKey,
        name: &str,
        value: PropertyValue,
    ) -> Result<(), RepositoryError> {
        let document = self.dirty_document(key)?;
        document.set_property(name, value);
        self.changes.push(Change::PropertyChanged {
            key: key.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    /// Remove a property. A missing property is a no-op and records no
    /// change.
    pub fn remove_property(&mut self, key: &NodeKey, name: &str) -> Result<(), RepositoryError> {
        let document = self.dirty_document(key)?;
        if document.remove_property(name) {
            self.changes.push(Change::PropertyChanged {
                key: key.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a node and its entire subtree, and drop the child reference
    /// from its parent.
    pub fn remove_node(&mut self, key: &NodeKey) -> Result<(), RepositoryError> {
        let node = self
            .find_node(key)?
            .ok_or_else(|| RepositoryError::NodeNotFound(key.clone()))?;
        let Some(parent_key) = node.parent().cloned() else {
            return Err(RepositoryError::Config(
                "the root node cannot be removed".to_string(),
            ));
        };
        {
            let parent = self.dirty_document(&parent_key)?;
            parent.remove_child(key);
        }

        // Collect the subtree as this session sees it, parents first.
        let mut queue = vec![key.clone()];
        let mut subtree = Vec::new();
        while let Some(current) = queue.pop() {
            if let Some(node) = self.find_node(&current)? {
                queue.extend(node.document().children.iter().map(|c| c.key.clone()));
            }
            subtree.push(current);
        }

        for removed_key in subtree {
            let parent = if removed_key == *key {
                Some(parent_key.clone())
            } else {
                self.find_node(&removed_key)?
                    .and_then(|n| n.parent().cloned())
            };
            // A node that was never persisted vanishes silently; observers
            // must not hear about a node that never existed.
            if self.mark_removed(&removed_key)? {
                self.changes.push(Change::NodeRemoved {
                    key: removed_key,
                    parent,
                });
            }
        }
        Ok(())
    }

    /// Move `child` so it sits immediately before `before` in the parent's
    /// child list (or last, when `before` is None).
    pub fn reorder_child(
        &mut self,
        parent_key: &NodeKey,
        child: &NodeKey,
        before: Option<&NodeKey>,
    ) -> Result<(), RepositoryError> {
        let document = self.dirty_document(parent_key)?;
        if !document.reorder_child(child, before) {
            return Err(RepositoryError::NodeNotFound(child.clone()));
        }
        self.changes.push(Change::ChildrenReordered {
            parent: parent_key.clone(),
            key: child.clone(),
        });
        Ok(())
    }

    /// Commit every local mutation atomically.
    ///
    /// Validates lock ownership, then compares each dirty node's base
    /// revision against the store; any advance aborts the whole save with a
    /// stale-state conflict and writes nothing — the caller should call
    /// `refresh` and retry. On success the change set is published on the
    /// change bus and the dirty set is cleared.
    pub fn save(&mut self) -> Result<(), RepositoryError> {
        if self.dirty.is_empty() {
            return Ok(());
        }

        // Lock validation up front: a foreign lock anywhere in the dirty
        // set rejects the save before anything is staged.
        let workspace_locks = self.locks.workspace(&self.workspace)?;
        for key in &self.dirty_order {
            workspace_locks.check_writable(key, &self.session_id)?;
        }

        // Optimistic conflict detection against current store revisions.
        let mut operations = Vec::with_capacity(self.dirty_order.len());
        for key in &self.dirty_order {
            let Some(state) = self.dirty.get(key) else { continue };
            let current = self.store.get(key)?.map(|(_, rev)| rev);
            match state {
                SessionNode::New { document } => {
                    if current.is_some() {
                        return Err(RepositoryError::StaleState(key.clone()));
                    }
                    operations.push(DocumentOperation::Put {
                        key: key.clone(),
                        expected: None,
                        document: document.clone(),
                    });
                }
                SessionNode::Changed {
                    base_revision,
                    document,
                } => {
                    if current != Some(*base_revision) {
                        return Err(RepositoryError::StaleState(key.clone()));
                    }
                    operations.push(DocumentOperation::Put {
                        key: key.clone(),
                        expected: Some(*base_revision),
                        document: document.clone(),
                    });
                }
                SessionNode::Removed { base_revision } => {
                    if current != Some(*base_revision) {
                        return Err(RepositoryError::StaleState(key.clone()));
                    }
                    operations.push(DocumentOperation::Remove {
                        key: key.clone(),
                        expected: *base_revision,
                    });
                }
            }
        }

        // One atomic batch; a concurrent commit between the check above and
        // this write still surfaces as a stale revision.
        self.txn.begin()?;
        let committed = match self.store.commit(operations) {
            Ok(committed) => {
                self.txn.commit()?;
                committed
            }
            Err(err) => {
                self.txn.rollback()?;
                return Err(stale_or_storage(err));
            }
        };

        // Promote dirty state into the clean cache under the new revisions.
        let new_revisions: HashMap<NodeKey, Revision> = committed.into_iter().collect();
        for (key, state) in self.dirty.drain() {
            match state {
                SessionNode::New { document } | SessionNode::Changed { document, .. } => {
                    if let Some(revision) = new_revisions.get(&key) {
                        self.clean.insert(key, (document, *revision));
                    }
                }
                SessionNode::Removed { .. } => {
                    self.clean.remove(&key);
                }
            }
        }
        self.dirty_order.clear();

        let change_set = ChangeSet::new(
            std::mem::take(&mut self.changes),
            &self.user_id,
            self.user_data.clone(),
            Some(&self.workspace),
            &self.process_key,
            &self.repository_key,
        );
        debug!(
            session = %self.session_id,
            workspace = %self.workspace,
            changes = change_set.len(),
            "Saved session"
        );
        if !change_set.is_empty() {
            self.bus.notify(change_set);
        }
        Ok(())
    }

    /// Discard or rebase local state.
    ///
    /// `keep_changes = false` throws away every local mutation; subsequent
    /// reads reload from the store. `keep_changes = true` drops only the
    /// clean cache and rebases kept mutations onto the store's current
    /// revisions, so a conflict on unrelated nodes can be retried without
    /// losing edits. A kept mutation of a node another session has since
    /// removed becomes a re-creation; a kept removal of such a node is
    /// dropped.
    pub fn refresh(&mut self, keep_changes: bool) -> Result<(), RepositoryError> {
        self.clean.clear();
        if !keep_changes {
            self.dirty.clear();
            self.dirty_order.clear();
            self.changes.clear();
            return Ok(());
        }

        let keys: Vec<NodeKey> = self.dirty_order.clone();
        for key in keys {
            let current = self.store.get(&key)?.map(|(_, rev)| rev);
            let Some(state) = self.dirty.remove(&key) else { continue };
            let rebased = match (state, current) {
                (SessionNode::New { document }, None) => Some(SessionNode::New { document }),
                (SessionNode::New { document }, Some(revision))
                | (SessionNode::Changed { document, .. }, Some(revision)) => {
                    Some(SessionNode::Changed {
                        base_revision: revision,
                        document,
                    })
                }
                (SessionNode::Changed { document, .. }, None) => {
                    Some(SessionNode::New { document })
                }
                (SessionNode::Removed { .. }, Some(revision)) => Some(SessionNode::Removed {
                    base_revision: revision,
                }),
                (SessionNode::Removed { .. }, None) => None,
            };
            match rebased {
                Some(state) => {
                    self.dirty.insert(key, state);
                }
                None => self.dirty_order.retain(|k| k != &key),
            }
        }
        Ok(())
    }

    /// Get the mutable dirty document for a node, materializing a `Changed`
    /// entry from the persisted state on first touch.
    fn dirty_document(&mut self, key: &NodeKey) -> Result<&mut Document, RepositoryError> {
        if !self.dirty.contains_key(key) {
            let (document, revision) = match self.clean.get(key) {
                Some(entry) => entry.clone(),
                None => self
                    .store
                    .get(key)?
                    .ok_or_else(|| RepositoryError::NodeNotFound(key.clone()))?,
            };
            self.track(key.clone(), SessionNode::Changed {
                base_revision: revision,
                document,
            });
        }
        match self.dirty.get_mut(key) {
            Some(SessionNode::New { document })
            | Some(SessionNode::Changed { document, .. }) => Ok(document),
            _ => Err(RepositoryError::NodeNotFound(key.clone())),
        }
    }

    /// Returns true when a removal should be reported to observers, false
    /// when the node was never persisted and is simply forgotten.
    fn mark_removed(&mut self, key: &NodeKey) -> Result<bool, RepositoryError> {
        match self.dirty.get(key) {
            Some(SessionNode::New { .. }) => {
                // Never persisted; forget it entirely, along with every
                // change recorded about it.
                self.dirty.remove(key);
                self.dirty_order.retain(|k| k != key);
                self.changes.retain(|change| {
                    change.key() != key
                        && !matches!(change, Change::ChildrenReordered { parent, .. } if parent == key)
                });
                Ok(false)
            }
            Some(SessionNode::Changed { base_revision, .. }) => {
                let base_revision = *base_revision;
                self.dirty
                    .insert(key.clone(), SessionNode::Removed { base_revision });
                Ok(true)
            }
            Some(SessionNode::Removed { .. }) => Ok(true),
            None => {
                let (_, revision) = match self.clean.get(key) {
                    Some(entry) => entry.clone(),
                    None => self
                        .store
                        .get(key)?
                        .ok_or_else(|| RepositoryError::NodeNotFound(key.clone()))?,
                };
                self.track(key.clone(), SessionNode::Removed {
                    base_revision: revision,
                });
                Ok(true)
            }
        }
    }

    fn track(&mut self, key: NodeKey, state: SessionNode) {
        if !self.dirty.contains_key(&key) {
            self.dirty_order.push(key.clone());
        }
        self.dirty.insert(key, state);
    }
}

impl Drop for SessionCache {
    fn drop(&mut self) {
        // Session-scoped locks die with the session.
        let released = self.locks.release_session_locks(&self.session_id);
        if released > 0 {
            debug!(session = %self.session_id, released, "Released session-scoped locks");
        }
    }
}

fn key_workspace(key: &NodeKey) -> &str {
    key.workspace_key()
}

fn stale_or_storage(err: crate::error::StorageError) -> RepositoryError {
    match err {
        crate::error::StorageError::StaleRevision { key, .. } => RepositoryError::StaleState(key),
        other => RepositoryError::Storage(other),
    }
}
