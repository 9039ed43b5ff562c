//! Change sets produced by committed saves.
//!
//! A `ChangeSet` is the immutable record of one successful commit: an
//! ordered list of atomic `Change` facts plus the metadata observers need
//! (user, workspace, timestamp, originating process and repository). Change
//! sets are what travels over the change bus.

use crate::types::NodeKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One atomic fact about one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    NodeCreated {
        key: NodeKey,
        parent: Option<NodeKey>,
        name: String,
    },
    NodeRemoved {
        key: NodeKey,
        parent: Option<NodeKey>,
    },
    PropertyChanged {
        key: NodeKey,
        name: String,
    },
    ChildrenReordered {
        parent: NodeKey,
        key: NodeKey,
    },
}

impl Change {
    /// The node this change is about.
    pub fn key(&self) -> &NodeKey {
        match self {
            Change::NodeCreated { key, .. } => key,
            Change::NodeRemoved { key, .. } => key,
            Change::PropertyChanged { key, .. } => key,
            Change::ChildrenReordered { key, .. } => key,
        }
    }
}

/// An ordered, timestamped batch of changes from one commit.
///
/// Equality is defined over workspace name + timestamp, not content; that is
/// what ordering checks between change sets compare.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    changes: Vec<Change>,
    user_id: String,
    user_data: HashMap<String, String>,
    timestamp: DateTime<Utc>,
    /// None for workspace-less change sets (e.g. namespace registration).
    workspace: Option<String>,
    process_key: String,
    repository_key: String,
}

impl ChangeSet {
    pub fn new(
        changes: Vec<Change>,
        user_id: &str,
        user_data: HashMap<String, String>,
        workspace: Option<&str>,
        process_key: &str,
        repository_key: &str,
    ) -> Self {
        ChangeSet {
            changes,
            user_id: user_id.to_string(),
            user_data,
            timestamp: Utc::now(),
            workspace: workspace.map(str::to_string),
            process_key: process_key.to_string(),
            repository_key: repository_key.to_string(),
        }
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn user_data(&self) -> &HashMap<String, String> {
        &self.user_data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    pub fn process_key(&self) -> &str {
        &self.process_key
    }

    pub fn repository_key(&self) -> &str {
        &self.repository_key
    }
}

impl PartialEq for ChangeSet {
    fn eq(&self, other: &Self) -> bool {
        self.workspace == other.workspace && self.timestamp == other.timestamp
    }
}

impl Eq for ChangeSet {}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}
