//! Core identifier types for the grove content repository.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Revision: monotonically increasing version counter for a stored document,
/// used for optimistic conflict detection at save time.
pub type Revision = u64;

/// NodeKey: stable, workspace-scoped identifier for a tree node.
///
/// Keys are stable across moves and renames, and because the identifier part
/// is a UUID they are never reused after a node is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(String);

impl NodeKey {
    /// Create a key from a workspace key and an identifier.
    pub fn new(workspace_key: &str, identifier: &str) -> Self {
        NodeKey(format!("{}:{}", workspace_key, identifier))
    }

    /// Generate a fresh key within the given workspace.
    pub fn random(workspace_key: &str) -> Self {
        Self::new(workspace_key, &Uuid::new_v4().to_string())
    }

    /// The well-known root node key for a workspace.
    pub fn root(workspace_key: &str) -> Self {
        Self::new(workspace_key, "root")
    }

    /// The workspace portion of this key.
    pub fn workspace_key(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The identifier portion of this key.
    pub fn identifier(&self) -> &str {
        self.0.split_once(':').map(|(_, id)| id).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(s: &str) -> Self {
        NodeKey(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parts() {
        let key = NodeKey::new("default", "abc-123");
        assert_eq!(key.workspace_key(), "default");
        assert_eq!(key.identifier(), "abc-123");
        assert_eq!(key.to_string(), "default:abc-123");
    }

    #[test]
    fn test_random_keys_are_unique() {
        let a = NodeKey::random("ws");
        let b = NodeKey::random("ws");
        assert_ne!(a, b);
        assert_eq!(a.workspace_key(), b.workspace_key());
    }

    #[test]
    fn test_root_key_is_stable() {
        assert_eq!(NodeKey::root("ws"), NodeKey::root("ws"));
    }
}
