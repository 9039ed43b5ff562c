//! Persisted node documents.
//!
//! A `Document` is the durable record of one node: its primary type, typed
//! properties, ordered child references, and parent back-reference. Documents
//! are treated as immutable once written to the store; every mutation a
//! session commits produces a new version under the same key with a bumped
//! revision. All node-to-node relationships are `NodeKey` lookups, never
//! in-memory pointers, so moves are pure re-keying with no dangling edges.

use crate::types::NodeKey;
use crate::value::PropertyValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named, ordered reference from a parent document to one child.
///
/// Same-name siblings are allowed; their 1-based index is not stored but
/// recomputed lazily from the list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildReference {
    pub name: String,
    pub key: NodeKey,
}

/// The persisted record for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary node type name, e.g. "nt:unstructured".
    pub primary_type: String,
    pub properties: BTreeMap<String, PropertyValue>,
    pub children: Vec<ChildReference>,
    pub parent: Option<NodeKey>,
}

impl Document {
    pub fn new(primary_type: &str, parent: Option<NodeKey>) -> Self {
        Document {
            primary_type: primary_type.to_string(),
            properties: BTreeMap::new(),
            children: Vec::new(),
            parent,
        }
    }

    pub fn set_property(&mut self, name: &str, value: PropertyValue) {
        self.properties.insert(name.to_string(), value);
    }

    /// Remove a property, returning true if it was present.
    pub fn remove_property(&mut self, name: &str) -> bool {
        self.properties.remove(name).is_some()
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Append a child reference at the end of the child list.
    pub fn add_child(&mut self, name: &str, key: NodeKey) {
        self.children.push(ChildReference {
            name: name.to_string(),
            key,
        });
    }

    /// Remove the child reference for `key`, returning true if it existed.
    pub fn remove_child(&mut self, key: &NodeKey) -> bool {
        let before = self.children.len();
        self.children.retain(|c| &c.key != key);
        self.children.len() != before
    }

    pub fn child(&self, key: &NodeKey) -> Option<&ChildReference> {
        self.children.iter().find(|c| &c.key == key)
    }

    /// Find the first child with the given name and same-name-sibling index
    /// (1-based).
    pub fn child_by_name(&self, name: &str, sns_index: usize) -> Option<&ChildReference> {
        self.children
            .iter()
            .filter(|c| c.name == name)
            .nth(sns_index.saturating_sub(1))
    }

    /// Same-name-sibling index of a child, recomputed from list order.
    /// Index 1 means the first (or only) sibling with that name.
    pub fn sns_index(&self, key: &NodeKey) -> Option<usize> {
        let child = self.child(key)?;
        let index = self
            .children
            .iter()
            .take_while(|c| &c.key != key)
            .filter(|c| c.name == child.name)
            .count();
        Some(index + 1)
    }

    /// Path segment for a child: the bare name when the SNS index is 1
    /// (implicit), `name[n]` when it is 2 or greater.
    pub fn segment(&self, key: &NodeKey) -> Option<String> {
        let child = self.child(key)?;
        match self.sns_index(key)? {
            1 => Some(child.name.clone()),
            n => Some(format!("{}[{}]", child.name, n)),
        }
    }

    /// Move `key` so it sits immediately before `before`, or to the end of
    /// the child list when `before` is None. Returns false when either key
    /// is not a child.
    pub fn reorder_child(&mut self, key: &NodeKey, before: Option<&NodeKey>) -> bool {
        let Some(from) = self.children.iter().position(|c| &c.key == key) else {
            return false;
        };
        let moved = self.children.remove(from);
        match before {
            None => {
                self.children.push(moved);
                true
            }
            Some(before_key) => {
                match self.children.iter().position(|c| &c.key == before_key) {
                    Some(to) => {
                        self.children.insert(to, moved);
                        true
                    }
                    None => {
                        // Restore the original order rather than losing the child.
                        self.children.insert(from, moved);
                        false
                    }
                }
            }
        }
    }
}
