//! Host store boundary
//!
//! [`HostStore`] is the versioned, tree-structured model repository that the
//! staging overlay writes through. Getters and writes act on an already
//! loaded root and are synchronous; loading and persisting may suspend.

use crate::error::StoreError;
use crate::id::NodeId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Debug, Display, Formatter};

/// Content hash of a persisted root
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RootHash(String);

impl RootHash {
    /// Wrap a hash string
    #[inline]
    #[must_use]
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Hash as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RootHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of persisting a root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persisted {
    /// Hash of the persisted root
    pub root_hash: RootHash,
    /// Hashes of the objects written while persisting
    pub objects: Vec<String>,
}

/// Versioned, tree-structured model store
///
/// Node handles are snapshots bound to the root they were loaded from; a
/// commit invalidates every handle of the previous root.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// Node handle type
    type Node: Clone + Debug + Send + Sync + 'static;

    /// Load the root node of a persisted tree
    async fn load_root(&self, hash: &RootHash) -> Result<Self::Node, StoreError>;

    /// Load a node by path under `root`
    async fn load_by_path(
        &self,
        root: &Self::Node,
        path: &NodeId,
    ) -> Result<Option<Self::Node>, StoreError>;

    /// Load the node at `path` and all its descendants
    async fn load_subtree(
        &self,
        root: &Self::Node,
        path: &NodeId,
    ) -> Result<Vec<Self::Node>, StoreError>;

    /// Load the direct children of a node
    async fn load_children(&self, node: &Self::Node) -> Result<Vec<Self::Node>, StoreError>;

    /// Persist the tree under `root`
    async fn persist(&self, root: &Self::Node) -> Result<Persisted, StoreError>;

    /// Drop a checked-out tree; handles under `root` become invalid
    fn release(&self, root: &Self::Node) {
        let _ = root;
    }

    /// Path of a node
    fn get_path(&self, node: &Self::Node) -> NodeId;

    /// Container of a node
    fn get_parent(&self, node: &Self::Node) -> Option<Self::Node>;

    /// Base (type) of a node
    fn get_base(&self, node: &Self::Node) -> Option<Self::Node>;

    /// Closest meta node on the base chain, including the node itself
    fn get_meta_type(&self, node: &Self::Node) -> Option<Self::Node>;

    /// Check if `base` is on the base chain of `node`, including `node`
    fn is_type_of(&self, node: &Self::Node, base: &Self::Node) -> bool;

    /// Check if the node is part of the meta model
    fn is_meta_node(&self, node: &Self::Node) -> bool;

    /// Namespace of a node
    fn get_namespace(&self, node: &Self::Node) -> String;

    /// Attribute value, inherited through the base chain when not set
    fn get_attribute(&self, node: &Self::Node, name: &str) -> Option<Value>;

    /// Attribute value set on the node itself
    fn get_own_attribute(&self, node: &Self::Node, name: &str) -> Option<Value>;

    /// Registry value set on the node itself
    fn get_own_registry(&self, node: &Self::Node, name: &str) -> Option<Value>;

    /// Target path of a pointer, inherited through the base chain
    fn get_pointer_path(&self, node: &Self::Node, name: &str) -> Option<NodeId>;

    /// Paths of the direct children
    fn get_children_paths(&self, node: &Self::Node) -> Vec<NodeId>;

    /// Containment rules of a meta node
    fn get_children_meta(&self, node: &Self::Node) -> Option<Value>;

    /// Names of attributes set on the node itself
    fn get_own_attribute_names(&self, node: &Self::Node) -> Vec<String>;

    /// Names of pointers set on the node itself
    fn get_own_pointer_names(&self, node: &Self::Node) -> Vec<String>;

    /// Attribute names the meta model allows on the node
    fn get_valid_attribute_names(&self, node: &Self::Node) -> Vec<String>;

    /// Pointer names the meta model allows on the node
    fn get_valid_pointer_names(&self, node: &Self::Node) -> Vec<String>;

    /// Create a node under `parent` deriving from `base`
    fn create_node(&self, base: &Self::Node, parent: &Self::Node)
        -> Result<Self::Node, StoreError>;

    /// Set an attribute
    fn set_attribute(&self, node: &Self::Node, name: &str, value: Value)
        -> Result<(), StoreError>;

    /// Delete an attribute so it falls back to the inherited value
    fn delete_attribute(&self, node: &Self::Node, name: &str) -> Result<(), StoreError>;

    /// Set a pointer
    fn set_pointer(
        &self,
        node: &Self::Node,
        name: &str,
        target: &Self::Node,
    ) -> Result<(), StoreError>;

    /// Delete a node and its subtree
    fn delete_node(&self, node: &Self::Node) -> Result<(), StoreError>;

    /// Add a member to a named set
    fn add_member(
        &self,
        node: &Self::Node,
        set_name: &str,
        member: &Self::Node,
    ) -> Result<(), StoreError>;
}
