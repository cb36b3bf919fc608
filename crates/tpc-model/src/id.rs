//! Node identities
//!
//! Provides [`NodeId`] for persisted nodes, [`TempId`] for nodes that only
//! exist in a staging buffer, and [`NodeKey`] which tags either one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

/// Path of a persisted node inside the host store
///
/// Paths are `/`-separated relative ids; the root node has the empty path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct NodeId(String);

impl NodeId {
    /// Create node id from a path string
    #[inline]
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Path of the root node
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Path as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if this is the root path
    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Path of a child with the given relative id
    #[inline]
    #[must_use]
    pub fn child(&self, relid: impl Display) -> Self {
        Self(format!("{}/{}", self.0, relid))
    }

    /// Parent path (if not root)
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        self.0.rfind('/').map(|idx| Self(self.0[..idx].to_string()))
    }

    /// Check if `self` is `other` or one of its ancestors
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        if self.is_root() || self == other {
            return true;
        }
        other
            .0
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for NodeId {
    fn from(path: String) -> Self {
        Self(path)
    }
}

static NEXT_TEMP_ID: AtomicU64 = AtomicU64::new(1);

/// Temporary identity of a node that has not been persisted yet
///
/// Temp ids are process-unique and render as `created_node_<n>`, so they can
/// never be mistaken for a host-store path (which is empty or starts with `/`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TempId(u64);

impl TempId {
    /// Prefix shared by every rendered temp id
    pub const PREFIX: &'static str = "created_node_";

    /// Allocate a fresh temp id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TEMP_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Parse a rendered temp id
    ///
    /// Returns `None` for anything that does not carry the temp id prefix.
    #[must_use]
    pub fn parse(id: &str) -> Option<Self> {
        id.strip_prefix(Self::PREFIX)?.parse().ok().map(Self)
    }

    /// Check whether a string looks like a rendered temp id
    #[inline]
    #[must_use]
    pub fn is_temp_id(id: &str) -> bool {
        Self::parse(id).is_some()
    }

    /// Raw counter value
    #[inline]
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl Display for TempId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

/// Identity of a node as seen by a staging buffer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeKey {
    /// Node that exists in the host store
    Real(NodeId),
    /// Node that only exists in a buffer
    Temp(TempId),
}

impl NodeKey {
    /// Check if this key names a pending node
    #[inline]
    #[must_use]
    pub fn is_temp(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    /// Real path, if persisted
    #[inline]
    #[must_use]
    pub fn as_real(&self) -> Option<&NodeId> {
        match self {
            Self::Real(id) => Some(id),
            Self::Temp(_) => None,
        }
    }

    /// Temp id, if pending
    #[inline]
    #[must_use]
    pub fn as_temp(&self) -> Option<TempId> {
        match self {
            Self::Temp(id) => Some(*id),
            Self::Real(_) => None,
        }
    }

    /// Replace a temp key with its resolved real id
    ///
    /// Real keys and unresolved temp keys are returned unchanged.
    #[must_use]
    pub fn resolved(&self, ids: &TempIdMap) -> Self {
        match self {
            Self::Temp(temp) => ids
                .get(temp)
                .map_or_else(|| self.clone(), |id| Self::Real(id.clone())),
            Self::Real(_) => self.clone(),
        }
    }
}

impl Display for NodeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(id) => Display::fmt(id, f),
            Self::Temp(id) => Display::fmt(id, f),
        }
    }
}

impl From<NodeId> for NodeKey {
    fn from(id: NodeId) -> Self {
        Self::Real(id)
    }
}

impl From<TempId> for NodeKey {
    fn from(id: TempId) -> Self {
        Self::Temp(id)
    }
}

/// Mapping of resolved temp ids to the real ids they were persisted under
pub type TempIdMap = HashMap<TempId, NodeId>;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn temp_ids_are_unique_and_prefixed() {
        let a = TempId::next();
        let b = TempId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with(TempId::PREFIX));
    }

    #[test]
    fn temp_id_parse_rejects_paths() {
        assert!(TempId::parse("/1/2").is_none());
        assert!(TempId::parse("").is_none());
        assert!(TempId::parse("created_node_").is_none());
        assert!(TempId::parse("created_node_x1").is_none());
        assert!(!TempId::is_temp_id("/created_node_1"));
    }

    #[test]
    fn node_id_parent_and_child() {
        let root = NodeId::root();
        let child = root.child(3);
        assert_eq!(child.as_str(), "/3");
        assert_eq!(child.child("a").parent(), Some(child.clone()));
        assert_eq!(child.parent(), Some(root.clone()));
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn node_id_contains() {
        let a = NodeId::new("/1");
        assert!(a.contains(&NodeId::new("/1/2")));
        assert!(a.contains(&a));
        assert!(!a.contains(&NodeId::new("/12")));
        assert!(NodeId::root().contains(&a));
    }

    #[test]
    fn key_resolution() {
        let temp = TempId::next();
        let mut ids = TempIdMap::new();
        let key = NodeKey::Temp(temp);
        assert_eq!(key.resolved(&ids), key);

        ids.insert(temp, NodeId::new("/7"));
        assert_eq!(key.resolved(&ids), NodeKey::Real(NodeId::new("/7")));
        assert!(key.is_temp());
    }

    proptest! {
        #[test]
        fn prop_children_are_contained(
            segments in proptest::collection::vec(1u32..50, 0..6),
            relid in 1u32..50,
        ) {
            let parent = segments.iter().fold(NodeId::root(), |acc, seg| acc.child(seg));
            let child = parent.child(relid);
            prop_assert!(parent.contains(&child));
            prop_assert!(!child.contains(&parent));
            prop_assert_eq!(child.parent(), Some(parent));
        }
    }
}
