//! Named node caches
//!
//! Node handles are bound to the root they were loaded from, so every cache
//! registered with the orchestrator is reloaded after each commit.

use indexmap::IndexMap;
use std::fmt;
use tpc_model::NodeRef;

/// Dictionary of node handles by key
pub struct NodeCache<N> {
    entries: IndexMap<String, NodeRef<N>>,
}

impl<N> NodeCache<N> {
    /// Create empty cache
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, key: impl Into<String>, node: NodeRef<N>) -> Option<NodeRef<N>> {
        self.entries.insert(key.into(), node)
    }

    /// Entry by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&NodeRef<N>> {
        self.entries.get(key)
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &str) -> Option<NodeRef<N>> {
        self.entries.shift_remove(key)
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeRef<N>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Clone> Clone for NodeCache<N> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<N> Default for NodeCache<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: fmt::Debug> fmt::Debug for NodeCache<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl<N, K: Into<String>> FromIterator<(K, NodeRef<N>)> for NodeCache<N> {
    fn from_iter<I: IntoIterator<Item = (K, NodeRef<N>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order() {
        let mut cache: NodeCache<u32> = [("b", NodeRef::Real(2)), ("a", NodeRef::Real(1))]
            .into_iter()
            .collect();
        cache.insert("c", NodeRef::Real(3));
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["b", "a", "c"]);

        cache.remove("a");
        assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(cache.get("c").and_then(NodeRef::as_real), Some(&3));
        assert_eq!(cache.len(), 2);
    }
}
