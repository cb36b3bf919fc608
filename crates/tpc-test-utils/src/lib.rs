//! Testing utilities for TPC workspace
//!
//! In-memory host store, project, and fixtures.

#![allow(missing_docs)]

mod memory;

pub use memory::{CommitRecord, ConflictPolicy, MemNode, MemoryStore, StoreOp, DEFAULT_BRANCH};

use std::collections::HashMap;
use std::sync::Arc;
use tpc_model::{HostStore, NodeRef, Project, Value};

/// Store with a checked-out root and its meta nodes
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub root: MemNode,
    pub meta: HashMap<String, MemNode>,
}

impl Fixture {
    /// Check out the head of [`DEFAULT_BRANCH`] of a store seeded with `meta`
    pub async fn new(meta: &[&str]) -> Self {
        Self::from_store(Arc::new(MemoryStore::with_meta(meta))).await
    }

    /// Check out the head of [`DEFAULT_BRANCH`] of an existing store
    pub async fn from_store(store: Arc<MemoryStore>) -> Self {
        let head = store.branch_head(DEFAULT_BRANCH).await.unwrap();
        let root_hash = store.root_of(&head).await.unwrap();
        let root = store.load_root(&root_hash).await.unwrap();

        let mut meta = HashMap::new();
        for name in store.meta_names() {
            if let Some(path) = store.meta_path(&name) {
                let node = store.load_by_path(&root, &path).await.unwrap().unwrap();
                meta.insert(name, node);
            }
        }

        Self { store, root, meta }
    }

    /// Meta node by name, as a real handle
    pub fn meta(&self, name: &str) -> MemNode {
        self.meta
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("no meta node named {name}"))
    }

    /// Meta node by name, wrapped for the staging overlay
    pub fn meta_ref(&self, name: &str) -> NodeRef<MemNode> {
        NodeRef::Real(self.meta(name))
    }

    /// Root wrapped for the staging overlay
    pub fn root_ref(&self) -> NodeRef<MemNode> {
        NodeRef::Real(self.root.clone())
    }

    /// Create a node directly in the checked-out tree, bypassing any overlay
    pub fn create_real(&self, meta: &str, name: &str) -> MemNode {
        let node = self.store.create_node(&self.meta(meta), &self.root).unwrap();
        self.store
            .set_attribute(&node, "name", Value::from(name))
            .unwrap();
        node
    }
}

/// Install a test subscriber once; honors `RUST_LOG`
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
