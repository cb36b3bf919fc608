//! In-memory versioned tree store
//!
//! [`MemoryStore`] implements both [`HostStore`] and [`Project`]. Every
//! `load_root` checks out a private working copy of a persisted tree, so node
//! handles stay bound to the root they were loaded from, and persisting hashes
//! the working copy into a new immutable snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tpc_model::{
    CommitHash, CommitResult, CommitStatus, HostStore, NodeId, Persisted, Project, RootHash,
    SaveRequest, StoreError, Value,
};

/// Branch every store starts with
pub const DEFAULT_BRANCH: &str = "master";

/// Handle to a node of one working tree
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemNode {
    tree: u64,
    path: NodeId,
}

impl MemNode {
    /// Working tree this handle is bound to
    #[inline]
    #[must_use]
    pub fn tree(&self) -> u64 {
        self.tree
    }

    /// Path of the node
    #[inline]
    #[must_use]
    pub fn path(&self) -> &NodeId {
        &self.path
    }
}

/// What to do when a commit's parent is no longer the branch head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Merge onto the head (the committed root wins)
    #[default]
    Merge,
    /// Put the commit on a new branch
    Fork,
}

/// Mutating or lifecycle operation observed by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Working tree checked out from a persisted root
    LoadRoot { tree: u64, root: RootHash },
    /// Node created
    Create { tree: u64, path: NodeId },
    /// Attribute set
    SetAttribute { tree: u64, path: NodeId, name: String },
    /// Attribute deleted
    DeleteAttribute { tree: u64, path: NodeId, name: String },
    /// Pointer set
    SetPointer { tree: u64, path: NodeId, name: String, target: NodeId },
    /// Node deleted
    DeleteNode { tree: u64, path: NodeId },
    /// Set member added
    AddMember { tree: u64, path: NodeId, set: String },
    /// Working tree persisted
    Persist { tree: u64, root: RootHash },
    /// Working tree dropped
    Release { tree: u64 },
    /// Commit made
    Save { branch: String, status: CommitStatus },
}

impl StoreOp {
    /// Working tree the operation touched, if any
    #[must_use]
    pub fn tree(&self) -> Option<u64> {
        match self {
            Self::LoadRoot { tree, .. }
            | Self::Create { tree, .. }
            | Self::SetAttribute { tree, .. }
            | Self::DeleteAttribute { tree, .. }
            | Self::SetPointer { tree, .. }
            | Self::DeleteNode { tree, .. }
            | Self::AddMember { tree, .. }
            | Self::Persist { tree, .. }
            | Self::Release { tree } => Some(*tree),
            Self::Save { .. } => None,
        }
    }

    /// Check if the operation changed node data
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Create { .. }
                | Self::SetAttribute { .. }
                | Self::DeleteAttribute { .. }
                | Self::SetPointer { .. }
                | Self::DeleteNode { .. }
                | Self::AddMember { .. }
        )
    }
}

/// Commit stored in the project
#[derive(Debug, Clone)]
pub struct CommitRecord {
    /// Committed root
    pub root: RootHash,
    /// Parent commits
    pub parents: Vec<CommitHash>,
    /// Commit message
    pub message: String,
    /// Commit time
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct NodeRecord {
    parent: Option<NodeId>,
    base: Option<NodeId>,
    meta: bool,
    attributes: BTreeMap<String, Value>,
    registry: BTreeMap<String, Value>,
    pointers: BTreeMap<String, NodeId>,
    sets: BTreeMap<String, BTreeSet<NodeId>>,
    children_meta: Option<Value>,
    valid_attributes: BTreeSet<String>,
    valid_pointers: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Tree {
    nodes: BTreeMap<NodeId, NodeRecord>,
    next_relid: u64,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(NodeId::root(), NodeRecord::default());
        Self {
            nodes,
            next_relid: 0,
        }
    }
}

impl Tree {
    /// Base chain of a node, starting with the node itself
    fn base_chain(&self, path: &NodeId) -> Vec<&NodeId> {
        let mut chain = Vec::new();
        let mut current = self.nodes.get_key_value(path);
        while let Some((id, record)) = current {
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            current = record
                .base
                .as_ref()
                .and_then(|base| self.nodes.get_key_value(base));
        }
        chain
    }

    fn inherited<'a, T>(
        &'a self,
        path: &NodeId,
        pick: impl Fn(&'a NodeRecord) -> Option<&'a T>,
    ) -> Option<&'a T> {
        self.base_chain(path)
            .into_iter()
            .find_map(|id| self.nodes.get(id).and_then(&pick))
    }

    fn children(&self, path: &NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, record)| record.parent.as_ref() == Some(path))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn record_mut(&mut self, path: &NodeId) -> Result<&mut NodeRecord, StoreError> {
        self.nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::InvalidNode(path.clone()))
    }

    fn add_node(&mut self, parent: &NodeId, base: Option<NodeId>) -> NodeId {
        self.next_relid += 1;
        let path = parent.child(self.next_relid);
        self.nodes.insert(
            path.clone(),
            NodeRecord {
                parent: Some(parent.clone()),
                base,
                ..NodeRecord::default()
            },
        );
        path
    }

    fn hash(&self) -> Result<(RootHash, Vec<String>), StoreError> {
        let bytes = serde_json::to_vec(self).map_err(|e| StoreError::Io(e.to_string()))?;
        let objects = self
            .nodes
            .values()
            .map(|record| {
                serde_json::to_vec(record)
                    .map(|bytes| blake3::hash(&bytes).to_hex().to_string())
                    .map_err(|e| StoreError::Io(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((RootHash::new(blake3::hash(&bytes).to_hex().to_string()), objects))
    }
}

#[derive(Debug)]
struct WorkingTree {
    tree: Tree,
}

/// In-memory host store and project
#[derive(Debug)]
pub struct MemoryStore {
    snapshots: DashMap<RootHash, Arc<Tree>>,
    working: DashMap<u64, WorkingTree>,
    origins: DashMap<u64, RootHash>,
    next_tree: AtomicU64,
    commits: DashMap<CommitHash, CommitRecord>,
    branches: DashMap<String, CommitHash>,
    meta_paths: RwLock<HashMap<String, NodeId>>,
    policy: RwLock<ConflictPolicy>,
    injected_failures: Mutex<VecDeque<StoreError>>,
    journal: Mutex<Vec<StoreOp>>,
    commit_counter: AtomicU64,
}

impl MemoryStore {
    /// Create store with an empty root committed on [`DEFAULT_BRANCH`]
    #[must_use]
    pub fn new() -> Self {
        Self::from_tree(Tree::default(), HashMap::new())
    }

    /// Create store whose meta model holds `FCO` plus one node per name
    ///
    /// Every meta node carries a `name` attribute and allows the `name`
    /// attribute; non-FCO meta nodes derive from `FCO`.
    #[must_use]
    pub fn with_meta(names: &[&str]) -> Self {
        let mut tree = Tree::default();
        let mut meta_paths = HashMap::new();
        let root = NodeId::root();

        let fco = tree.add_node(&root, None);
        if let Some(record) = tree.nodes.get_mut(&fco) {
            record.meta = true;
            record.attributes.insert("name".into(), Value::from("FCO"));
            record.valid_attributes.insert("name".into());
        }
        meta_paths.insert("FCO".to_string(), fco.clone());

        for name in names {
            let path = tree.add_node(&root, Some(fco.clone()));
            if let Some(record) = tree.nodes.get_mut(&path) {
                record.meta = true;
                record.attributes.insert("name".into(), Value::from(*name));
            }
            meta_paths.insert((*name).to_string(), path);
        }

        Self::from_tree(tree, meta_paths)
    }

    fn from_tree(tree: Tree, meta_paths: HashMap<String, NodeId>) -> Self {
        let store = Self {
            snapshots: DashMap::new(),
            working: DashMap::new(),
            origins: DashMap::new(),
            next_tree: AtomicU64::new(1),
            commits: DashMap::new(),
            branches: DashMap::new(),
            meta_paths: RwLock::new(meta_paths),
            policy: RwLock::new(ConflictPolicy::default()),
            injected_failures: Mutex::new(VecDeque::new()),
            journal: Mutex::new(Vec::new()),
            commit_counter: AtomicU64::new(0),
        };

        // Serializing an in-memory tree of strings and JSON values cannot fail
        let (root, _) = tree.hash().unwrap_or_else(|_| (RootHash::new("empty"), Vec::new()));
        store.snapshots.insert(root.clone(), Arc::new(tree));
        let commit = store.record_commit(root, Vec::new(), "initial commit");
        store.branches.insert(DEFAULT_BRANCH.to_string(), commit);
        store
    }

    /// Path of a meta node created by [`MemoryStore::with_meta`]
    #[must_use]
    pub fn meta_path(&self, name: &str) -> Option<NodeId> {
        self.meta_paths.read().get(name).cloned()
    }

    /// Names of all meta nodes created by [`MemoryStore::with_meta`]
    #[must_use]
    pub fn meta_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.meta_paths.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Change how diverged commits are integrated
    pub fn set_conflict_policy(&self, policy: ConflictPolicy) {
        *self.policy.write() = policy;
    }

    /// Make the next project save fail with `error`
    pub fn fail_next_save(&self, error: StoreError) {
        self.injected_failures.lock().push_back(error);
    }

    /// Operations observed so far
    #[must_use]
    pub fn journal(&self) -> Vec<StoreOp> {
        self.journal.lock().clone()
    }

    /// Forget observed operations
    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Head commit of a branch
    #[must_use]
    pub fn head(&self, branch: &str) -> Option<CommitHash> {
        self.branches.get(branch).map(|head| head.clone())
    }

    /// Commit record
    #[must_use]
    pub fn commit_record(&self, hash: &CommitHash) -> Option<CommitRecord> {
        self.commits.get(hash).map(|record| record.clone())
    }

    /// Number of working trees currently checked out
    #[must_use]
    pub fn checked_out(&self) -> usize {
        self.working.len()
    }

    /// Root a working tree was checked out from; kept after release
    #[must_use]
    pub fn loaded_from(&self, tree: u64) -> Option<RootHash> {
        self.origins.get(&tree).map(|root| root.clone())
    }

    /// Every node path of a committed tree
    #[must_use]
    pub fn paths_at(&self, commit: &CommitHash) -> Vec<NodeId> {
        self.snapshot_at(commit)
            .map(|tree| tree.nodes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Paths of nodes in a committed tree whose own `name` attribute matches
    #[must_use]
    pub fn find_by_name(&self, commit: &CommitHash, name: &str) -> Vec<NodeId> {
        self.snapshot_at(commit)
            .map(|tree| {
                tree.nodes
                    .iter()
                    .filter(|(_, record)| {
                        record.attributes.get("name").and_then(Value::as_str) == Some(name)
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Inherited attribute of a node in a committed tree
    #[must_use]
    pub fn attribute_at(&self, commit: &CommitHash, path: &NodeId, name: &str) -> Option<Value> {
        let tree = self.snapshot_at(commit)?;
        tree.inherited(path, |record| record.attributes.get(name))
            .cloned()
    }

    /// Own pointer target of a node in a committed tree
    #[must_use]
    pub fn pointer_at(&self, commit: &CommitHash, path: &NodeId, name: &str) -> Option<NodeId> {
        let tree = self.snapshot_at(commit)?;
        tree.nodes.get(path)?.pointers.get(name).cloned()
    }

    /// Parent of a node in a committed tree
    #[must_use]
    pub fn parent_at(&self, commit: &CommitHash, path: &NodeId) -> Option<NodeId> {
        let tree = self.snapshot_at(commit)?;
        tree.nodes.get(path)?.parent.clone()
    }

    /// Commit changes on behalf of another actor
    ///
    /// Checks out the head of `branch`, runs `edit` against it, then
    /// persists and fast-forwards the branch.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the branch is unknown or `edit` fails.
    pub async fn advance_branch<F>(
        &self,
        branch: &str,
        message: &str,
        edit: F,
    ) -> Result<CommitHash, StoreError>
    where
        F: FnOnce(&Self, &MemNode) -> Result<(), StoreError> + Send,
    {
        let head = self.branch_head(branch).await?;
        let root_hash = self.root_of(&head).await?;
        let root = self.load_root(&root_hash).await?;
        let edited = edit(self, &root);
        let persisted = match edited {
            Ok(()) => self.persist(&root).await,
            Err(err) => Err(err),
        };
        self.release(&root);
        let persisted = persisted?;
        let commit = self.record_commit(persisted.root_hash, vec![head], message);
        self.branches.insert(branch.to_string(), commit.clone());
        Ok(commit)
    }

    fn snapshot_at(&self, commit: &CommitHash) -> Option<Arc<Tree>> {
        let root = self.commits.get(commit)?.root.clone();
        self.snapshots.get(&root).map(|tree| Arc::clone(&tree))
    }

    fn record(&self, op: StoreOp) {
        tracing::trace!(?op, "store operation");
        self.journal.lock().push(op);
    }

    fn record_commit(&self, root: RootHash, parents: Vec<CommitHash>, message: &str) -> CommitHash {
        let counter = self.commit_counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = blake3::Hasher::new();
        hasher.update(root.as_str().as_bytes());
        for parent in &parents {
            hasher.update(parent.as_str().as_bytes());
        }
        hasher.update(message.as_bytes());
        hasher.update(&counter.to_le_bytes());
        let hash = CommitHash::new(format!("#{}", hex::encode(&hasher.finalize().as_bytes()[..20])));

        self.commits.insert(
            hash.clone(),
            CommitRecord {
                root,
                parents,
                message: message.to_string(),
                created_at: Utc::now(),
            },
        );
        hash
    }

    fn read<R>(&self, node: &MemNode, f: impl FnOnce(&Tree) -> Option<R>) -> Option<R> {
        self.working.get(&node.tree).and_then(|working| f(&working.tree))
    }

    fn write<R>(
        &self,
        node: &MemNode,
        f: impl FnOnce(&mut Tree) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut working = self
            .working
            .get_mut(&node.tree)
            .ok_or_else(|| StoreError::InvalidNode(node.path.clone()))?;
        f(&mut working.tree)
    }

    fn handle(node: &MemNode, path: NodeId) -> MemNode {
        MemNode {
            tree: node.tree,
            path,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    type Node = MemNode;

    async fn load_root(&self, hash: &RootHash) -> Result<MemNode, StoreError> {
        let tree = self
            .snapshots
            .get(hash)
            .map(|tree| Tree::clone(&tree))
            .ok_or_else(|| StoreError::UnknownRoot(hash.to_string()))?;
        let id = self.next_tree.fetch_add(1, Ordering::Relaxed);
        self.working.insert(
            id,
            WorkingTree { tree },
        );
        self.origins.insert(id, hash.clone());
        self.record(StoreOp::LoadRoot {
            tree: id,
            root: hash.clone(),
        });
        Ok(MemNode {
            tree: id,
            path: NodeId::root(),
        })
    }

    async fn load_by_path(&self, root: &MemNode, path: &NodeId) -> Result<Option<MemNode>, StoreError> {
        if !self.working.contains_key(&root.tree) {
            return Err(StoreError::InvalidNode(root.path.clone()));
        }
        Ok(self.read(root, |tree| {
            tree.nodes
                .contains_key(path)
                .then(|| Self::handle(root, path.clone()))
        }))
    }

    async fn load_subtree(&self, root: &MemNode, path: &NodeId) -> Result<Vec<MemNode>, StoreError> {
        let paths = self
            .read(root, |tree| {
                tree.nodes.contains_key(path).then(|| {
                    tree.nodes
                        .keys()
                        .filter(|id| path.contains(id))
                        .cloned()
                        .collect::<Vec<_>>()
                })
            })
            .ok_or_else(|| StoreError::InvalidNode(path.clone()))?;
        Ok(paths.into_iter().map(|p| Self::handle(root, p)).collect())
    }

    async fn load_children(&self, node: &MemNode) -> Result<Vec<MemNode>, StoreError> {
        let paths = self
            .read(node, |tree| {
                tree.nodes
                    .contains_key(&node.path)
                    .then(|| tree.children(&node.path))
            })
            .ok_or_else(|| StoreError::InvalidNode(node.path.clone()))?;
        Ok(paths.into_iter().map(|p| Self::handle(node, p)).collect())
    }

    async fn persist(&self, root: &MemNode) -> Result<Persisted, StoreError> {
        let tree = self
            .working
            .get(&root.tree)
            .map(|working| working.tree.clone())
            .ok_or_else(|| StoreError::InvalidNode(root.path.clone()))?;
        let (root_hash, objects) = tree.hash()?;
        self.snapshots
            .entry(root_hash.clone())
            .or_insert_with(|| Arc::new(tree));
        self.record(StoreOp::Persist {
            tree: root.tree,
            root: root_hash.clone(),
        });
        Ok(Persisted { root_hash, objects })
    }

    fn release(&self, root: &MemNode) {
        if self.working.remove(&root.tree).is_some() {
            self.record(StoreOp::Release { tree: root.tree });
        }
    }

    fn get_path(&self, node: &MemNode) -> NodeId {
        node.path.clone()
    }

    fn get_parent(&self, node: &MemNode) -> Option<MemNode> {
        self.read(node, |tree| tree.nodes.get(&node.path)?.parent.clone())
            .map(|path| Self::handle(node, path))
    }

    fn get_base(&self, node: &MemNode) -> Option<MemNode> {
        self.read(node, |tree| tree.nodes.get(&node.path)?.base.clone())
            .map(|path| Self::handle(node, path))
    }

    fn get_meta_type(&self, node: &MemNode) -> Option<MemNode> {
        self.read(node, |tree| {
            tree.base_chain(&node.path)
                .into_iter()
                .find(|id| tree.nodes.get(*id).is_some_and(|record| record.meta))
                .cloned()
        })
        .map(|path| Self::handle(node, path))
    }

    fn is_type_of(&self, node: &MemNode, base: &MemNode) -> bool {
        node.tree == base.tree
            && self
                .read(node, |tree| {
                    Some(tree.base_chain(&node.path).contains(&&base.path))
                })
                .unwrap_or(false)
    }

    fn is_meta_node(&self, node: &MemNode) -> bool {
        self.read(node, |tree| tree.nodes.get(&node.path).map(|record| record.meta))
            .unwrap_or(false)
    }

    fn get_namespace(&self, _node: &MemNode) -> String {
        String::new()
    }

    fn get_attribute(&self, node: &MemNode, name: &str) -> Option<Value> {
        self.read(node, |tree| {
            tree.inherited(&node.path, |record| record.attributes.get(name))
                .cloned()
        })
    }

    fn get_own_attribute(&self, node: &MemNode, name: &str) -> Option<Value> {
        self.read(node, |tree| tree.nodes.get(&node.path)?.attributes.get(name).cloned())
    }

    fn get_own_registry(&self, node: &MemNode, name: &str) -> Option<Value> {
        self.read(node, |tree| tree.nodes.get(&node.path)?.registry.get(name).cloned())
    }

    fn get_pointer_path(&self, node: &MemNode, name: &str) -> Option<NodeId> {
        self.read(node, |tree| {
            tree.inherited(&node.path, |record| record.pointers.get(name))
                .cloned()
        })
    }

    fn get_children_paths(&self, node: &MemNode) -> Vec<NodeId> {
        self.read(node, |tree| Some(tree.children(&node.path)))
            .unwrap_or_default()
    }

    fn get_children_meta(&self, node: &MemNode) -> Option<Value> {
        self.read(node, |tree| tree.nodes.get(&node.path)?.children_meta.clone())
    }

    fn get_own_attribute_names(&self, node: &MemNode) -> Vec<String> {
        self.read(node, |tree| {
            Some(tree.nodes.get(&node.path)?.attributes.keys().cloned().collect())
        })
        .unwrap_or_default()
    }

    fn get_own_pointer_names(&self, node: &MemNode) -> Vec<String> {
        self.read(node, |tree| {
            Some(tree.nodes.get(&node.path)?.pointers.keys().cloned().collect())
        })
        .unwrap_or_default()
    }

    fn get_valid_attribute_names(&self, node: &MemNode) -> Vec<String> {
        self.read(node, |tree| {
            let names: BTreeSet<String> = tree
                .base_chain(&node.path)
                .into_iter()
                .filter_map(|id| tree.nodes.get(id))
                .flat_map(|record| record.valid_attributes.iter().cloned())
                .collect();
            Some(names.into_iter().collect())
        })
        .unwrap_or_default()
    }

    fn get_valid_pointer_names(&self, node: &MemNode) -> Vec<String> {
        self.read(node, |tree| {
            let names: BTreeSet<String> = tree
                .base_chain(&node.path)
                .into_iter()
                .filter_map(|id| tree.nodes.get(id))
                .flat_map(|record| record.valid_pointers.iter().cloned())
                .collect();
            Some(names.into_iter().collect())
        })
        .unwrap_or_default()
    }

    fn create_node(&self, base: &MemNode, parent: &MemNode) -> Result<MemNode, StoreError> {
        if base.tree != parent.tree {
            return Err(StoreError::Rejected(format!(
                "base {} and parent {} belong to different roots",
                base.path, parent.path
            )));
        }
        let path = self.write(parent, |tree| {
            if !tree.nodes.contains_key(&base.path) {
                return Err(StoreError::InvalidNode(base.path.clone()));
            }
            if !tree.nodes.contains_key(&parent.path) {
                return Err(StoreError::InvalidNode(parent.path.clone()));
            }
            Ok(tree.add_node(&parent.path, Some(base.path.clone())))
        })?;
        self.record(StoreOp::Create {
            tree: parent.tree,
            path: path.clone(),
        });
        Ok(Self::handle(parent, path))
    }

    fn set_attribute(&self, node: &MemNode, name: &str, value: Value) -> Result<(), StoreError> {
        self.write(node, |tree| {
            tree.record_mut(&node.path)?
                .attributes
                .insert(name.to_string(), value);
            Ok(())
        })?;
        self.record(StoreOp::SetAttribute {
            tree: node.tree,
            path: node.path.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    fn delete_attribute(&self, node: &MemNode, name: &str) -> Result<(), StoreError> {
        self.write(node, |tree| {
            tree.record_mut(&node.path)?.attributes.remove(name);
            Ok(())
        })?;
        self.record(StoreOp::DeleteAttribute {
            tree: node.tree,
            path: node.path.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    fn set_pointer(&self, node: &MemNode, name: &str, target: &MemNode) -> Result<(), StoreError> {
        if node.tree != target.tree {
            return Err(StoreError::Rejected(format!(
                "pointer target {} belongs to a different root",
                target.path
            )));
        }
        self.write(node, |tree| {
            if !tree.nodes.contains_key(&target.path) {
                return Err(StoreError::InvalidNode(target.path.clone()));
            }
            tree.record_mut(&node.path)?
                .pointers
                .insert(name.to_string(), target.path.clone());
            Ok(())
        })?;
        self.record(StoreOp::SetPointer {
            tree: node.tree,
            path: node.path.clone(),
            name: name.to_string(),
            target: target.path.clone(),
        });
        Ok(())
    }

    fn delete_node(&self, node: &MemNode) -> Result<(), StoreError> {
        if node.path.is_root() {
            return Err(StoreError::Rejected("cannot delete the root node".into()));
        }
        self.write(node, |tree| {
            tree.nodes.retain(|id, _| !node.path.contains(id));
            Ok(())
        })?;
        self.record(StoreOp::DeleteNode {
            tree: node.tree,
            path: node.path.clone(),
        });
        Ok(())
    }

    fn add_member(&self, node: &MemNode, set_name: &str, member: &MemNode) -> Result<(), StoreError> {
        self.write(node, |tree| {
            if !tree.nodes.contains_key(&member.path) {
                return Err(StoreError::InvalidNode(member.path.clone()));
            }
            tree.record_mut(&node.path)?
                .sets
                .entry(set_name.to_string())
                .or_default()
                .insert(member.path.clone());
            Ok(())
        })?;
        self.record(StoreOp::AddMember {
            tree: node.tree,
            path: node.path.clone(),
            set: set_name.to_string(),
        });
        Ok(())
    }
}

#[async_trait]
impl Project for MemoryStore {
    async fn branch_names(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self.branches.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn branch_head(&self, branch: &str) -> Result<CommitHash, StoreError> {
        self.head(branch)
            .ok_or_else(|| StoreError::UnknownBranch(branch.to_string()))
    }

    async fn save(&self, request: SaveRequest) -> Result<CommitResult, StoreError> {
        let injected = self.injected_failures.lock().pop_front();
        if let Some(error) = injected {
            return Err(error);
        }
        if !self.snapshots.contains_key(&request.root) {
            return Err(StoreError::UnknownRoot(request.root.to_string()));
        }
        let head = self.branch_head(&request.branch).await?;

        let (status, hash) = if head == request.parent {
            let hash = self.record_commit(request.root, vec![request.parent], &request.message);
            self.branches.insert(request.branch.clone(), hash.clone());
            (CommitStatus::Synced, hash)
        } else {
            let policy = *self.policy.read();
            match policy {
                ConflictPolicy::Merge => {
                    let hash = self.record_commit(
                        request.root,
                        vec![head, request.parent],
                        &request.message,
                    );
                    self.branches.insert(request.branch.clone(), hash.clone());
                    (CommitStatus::Merged, hash)
                }
                ConflictPolicy::Fork => {
                    if self.branches.contains_key(&request.fork_name) {
                        return Err(StoreError::Rejected(format!(
                            "branch {} already exists",
                            request.fork_name
                        )));
                    }
                    let hash = self.record_commit(request.root, vec![request.parent], &request.message);
                    self.branches.insert(request.fork_name.clone(), hash.clone());
                    (
                        CommitStatus::Forked {
                            branch: request.fork_name,
                        },
                        hash,
                    )
                }
            }
        };

        self.record(StoreOp::Save {
            branch: request.branch,
            status: status.clone(),
        });
        Ok(CommitResult { status, hash })
    }

    async fn root_of(&self, commit: &CommitHash) -> Result<RootHash, StoreError> {
        self.commits
            .get(commit)
            .map(|record| record.root.clone())
            .ok_or_else(|| StoreError::UnknownCommit(commit.to_string()))
    }
}
