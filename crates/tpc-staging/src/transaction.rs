//! Transaction core
//!
//! Buffering facade over a [`HostStore`]. Writes go to the live buffer; reads
//! check the live buffer, then every queued changeset from newest to oldest,
//! then the host store. Staged changesets are applied in queue order with
//! three phases:
//! 1. creations, recording `temp id -> real id`
//! 2. attribute and pointer edits
//! 3. deletions
//!
//! Buffer state sits behind one short-lived lock that is never held across an
//! `.await`.

use crate::changeset::{ApplyPhase, AttrEdit, Buffer, Changeset, NodeEdits};
use crate::error::{Result, TxError};
use crate::events::{CoreEvent, EventBus, EventKind};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::iter;
use std::sync::Arc;
use tpc_model::{
    load_path, AttrValue, HostStore, NodeDescriptor, NodeId, NodeKey, NodeRef, PendingNode,
    Persisted, RootHash, TempId, TempIdMap,
};

/// Keys a node's edits may be recorded under
///
/// A pending node that has been resolved is written under its real id, but
/// changesets staged before the resolution still hold edits under its temp id.
struct Keys {
    primary: NodeKey,
    alias: Option<NodeKey>,
}

impl Keys {
    fn iter(&self) -> impl Iterator<Item = &NodeKey> {
        iter::once(&self.primary).chain(self.alias.as_ref())
    }
}

struct CoreState<N> {
    live: Buffer<N>,
    queue: VecDeque<Arc<Changeset<N>>>,
    temp_ids: TempIdMap,
    aliases: HashMap<NodeId, TempId>,
    /// Handles of resolved pending nodes under the last root applied or rebound to
    materialized: HashMap<TempId, N>,
}

impl<N> CoreState<N> {
    /// Edit maps and deletion lists, newest first
    fn layers(
        &self,
    ) -> impl Iterator<Item = (&IndexMap<NodeKey, NodeEdits>, &[NodeKey])> {
        iter::once((&self.live.edits, self.live.deletions.as_slice()))
            .chain(self.queue.iter().rev().map(|cs| (cs.edits(), cs.deletions())))
    }

    fn is_deleted(&self, keys: &Keys) -> bool {
        self.layers()
            .any(|(_, deletions)| keys.iter().any(|key| deletions.contains(key)))
    }

    fn attr_edit(&self, keys: &Keys, name: &str) -> Option<AttrEdit> {
        self.layers().find_map(|(edits, _)| {
            keys.iter()
                .find_map(|key| edits.get(key).and_then(|e| e.attr.get(name)))
                .cloned()
        })
    }

    fn ptr_edit(&self, keys: &Keys, name: &str) -> Option<NodeKey> {
        self.layers().find_map(|(edits, _)| {
            keys.iter()
                .find_map(|key| edits.get(key).and_then(|e| e.ptr.get(name)))
                .cloned()
        })
    }

    /// Real handle standing in for a resolved pending node
    ///
    /// Unresolved pending nodes and real nodes are returned unchanged.
    fn materialize(&self, node: &NodeRef<N>) -> NodeRef<N>
    where
        N: Clone,
    {
        match node {
            NodeRef::Pending(pending) => self
                .materialized
                .get(&pending.temp_id())
                .cloned()
                .map_or_else(|| node.clone(), NodeRef::Real),
            NodeRef::Real(_) => node.clone(),
        }
    }

    /// Like [`CoreState::materialize`], failing for resolved nodes whose handle is gone
    fn real_view(&self, node: &NodeRef<N>) -> Result<NodeRef<N>>
    where
        N: Clone,
    {
        if let NodeRef::Pending(pending) = node {
            let temp = pending.temp_id();
            if let (None, Some(id)) = (self.materialized.get(&temp), self.temp_ids.get(&temp)) {
                return Err(TxError::not_found(format!(
                    "{temp} was created as {id}, which no longer exists"
                )));
            }
        }
        Ok(self.materialize(node))
    }

    /// Drop everything recorded for temp ids whose creation was never committed
    fn forget(&mut self, temps: &[TempId]) {
        for temp in temps {
            self.temp_ids.remove(temp);
            self.materialized.remove(temp);
        }
        self.aliases.retain(|_, temp| !temps.contains(temp));
    }

    /// Every created node, oldest first
    fn created(&self) -> impl Iterator<Item = &Arc<PendingNode<N>>> {
        self.queue
            .iter()
            .flat_map(|cs| cs.created().iter())
            .chain(self.live.created.iter())
    }
}

/// Buffering facade over a host store
pub struct TransactionCore<S: HostStore> {
    host: Arc<S>,
    state: Mutex<CoreState<S::Node>>,
    events: EventBus<S::Node>,
}

impl<S: HostStore> TransactionCore<S> {
    /// Wrap a host store
    #[must_use]
    pub fn new(host: Arc<S>) -> Self {
        Self {
            host,
            state: Mutex::new(CoreState {
                live: Buffer::new(),
                queue: VecDeque::new(),
                temp_ids: TempIdMap::new(),
                aliases: HashMap::new(),
                materialized: HashMap::new(),
            }),
            events: EventBus::new(),
        }
    }

    /// Wrapped host store
    #[inline]
    #[must_use]
    pub fn host(&self) -> &Arc<S> {
        &self.host
    }

    /// Register an apply-time event handler
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&CoreEvent<'_, S::Node>) -> Result<()> + Send + Sync + 'static,
    {
        self.events.on(kind, handler);
    }

    fn pending_keys(&self, state: &CoreState<S::Node>, node: &PendingNode<S::Node>) -> Keys {
        let temp = node.temp_id();
        match state.temp_ids.get(&temp) {
            Some(id) => Keys {
                primary: NodeKey::Real(id.clone()),
                alias: Some(NodeKey::Temp(temp)),
            },
            None => Keys {
                primary: NodeKey::Temp(temp),
                alias: None,
            },
        }
    }

    fn keys(&self, state: &CoreState<S::Node>, node: &NodeRef<S::Node>) -> Keys {
        match node {
            NodeRef::Pending(pending) => self.pending_keys(state, pending),
            NodeRef::Real(real) => {
                let id = self.host.get_path(real);
                let alias = state.aliases.get(&id).copied().map(NodeKey::Temp);
                Keys {
                    primary: NodeKey::Real(id),
                    alias,
                }
            }
        }
    }

    /// Canonical key of a node
    ///
    /// Resolved pending nodes map to their real id.
    #[must_use]
    pub fn key_of(&self, node: &NodeRef<S::Node>) -> NodeKey {
        let state = self.state.lock();
        self.keys(&state, node).primary
    }

    /// Path of a node; the temp id for pending nodes
    #[must_use]
    pub fn get_path(&self, node: &NodeRef<S::Node>) -> NodeKey {
        match node {
            NodeRef::Pending(pending) => NodeKey::Temp(pending.temp_id()),
            NodeRef::Real(real) => NodeKey::Real(self.host.get_path(real)),
        }
    }

    /// Real id a temp id was resolved to
    #[must_use]
    pub fn resolved_id(&self, temp: TempId) -> Option<NodeId> {
        self.state.lock().temp_ids.get(&temp).cloned()
    }

    /// Every temp id resolved so far
    #[must_use]
    pub fn temp_id_map(&self) -> TempIdMap {
        self.state.lock().temp_ids.clone()
    }

    // ------------------------------------------------------------------
    // Buffer-aware reads
    // ------------------------------------------------------------------

    /// Attribute value as seen through the buffers
    ///
    /// A pending node that has been created answers from the created node.
    ///
    /// # Errors
    /// - [`TxError::InvalidArgument`] when the node is buffered for deletion
    /// - [`TxError::NotFound`] when the created node no longer exists
    pub fn get_attribute(&self, node: &NodeRef<S::Node>, name: &str) -> Result<AttrValue> {
        let state = self.state.lock();
        let node = state.real_view(node)?;
        let node = &node;
        let keys = self.keys(&state, node);
        if state.is_deleted(&keys) {
            return Err(TxError::invalid_argument(format!(
                "cannot get {name} from deleted node {}",
                keys.primary
            )));
        }
        Ok(self.read_attribute(&state, node, &keys, name))
    }

    fn read_attribute(
        &self,
        state: &CoreState<S::Node>,
        node: &NodeRef<S::Node>,
        keys: &Keys,
        name: &str,
    ) -> AttrValue {
        match state.attr_edit(keys, name) {
            Some(AttrEdit::Set(value)) => AttrValue::Value(value),
            Some(AttrEdit::Deleted) => self.inherited_attribute(state, node, name),
            None => match node {
                NodeRef::Pending(_) => self.inherited_attribute(state, node, name),
                NodeRef::Real(real) => self.host.get_attribute(real, name).into(),
            },
        }
    }

    fn inherited_attribute(
        &self,
        state: &CoreState<S::Node>,
        node: &NodeRef<S::Node>,
        name: &str,
    ) -> AttrValue {
        match self.base_of(node) {
            Some(base) => {
                let base = state.materialize(&base);
                let keys = self.keys(state, &base);
                self.read_attribute(state, &base, &keys, name)
            }
            None => AttrValue::Unset,
        }
    }

    /// Pointer target as seen through the buffers
    ///
    /// Pending targets keep their temp id until they are resolved.
    #[must_use]
    pub fn get_pointer(&self, node: &NodeRef<S::Node>, name: &str) -> Option<NodeKey> {
        let state = self.state.lock();
        let node = state.real_view(node).ok()?;
        let keys = self.keys(&state, &node);
        if let Some(target) = state.ptr_edit(&keys, name) {
            return Some(target.resolved(&state.temp_ids));
        }
        match &node {
            NodeRef::Real(real) => self.host.get_pointer_path(real, name).map(NodeKey::Real),
            NodeRef::Pending(_) => None,
        }
    }

    fn base_of(&self, node: &NodeRef<S::Node>) -> Option<NodeRef<S::Node>> {
        match node {
            NodeRef::Pending(pending) => Some(pending.base().clone()),
            NodeRef::Real(real) => self.host.get_base(real).map(NodeRef::Real),
        }
    }

    /// Base of a node; the declared base for pending nodes
    #[must_use]
    pub fn get_base(&self, node: &NodeRef<S::Node>) -> Option<NodeRef<S::Node>> {
        self.base_of(&self.view(node))
    }

    fn view(&self, node: &NodeRef<S::Node>) -> NodeRef<S::Node> {
        self.state.lock().materialize(node)
    }

    /// Check if `base` is on the base chain of `node`, including `node`
    #[must_use]
    pub fn is_type_of(&self, node: &NodeRef<S::Node>, base: &NodeRef<S::Node>) -> bool {
        let (node, base) = {
            let state = self.state.lock();
            (state.materialize(node), state.materialize(base))
        };
        match (&node, &base) {
            (NodeRef::Real(real), NodeRef::Real(real_base)) => self.host.is_type_of(real, real_base),
            (NodeRef::Pending(pending), _) => {
                self.key_of(&node) == self.key_of(&base) || self.is_type_of(pending.base(), &base)
            }
            // a real node cannot derive from a node that does not exist yet
            (NodeRef::Real(_), NodeRef::Pending(_)) => false,
        }
    }

    /// Closest meta node; pending nodes answer from their first real base
    #[must_use]
    pub fn get_meta_type(&self, node: &NodeRef<S::Node>) -> Option<S::Node> {
        self.host.get_meta_type(Self::first_real(&self.view(node)))
    }

    /// Attribute names the meta model allows on the node
    #[must_use]
    pub fn get_valid_attribute_names(&self, node: &NodeRef<S::Node>) -> Vec<String> {
        self.host.get_valid_attribute_names(Self::first_real(&self.view(node)))
    }

    /// Pointer names the meta model allows on the node
    #[must_use]
    pub fn get_valid_pointer_names(&self, node: &NodeRef<S::Node>) -> Vec<String> {
        self.host.get_valid_pointer_names(Self::first_real(&self.view(node)))
    }

    fn first_real(node: &NodeRef<S::Node>) -> &S::Node {
        match node {
            NodeRef::Real(real) => real,
            NodeRef::Pending(pending) => pending.real_base(),
        }
    }

    /// Names of attributes set on the node, including buffered edits
    #[must_use]
    pub fn get_own_attribute_names(&self, node: &NodeRef<S::Node>) -> Vec<String> {
        let node = &self.view(node);
        let mut names = match node {
            NodeRef::Real(real) => self.host.get_own_attribute_names(real),
            NodeRef::Pending(_) => Vec::new(),
        };
        self.for_each_edit_oldest_first(node, |edits| {
            for (name, edit) in &edits.attr {
                match edit {
                    AttrEdit::Set(_) if !names.contains(name) => names.push(name.clone()),
                    AttrEdit::Set(_) => {}
                    AttrEdit::Deleted => names.retain(|n| n != name),
                }
            }
        });
        names
    }

    /// Names of pointers set on the node, including buffered edits
    #[must_use]
    pub fn get_own_pointer_names(&self, node: &NodeRef<S::Node>) -> Vec<String> {
        let node = &self.view(node);
        let mut names = match node {
            NodeRef::Real(real) => self.host.get_own_pointer_names(real),
            NodeRef::Pending(_) => Vec::new(),
        };
        self.for_each_edit_oldest_first(node, |edits| {
            for name in edits.ptr.keys() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        });
        names
    }

    fn for_each_edit_oldest_first(
        &self,
        node: &NodeRef<S::Node>,
        mut f: impl FnMut(&NodeEdits),
    ) {
        let state = self.state.lock();
        let keys = self.keys(&state, node);
        let layers: Vec<_> = state.layers().collect();
        for (edits, _) in layers.into_iter().rev() {
            // temp-keyed edits predate real-keyed ones
            for key in keys.alias.iter().chain(iter::once(&keys.primary)) {
                if let Some(node_edits) = edits.get(key) {
                    f(node_edits);
                }
            }
        }
    }

    /// Children of a node, including pending nodes created under it
    ///
    /// Pending nodes buffered for deletion are left out, and a pending node
    /// that already exists as one of the real children is returned once.
    ///
    /// # Errors
    /// - [`TxError::NotFound`] when a created pending parent no longer exists
    /// - [`TxError::Store`] when the host store fails to load children
    pub async fn load_children(&self, node: &NodeRef<S::Node>) -> Result<Vec<NodeRef<S::Node>>> {
        let (node, pending): (_, Vec<(Arc<PendingNode<S::Node>>, Option<NodeId>)>) = {
            let state = self.state.lock();
            let node = state.real_view(node)?;
            let parent = self.keys(&state, &node).primary;
            let pending = state
                .created()
                .filter(|child| self.keys(&state, child.parent()).primary == parent)
                .filter(|child| !state.is_deleted(&self.pending_keys(&state, child)))
                .map(|child| {
                    let resolved = state.temp_ids.get(&child.temp_id()).cloned();
                    (Arc::clone(child), resolved)
                })
                .collect();
            (node, pending)
        };

        let real = match &node {
            NodeRef::Real(real) => self.host.load_children(real).await?,
            NodeRef::Pending(_) => Vec::new(),
        };
        let real_ids: HashSet<NodeId> = real.iter().map(|child| self.host.get_path(child)).collect();

        let mut children: Vec<NodeRef<S::Node>> = pending
            .into_iter()
            .filter(|(_, resolved)| resolved.as_ref().map_or(true, |id| !real_ids.contains(id)))
            .map(|(child, _)| NodeRef::Pending(child))
            .collect();
        children.extend(real.into_iter().map(NodeRef::Real));
        Ok(children)
    }

    /// Load a node by path, or a buffered pending node by its temp id
    ///
    /// # Errors
    /// Returns [`TxError::Store`] when the host store fails.
    pub async fn load_by_path(
        &self,
        root: &S::Node,
        path: &str,
    ) -> Result<Option<NodeRef<S::Node>>> {
        if let Some(temp) = TempId::parse(path) {
            let state = self.state.lock();
            return Ok(state
                .created()
                .find(|node| node.temp_id() == temp)
                .map(|node| NodeRef::Pending(Arc::clone(node))));
        }
        let node = self.host.load_by_path(root, &NodeId::new(path)).await?;
        Ok(node.map(NodeRef::Real))
    }

    // ------------------------------------------------------------------
    // Buffered writes
    // ------------------------------------------------------------------

    fn ensure_not_deleted(state: &CoreState<S::Node>, keys: &Keys, action: &str) -> Result<()> {
        if state.is_deleted(keys) {
            return Err(TxError::invalid_argument(format!(
                "cannot {action} on deleted node {}",
                keys.primary
            )));
        }
        Ok(())
    }

    /// Buffer an attribute write
    ///
    /// # Errors
    /// Returns [`TxError::InvalidArgument`] for an unset value or a node
    /// buffered for deletion.
    pub fn set_attribute(
        &self,
        node: &NodeRef<S::Node>,
        name: &str,
        value: impl Into<AttrValue>,
    ) -> Result<()> {
        let value: Value = match value.into() {
            AttrValue::Value(value) => value,
            AttrValue::Unset => {
                return Err(TxError::invalid_argument(format!(
                    "cannot set attribute to unset value ({name})"
                )))
            }
        };

        let mut state = self.state.lock();
        let keys = self.keys(&state, node);
        Self::ensure_not_deleted(&state, &keys, "set attribute")?;
        tracing::info!("Setting {} to {} ({})", name, value, keys.primary);
        state
            .live
            .edits_for(keys.primary)
            .attr
            .insert(name.to_string(), AttrEdit::Set(value));
        Ok(())
    }

    /// Buffer an attribute deletion
    ///
    /// # Errors
    /// Returns [`TxError::InvalidArgument`] for a node buffered for deletion.
    pub fn delete_attribute(&self, node: &NodeRef<S::Node>, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let keys = self.keys(&state, node);
        Self::ensure_not_deleted(&state, &keys, "delete attribute")?;
        tracing::info!("Deleting {} ({})", name, keys.primary);
        state
            .live
            .edits_for(keys.primary)
            .attr
            .insert(name.to_string(), AttrEdit::Deleted);
        Ok(())
    }

    /// Buffer a pointer write; `target` may be pending
    ///
    /// # Errors
    /// Returns [`TxError::InvalidArgument`] for a node buffered for deletion.
    pub fn set_pointer(
        &self,
        node: &NodeRef<S::Node>,
        name: &str,
        target: &NodeRef<S::Node>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let keys = self.keys(&state, node);
        Self::ensure_not_deleted(&state, &keys, "set pointer")?;
        let target = self.keys(&state, target).primary;
        tracing::info!("Setting pointer {} of {} to {}", name, keys.primary, target);
        state
            .live
            .edits_for(keys.primary)
            .ptr
            .insert(name.to_string(), target);
        Ok(())
    }

    /// Buffer a new node
    ///
    /// # Errors
    /// Returns [`TxError::InvalidArgument`] when base or parent is missing,
    /// or the parent is buffered for deletion.
    pub fn create_node(&self, desc: NodeDescriptor<S::Node>) -> Result<NodeRef<S::Node>> {
        let node = Arc::new(PendingNode::create(desc)?);
        let mut state = self.state.lock();
        let parent = self.keys(&state, node.parent());
        Self::ensure_not_deleted(&state, &parent, "create node")?;
        tracing::info!("Creating {} in {}", node.temp_id(), parent.primary);
        state.live.created.push(Arc::clone(&node));
        Ok(NodeRef::Pending(node))
    }

    /// Buffer a copy of `node` under `parent`
    ///
    /// The copy is a new node deriving from `node`.
    ///
    /// # Errors
    /// Returns [`TxError::InvalidArgument`] when the parent is buffered for deletion.
    pub fn copy_node(
        &self,
        node: &NodeRef<S::Node>,
        parent: &NodeRef<S::Node>,
    ) -> Result<NodeRef<S::Node>> {
        self.create_node(NodeDescriptor::new(node.clone(), parent.clone()))
    }

    /// Buffer a node deletion
    ///
    /// Deleting a node that is already buffered for deletion does nothing.
    pub fn delete_node(&self, node: &NodeRef<S::Node>) {
        let mut state = self.state.lock();
        let keys = self.keys(&state, node);
        if state.is_deleted(&keys) {
            tracing::debug!("{} already buffered for deletion", keys.primary);
            return;
        }
        tracing::info!("Deleting node {}", keys.primary);
        state.live.deletions.push(keys.primary);
    }

    // ------------------------------------------------------------------
    // Queue
    // ------------------------------------------------------------------

    /// Drain the live buffer into a new changeset at the tail of the queue
    pub fn stage(&self) -> Arc<Changeset<S::Node>> {
        let mut state = self.state.lock();
        let buffer = std::mem::replace(&mut state.live, Buffer::new());
        let changeset = Arc::new(Changeset::from_buffer(buffer));
        state.queue.push_back(Arc::clone(&changeset));
        tracing::info!(
            "Staged {}: {} created, {} edited, {} deleted ({} queued)",
            changeset.id(),
            changeset.created().len(),
            changeset.edits().len(),
            changeset.deletions().len(),
            state.queue.len()
        );
        changeset
    }

    /// Remove the head of the queue
    ///
    /// Nodes a partly applied changeset created are forgotten again, so their
    /// pending handles go back to reading as unresolved.
    ///
    /// # Errors
    /// Returns [`TxError::InvariantViolation`] unless `changeset` is the head.
    pub fn discard(&self, changeset: &Arc<Changeset<S::Node>>) -> Result<()> {
        let mut state = self.state.lock();
        match state.queue.front() {
            Some(head) if Arc::ptr_eq(head, changeset) => {
                state.queue.pop_front();
                if changeset.phase() != ApplyPhase::Applied {
                    let temps: Vec<TempId> =
                        changeset.created().iter().map(|node| node.temp_id()).collect();
                    state.forget(&temps);
                }
                tracing::debug!("Discarded {} ({} queued)", changeset.id(), state.queue.len());
                Ok(())
            }
            Some(head) => Err(TxError::invariant_violation(format!(
                "expected {} to be at front of queue, found {}",
                changeset.id(),
                head.id()
            ))),
            None => Err(TxError::invariant_violation(format!(
                "cannot discard {}: queue is empty",
                changeset.id()
            ))),
        }
    }

    /// Number of queued changesets
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Oldest queued changeset
    #[must_use]
    pub fn queue_head(&self) -> Option<Arc<Changeset<S::Node>>> {
        self.state.lock().queue.front().cloned()
    }

    /// Check if the live buffer holds unstaged work
    #[must_use]
    pub fn has_live_changes(&self) -> bool {
        !self.state.lock().live.is_empty()
    }

    // ------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------

    /// Write a queued changeset to the host store under `root`
    ///
    /// Every changeset ahead of it in the queue must have been applied. Any
    /// failure aborts the remaining phases; the changeset stays queued and a
    /// later call starts over.
    ///
    /// # Errors
    /// - [`TxError::InvariantViolation`] for out-of-order applies or unresolved dependencies
    /// - [`TxError::NotFound`] when an edited or deleted node is missing under `root`
    /// - [`TxError::Observer`] when a `NodeCreated` handler fails
    /// - [`TxError::Store`] for host store failures
    pub async fn apply(&self, root: &S::Node, changeset: &Arc<Changeset<S::Node>>) -> Result<()> {
        let mut ids = {
            let state = self.state.lock();
            let position = state
                .queue
                .iter()
                .position(|queued| Arc::ptr_eq(queued, changeset))
                .ok_or_else(|| {
                    TxError::invariant_violation(format!("{} is not queued", changeset.id()))
                })?;
            if let Some(ahead) = state
                .queue
                .iter()
                .take(position)
                .find(|queued| queued.phase() != ApplyPhase::Applied)
            {
                return Err(TxError::invariant_violation(format!(
                    "{} applied before {}",
                    changeset.id(),
                    ahead.id()
                )));
            }
            state.temp_ids.clone()
        };

        tracing::info!("Applying {}", changeset.id());
        changeset.begin_apply();
        for node in changeset.created() {
            ids.remove(&node.temp_id());
        }

        self.apply_creations(root, changeset, &mut ids).await?;
        self.apply_edits(root, changeset).await?;
        self.apply_deletions(root, changeset).await?;
        tracing::info!("Applied {}", changeset.id());
        Ok(())
    }

    async fn apply_creations(
        &self,
        root: &S::Node,
        changeset: &Changeset<S::Node>,
        ids: &mut TempIdMap,
    ) -> Result<()> {
        for pending in changeset.created() {
            let temp = pending.temp_id();
            if changeset.is_elided(temp) {
                tracing::debug!("Skipping {}: deleted before it was persisted", temp);
                continue;
            }

            let node = pending.resolve(root, self.host.as_ref(), ids).await?;
            let id = self.host.get_path(&node);
            changeset.record_created(temp, id.clone())?;
            ids.insert(temp, id.clone());
            {
                let mut state = self.state.lock();
                state.temp_ids.insert(temp, id.clone());
                state.aliases.insert(id.clone(), temp);
                state.materialized.insert(temp, node.clone());
            }
            tracing::info!("Created {} as {}", temp, id);

            self.events.emit(&CoreEvent::NodeCreated {
                pending: pending.as_ref(),
                node: &node,
            })?;
        }
        changeset.resolve_temp_ids(ids)
    }

    async fn apply_edits(&self, root: &S::Node, changeset: &Changeset<S::Node>) -> Result<()> {
        let edits = changeset.resolved_edits()?;
        tracing::info!("Applying edits to {} nodes", edits.len());

        for (id, node_edits) in edits {
            let node = load_path(root, self.host.as_ref(), &id).await?;
            for (name, edit) in node_edits.attr {
                match edit {
                    AttrEdit::Set(value) => {
                        tracing::debug!("Setting {} to {} ({})", name, value, id);
                        self.host.set_attribute(&node, &name, value)?;
                    }
                    AttrEdit::Deleted => self.host.delete_attribute(&node, &name)?,
                }
            }
            for (name, target) in node_edits.ptr {
                let target_id = target.as_real().cloned().ok_or_else(|| {
                    TxError::invariant_violation(format!("pointer {name} of {id} targets {target}"))
                })?;
                let target = load_path(root, self.host.as_ref(), &target_id).await?;
                self.host.set_pointer(&node, &name, &target)?;
            }
        }
        changeset.advance(ApplyPhase::Resolved, ApplyPhase::Edited)
    }

    async fn apply_deletions(&self, root: &S::Node, changeset: &Changeset<S::Node>) -> Result<()> {
        let nodes = changeset.deleted_nodes(root, self.host.as_ref()).await?;
        for node in &nodes {
            tracing::debug!("Deleting {}", self.host.get_path(node));
            self.host.delete_node(node)?;
        }
        changeset.advance(ApplyPhase::Edited, ApplyPhase::Applied)
    }

    /// Reload the handles of created nodes under a new root
    ///
    /// Handles are bound to the root they were loaded from; call this after a
    /// commit so reads through resolved pending nodes see the committed tree.
    /// Nodes missing under `root` read as [`TxError::NotFound`] afterwards.
    ///
    /// # Errors
    /// Returns [`TxError::Store`] on host failure.
    pub async fn rebind(&self, root: &S::Node) -> Result<()> {
        let resolved: Vec<(TempId, NodeId)> = {
            let state = self.state.lock();
            state
                .temp_ids
                .iter()
                .map(|(temp, id)| (*temp, id.clone()))
                .collect()
        };

        let mut reloaded = Vec::with_capacity(resolved.len());
        for (temp, id) in resolved {
            let node = self.host.load_by_path(root, &id).await?;
            reloaded.push((temp, id, node));
        }

        let mut state = self.state.lock();
        for (temp, id, node) in reloaded {
            match node {
                Some(node) => {
                    state.materialized.insert(temp, node);
                }
                None => {
                    tracing::debug!("{} ({}) no longer exists", temp, id);
                    state.materialized.remove(&temp);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pass-through; not buffer-aware
    // ------------------------------------------------------------------

    /// Persist the tree under `root`
    ///
    /// # Errors
    /// Returns [`TxError::Store`] on host failure.
    pub async fn persist(&self, root: &S::Node) -> Result<Persisted> {
        Ok(self.host.persist(root).await?)
    }

    /// Load the root of a persisted tree
    ///
    /// # Errors
    /// Returns [`TxError::Store`] on host failure.
    pub async fn load_root(&self, hash: &RootHash) -> Result<S::Node> {
        Ok(self.host.load_root(hash).await?)
    }

    /// Load a node and its descendants
    ///
    /// # Errors
    /// Returns [`TxError::Store`] on host failure.
    pub async fn load_subtree(&self, root: &S::Node, path: &NodeId) -> Result<Vec<S::Node>> {
        Ok(self.host.load_subtree(root, path).await?)
    }

    /// Committed pointer target path
    #[must_use]
    pub fn get_pointer_path(&self, node: &S::Node, name: &str) -> Option<NodeId> {
        self.host.get_pointer_path(node, name)
    }

    /// Committed parent
    #[must_use]
    pub fn get_parent(&self, node: &S::Node) -> Option<S::Node> {
        self.host.get_parent(node)
    }

    /// Namespace of a node
    #[must_use]
    pub fn get_namespace(&self, node: &S::Node) -> String {
        self.host.get_namespace(node)
    }

    /// Containment rules of a meta node
    #[must_use]
    pub fn get_children_meta(&self, node: &S::Node) -> Option<Value> {
        self.host.get_children_meta(node)
    }

    /// Committed child paths
    #[must_use]
    pub fn get_children_paths(&self, node: &S::Node) -> Vec<NodeId> {
        self.host.get_children_paths(node)
    }

    /// Add a set member directly in the host store
    ///
    /// # Errors
    /// Returns [`TxError::Store`] on host failure.
    pub fn add_member(&self, node: &S::Node, set_name: &str, member: &S::Node) -> Result<()> {
        Ok(self.host.add_member(node, set_name, member)?)
    }

    /// Check if the node is part of the meta model
    #[must_use]
    pub fn is_meta_node(&self, node: &S::Node) -> bool {
        self.host.is_meta_node(node)
    }

    /// Committed registry value
    #[must_use]
    pub fn get_own_registry(&self, node: &S::Node, name: &str) -> Option<Value> {
        self.host.get_own_registry(node, name)
    }

    /// Committed own attribute value
    #[must_use]
    pub fn get_own_attribute(&self, node: &S::Node, name: &str) -> Option<Value> {
        self.host.get_own_attribute(node, name)
    }
}

impl<S: HostStore> fmt::Debug for TransactionCore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionCore")
            .field("queued", &state.queue.len())
            .field("resolved", &state.temp_ids.len())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
