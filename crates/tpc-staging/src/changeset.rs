//! Staged changesets
//!
//! A [`Changeset`] is the frozen content of one buffering interval:
//! - nodes created, in creation order
//! - attribute and pointer edits per node
//! - node deletions
//!
//! The staged content never changes after [`TransactionCore::stage`]. Apply
//! progress lives in a separate resolution state, which is reset at the start
//! of every apply so a failed apply can be replayed against a fresh root.
//!
//! [`TransactionCore::stage`]: crate::TransactionCore::stage

use crate::error::{Result, TxError};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tpc_model::{load_path, HostStore, NodeId, NodeKey, NodeRef, PendingNode, TempId, TempIdMap};
use ulid::Ulid;

/// Unique changeset identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangesetId(Ulid);

impl ChangesetId {
    /// Generate new id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ChangesetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "changeset-{}", self.0)
    }
}

/// Buffered attribute edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrEdit {
    /// Attribute set to a value
    Set(Value),
    /// Attribute deleted; reads fall back to the inherited value
    Deleted,
}

/// Accumulated edits of one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeEdits {
    /// Attribute edits by name
    pub attr: IndexMap<String, AttrEdit>,
    /// Pointer targets by name
    pub ptr: IndexMap<String, NodeKey>,
}

impl NodeEdits {
    /// Check if nothing was recorded
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attr.is_empty() && self.ptr.is_empty()
    }

    /// Fold `later` into `self`; later writes win
    pub fn merge(&mut self, later: Self) {
        for (name, edit) in later.attr {
            self.attr.insert(name, edit);
        }
        for (name, target) in later.ptr {
            self.ptr.insert(name, target);
        }
    }
}

/// Progress of an apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ApplyPhase {
    /// Not applied yet
    #[default]
    Staged,
    /// Materializing created nodes
    Creating,
    /// Temp ids rewritten to real ids
    Resolved,
    /// Attribute and pointer edits written
    Edited,
    /// Deletions written
    Applied,
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Staged => "staged",
            Self::Creating => "creating",
            Self::Resolved => "resolved",
            Self::Edited => "edited",
            Self::Applied => "applied",
        };
        f.write_str(name)
    }
}

/// Live buffer contents, drained into a [`Changeset`] by `stage`
pub(crate) struct Buffer<N> {
    pub(crate) created: Vec<Arc<PendingNode<N>>>,
    pub(crate) edits: IndexMap<NodeKey, NodeEdits>,
    pub(crate) deletions: Vec<NodeKey>,
}

impl<N> Buffer<N> {
    pub(crate) fn new() -> Self {
        Self {
            created: Vec::new(),
            edits: IndexMap::new(),
            deletions: Vec::new(),
        }
    }

    /// Edit record of a node, created empty on first touch
    pub(crate) fn edits_for(&mut self, key: NodeKey) -> &mut NodeEdits {
        self.edits.entry(key).or_default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.created.is_empty() && self.edits.is_empty() && self.deletions.is_empty()
    }
}

#[derive(Debug, Default)]
struct Resolution {
    phase: ApplyPhase,
    temp_ids: TempIdMap,
    elided: HashSet<TempId>,
    edits: IndexMap<NodeId, NodeEdits>,
    deletions: Vec<NodeId>,
}

/// Frozen snapshot of one buffering interval
pub struct Changeset<N> {
    id: ChangesetId,
    created: Vec<Arc<PendingNode<N>>>,
    edits: IndexMap<NodeKey, NodeEdits>,
    deletions: Vec<NodeKey>,
    resolution: RwLock<Resolution>,
}

impl<N> Changeset<N> {
    pub(crate) fn from_buffer(buffer: Buffer<N>) -> Self {
        Self {
            id: ChangesetId::new(),
            created: buffer.created,
            edits: buffer.edits,
            deletions: buffer.deletions,
            resolution: RwLock::new(Resolution::default()),
        }
    }

    /// Changeset id
    #[inline]
    #[must_use]
    pub fn id(&self) -> ChangesetId {
        self.id
    }

    /// Created nodes in creation order
    #[inline]
    #[must_use]
    pub fn created(&self) -> &[Arc<PendingNode<N>>] {
        &self.created
    }

    /// Staged edits, keyed as they were buffered
    #[inline]
    #[must_use]
    pub fn edits(&self) -> &IndexMap<NodeKey, NodeEdits> {
        &self.edits
    }

    /// Staged edits of one node
    #[inline]
    #[must_use]
    pub fn edits_for(&self, key: &NodeKey) -> Option<&NodeEdits> {
        self.edits.get(key)
    }

    /// Staged deletions
    #[inline]
    #[must_use]
    pub fn deletions(&self) -> &[NodeKey] {
        &self.deletions
    }

    /// Check if the changeset carries no work
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.edits.is_empty() && self.deletions.is_empty()
    }

    /// Current apply phase
    #[must_use]
    pub fn phase(&self) -> ApplyPhase {
        self.resolution.read().phase
    }

    /// Temp ids resolved by the latest apply
    #[must_use]
    pub fn temp_id_map(&self) -> TempIdMap {
        self.resolution.read().temp_ids.clone()
    }

    /// Created node with the given temp id
    #[must_use]
    pub fn pending_node(&self, temp: TempId) -> Option<&Arc<PendingNode<N>>> {
        self.created.iter().find(|node| node.temp_id() == temp)
    }

    /// Check if a node key is staged for deletion
    #[must_use]
    pub fn deletes(&self, key: &NodeKey) -> bool {
        self.deletions.contains(key)
    }

    /// Check if a created node is skipped by apply
    ///
    /// Nodes deleted in the changeset that created them are never
    /// materialized, and neither are nodes contained in or derived from them.
    #[must_use]
    pub fn is_elided(&self, temp: TempId) -> bool {
        self.resolution.read().elided.contains(&temp)
    }

    /// Keys of edited nodes
    ///
    /// Real ids once temp ids are resolved, staged keys before.
    #[must_use]
    pub fn modified_node_ids(&self) -> Vec<NodeKey> {
        let resolution = self.resolution.read();
        if resolution.phase >= ApplyPhase::Resolved {
            resolution.edits.keys().cloned().map(NodeKey::Real).collect()
        } else {
            self.edits.keys().cloned().collect()
        }
    }

    /// Edits with every temp id rewritten to its real id
    ///
    /// # Errors
    /// Returns [`TxError::InvariantViolation`] before temp ids are resolved.
    pub fn resolved_edits(&self) -> Result<IndexMap<NodeId, NodeEdits>> {
        let resolution = self.resolution.read();
        if resolution.phase < ApplyPhase::Resolved {
            return Err(TxError::invariant_violation(format!(
                "edits of {} requested before temp ids were resolved",
                self.id
            )));
        }
        Ok(resolution.edits.clone())
    }

    /// Start a fresh apply
    ///
    /// Clears any progress of an earlier, failed apply and computes which
    /// created nodes are skipped.
    pub(crate) fn begin_apply(&self) {
        let mut elided: HashSet<TempId> = self
            .created
            .iter()
            .map(|node| node.temp_id())
            .filter(|temp| self.deletions.contains(&NodeKey::Temp(*temp)))
            .collect();

        // Creation order puts dependencies first, so one pass is transitive
        for node in &self.created {
            let depends_on_elided = [node.parent(), node.base()]
                .into_iter()
                .filter_map(NodeRef::temp_id)
                .any(|temp| elided.contains(&temp));
            if depends_on_elided {
                elided.insert(node.temp_id());
            }
        }

        *self.resolution.write() = Resolution {
            phase: ApplyPhase::Creating,
            elided,
            ..Resolution::default()
        };
    }

    /// Record the real id of a created node
    ///
    /// # Errors
    /// Returns [`TxError::InvariantViolation`] outside the creation phase or
    /// when the node was already resolved in this apply.
    pub(crate) fn record_created(&self, temp: TempId, id: NodeId) -> Result<()> {
        let mut resolution = self.resolution.write();
        if resolution.phase != ApplyPhase::Creating {
            return Err(TxError::invariant_violation(format!(
                "{temp} resolved while {} is {}",
                self.id, resolution.phase
            )));
        }
        if let Some(existing) = resolution.temp_ids.get(&temp) {
            return Err(TxError::invariant_violation(format!(
                "{temp} already resolved to {existing}"
            )));
        }
        resolution.temp_ids.insert(temp, id);
        Ok(())
    }

    /// Rewrite temp ids in edits and deletions to real ids
    ///
    /// `ids` holds every temp id resolved so far, including the ones of this
    /// changeset. Edits of skipped nodes are dropped, as are pointers that
    /// target them. When a node was edited both before and after its creation
    /// was resolved, the later real-keyed edits win.
    ///
    /// # Errors
    /// - [`TxError::InvariantViolation`] unless called once, right after the creation phase
    /// - [`TxError::NotFound`] for a temp id that was never resolved
    pub fn resolve_temp_ids(&self, ids: &TempIdMap) -> Result<()> {
        let mut resolution = self.resolution.write();
        if resolution.phase != ApplyPhase::Creating {
            return Err(TxError::invariant_violation(format!(
                "temp ids of {} resolved while {}",
                self.id, resolution.phase
            )));
        }

        let resolve = |key: &NodeKey| -> Result<NodeId> {
            match key {
                NodeKey::Real(id) => Ok(id.clone()),
                NodeKey::Temp(temp) => resolution
                    .temp_ids
                    .get(temp)
                    .or_else(|| ids.get(temp))
                    .cloned()
                    .ok_or_else(|| TxError::not_found(format!("unresolved node {temp}"))),
            }
        };
        let elided = |key: &NodeKey| key.as_temp().is_some_and(|t| resolution.elided.contains(&t));

        let mut temp_keyed: IndexMap<NodeId, NodeEdits> = IndexMap::new();
        let mut real_keyed: IndexMap<NodeId, NodeEdits> = IndexMap::new();
        for (key, edits) in &self.edits {
            if elided(key) {
                tracing::debug!("Dropping edits of skipped node {}", key);
                continue;
            }
            let mut rewritten = NodeEdits {
                attr: edits.attr.clone(),
                ptr: IndexMap::with_capacity(edits.ptr.len()),
            };
            for (name, target) in &edits.ptr {
                if elided(target) {
                    tracing::debug!("Dropping pointer {} of {} to skipped node {}", name, key, target);
                    continue;
                }
                rewritten
                    .ptr
                    .insert(name.clone(), NodeKey::Real(resolve(target)?));
            }
            let id = resolve(key)?;
            let slot = if key.is_temp() {
                &mut temp_keyed
            } else {
                &mut real_keyed
            };
            slot.entry(id).or_default().merge(rewritten);
        }
        for (id, edits) in real_keyed {
            temp_keyed.entry(id).or_default().merge(edits);
        }
        temp_keyed.retain(|_, edits| !edits.is_empty());

        let mut deletions: Vec<NodeId> = Vec::with_capacity(self.deletions.len());
        for key in &self.deletions {
            if elided(key) {
                continue;
            }
            let id = resolve(key)?;
            if !deletions.contains(&id) {
                deletions.push(id);
            }
        }

        resolution.edits = temp_keyed;
        resolution.deletions = deletions;
        resolution.phase = ApplyPhase::Resolved;
        Ok(())
    }

    /// Move from `from` to the following phase
    ///
    /// # Errors
    /// Returns [`TxError::InvariantViolation`] when the changeset is not in `from`.
    pub(crate) fn advance(&self, from: ApplyPhase, to: ApplyPhase) -> Result<()> {
        let mut resolution = self.resolution.write();
        if resolution.phase != from {
            return Err(TxError::invariant_violation(format!(
                "{} cannot move to {to} while {}",
                self.id, resolution.phase
            )));
        }
        resolution.phase = to;
        Ok(())
    }
}

impl<N: Clone + Send + Sync> Changeset<N> {
    /// Load the real nodes to delete under `root`
    ///
    /// Nodes below another deleted node are left out, since deleting the
    /// ancestor removes them. All nodes are loaded before any is deleted.
    ///
    /// # Errors
    /// - [`TxError::InvariantViolation`] before temp ids are resolved
    /// - [`TxError::NotFound`] when a node no longer exists under `root`
    pub async fn deleted_nodes<S>(&self, root: &N, host: &S) -> Result<Vec<N>>
    where
        S: HostStore<Node = N> + ?Sized,
    {
        let ids = {
            let resolution = self.resolution.read();
            if resolution.phase < ApplyPhase::Resolved {
                return Err(TxError::invariant_violation(format!(
                    "deletions of {} requested before temp ids were resolved",
                    self.id
                )));
            }
            resolution.deletions.clone()
        };

        let outermost: Vec<&NodeId> = ids
            .iter()
            .filter(|id| !ids.iter().any(|other| other != *id && other.contains(id)))
            .collect();

        let mut nodes = Vec::with_capacity(outermost.len());
        for id in outermost {
            nodes.push(load_path(root, host, id).await?);
        }
        Ok(nodes)
    }
}

impl<N> fmt::Debug for Changeset<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changeset")
            .field("id", &self.id)
            .field("created", &self.created.len())
            .field("edits", &self.edits.len())
            .field("deletions", &self.deletions.len())
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tpc_model::NodeDescriptor;

    fn pending(base: NodeRef<u32>, parent: NodeRef<u32>) -> Arc<PendingNode<u32>> {
        Arc::new(PendingNode::create(NodeDescriptor::new(base, parent)).unwrap())
    }

    fn changeset(buffer: Buffer<u32>) -> Changeset<u32> {
        Changeset::from_buffer(buffer)
    }

    #[test]
    fn later_edits_win_on_merge() {
        let mut first = NodeEdits::default();
        first.attr.insert("name".into(), AttrEdit::Set(json!("a")));
        first.attr.insert("size".into(), AttrEdit::Set(json!(1)));

        let mut second = NodeEdits::default();
        second.attr.insert("name".into(), AttrEdit::Deleted);

        first.merge(second);
        assert_eq!(first.attr.get("name"), Some(&AttrEdit::Deleted));
        assert_eq!(first.attr.get("size"), Some(&AttrEdit::Set(json!(1))));
    }

    #[test]
    fn temp_keys_are_rewritten_after_creation() {
        let node = pending(NodeRef::Real(1), NodeRef::Real(0));
        let temp = node.temp_id();

        let mut buffer = Buffer::new();
        buffer.created.push(Arc::clone(&node));
        buffer
            .edits_for(NodeKey::Temp(temp))
            .attr
            .insert("name".into(), AttrEdit::Set(json!("A")));
        buffer
            .edits_for(NodeKey::Real(NodeId::new("/5")))
            .ptr
            .insert("ref".into(), NodeKey::Temp(temp));
        let cs = changeset(buffer);

        cs.begin_apply();
        cs.record_created(temp, NodeId::new("/9")).unwrap();
        let mut ids = TempIdMap::new();
        ids.insert(temp, NodeId::new("/9"));
        cs.resolve_temp_ids(&ids).unwrap();

        let edits = cs.resolved_edits().unwrap();
        assert_eq!(
            edits.get(&NodeId::new("/9")).unwrap().attr.get("name"),
            Some(&AttrEdit::Set(json!("A")))
        );
        assert_eq!(
            edits.get(&NodeId::new("/5")).unwrap().ptr.get("ref"),
            Some(&NodeKey::Real(NodeId::new("/9")))
        );
        assert_eq!(cs.phase(), ApplyPhase::Resolved);
        assert_eq!(cs.temp_id_map().get(&temp), Some(&NodeId::new("/9")));
        // staged content stays frozen
        assert!(cs.edits().contains_key(&NodeKey::Temp(temp)));
    }

    #[test]
    fn real_keyed_edits_override_temp_keyed() {
        let node = pending(NodeRef::Real(1), NodeRef::Real(0));
        let temp = node.temp_id();

        let mut buffer: Buffer<u32> = Buffer::new();
        buffer
            .edits_for(NodeKey::Temp(temp))
            .attr
            .insert("name".into(), AttrEdit::Set(json!("old")));
        buffer
            .edits_for(NodeKey::Real(NodeId::new("/3")))
            .attr
            .insert("name".into(), AttrEdit::Set(json!("new")));
        let cs = changeset(buffer);

        let mut ids = TempIdMap::new();
        ids.insert(temp, NodeId::new("/3"));
        cs.begin_apply();
        cs.resolve_temp_ids(&ids).unwrap();

        let edits = cs.resolved_edits().unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(
            edits[&NodeId::new("/3")].attr.get("name"),
            Some(&AttrEdit::Set(json!("new")))
        );
    }

    #[test]
    fn created_then_deleted_nodes_are_elided() {
        let parent = pending(NodeRef::Real(1), NodeRef::Real(0));
        let child = pending(NodeRef::Real(1), NodeRef::Pending(Arc::clone(&parent)));
        let derived = pending(NodeRef::Pending(Arc::clone(&parent)), NodeRef::Real(0));
        let kept = pending(NodeRef::Real(1), NodeRef::Real(0));

        let mut buffer = Buffer::new();
        for node in [&parent, &child, &derived, &kept] {
            buffer.created.push(Arc::clone(node));
        }
        buffer
            .edits_for(NodeKey::Temp(child.temp_id()))
            .attr
            .insert("name".into(), AttrEdit::Set(json!("child")));
        buffer
            .edits_for(NodeKey::Temp(kept.temp_id()))
            .ptr
            .insert("ref".into(), NodeKey::Temp(parent.temp_id()));
        buffer.deletions.push(NodeKey::Temp(parent.temp_id()));
        let cs = changeset(buffer);

        cs.begin_apply();
        assert!(cs.is_elided(parent.temp_id()));
        assert!(cs.is_elided(child.temp_id()));
        assert!(cs.is_elided(derived.temp_id()));
        assert!(!cs.is_elided(kept.temp_id()));

        cs.record_created(kept.temp_id(), NodeId::new("/2")).unwrap();
        cs.resolve_temp_ids(&cs.temp_id_map()).unwrap();

        assert!(cs.resolved_edits().unwrap().is_empty());
        assert!(cs.modified_node_ids().is_empty());
    }

    #[test]
    fn resolving_twice_is_rejected() {
        let node = pending(NodeRef::Real(1), NodeRef::Real(0));
        let mut buffer = Buffer::new();
        buffer.created.push(Arc::clone(&node));
        let cs = changeset(buffer);

        cs.begin_apply();
        cs.record_created(node.temp_id(), NodeId::new("/1")).unwrap();
        let err = cs
            .record_created(node.temp_id(), NodeId::new("/2"))
            .unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn phases_must_run_in_order() {
        let cs = changeset(Buffer::<u32>::new());

        let err = cs.resolve_temp_ids(&TempIdMap::new()).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(cs.resolved_edits().unwrap_err().is_invariant_violation());

        cs.begin_apply();
        assert!(cs.advance(ApplyPhase::Resolved, ApplyPhase::Edited).is_err());
        cs.resolve_temp_ids(&TempIdMap::new()).unwrap();
        assert!(cs.resolve_temp_ids(&TempIdMap::new()).is_err());
        cs.advance(ApplyPhase::Resolved, ApplyPhase::Edited).unwrap();
        cs.advance(ApplyPhase::Edited, ApplyPhase::Applied).unwrap();

        // a replay starts over
        cs.begin_apply();
        assert_eq!(cs.phase(), ApplyPhase::Creating);
    }

    #[test]
    fn unknown_temp_id_is_not_found() {
        let stray = TempId::next();
        let mut buffer: Buffer<u32> = Buffer::new();
        buffer.deletions.push(NodeKey::Temp(stray));
        let cs = changeset(buffer);

        cs.begin_apply();
        let err = cs.resolve_temp_ids(&TempIdMap::new()).unwrap_err();
        assert!(matches!(err, TxError::NotFound(_)));
    }
}
