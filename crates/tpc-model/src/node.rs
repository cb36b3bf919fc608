//! Tagged node handles
//!
//! A [`NodeRef`] is either a handle to a node that exists in the host store or
//! a [`PendingNode`] that so far only exists in a staging buffer. Every
//! operation matches on the tag instead of probing the handle at runtime.

use crate::error::NodeError;
use crate::id::{NodeId, TempId, TempIdMap};
use crate::store::HostStore;
use std::fmt;
use std::sync::Arc;

/// Node handle: persisted or pending
pub enum NodeRef<N> {
    /// Node created in a buffer but not yet persisted
    Pending(Arc<PendingNode<N>>),
    /// Node loaded from the host store
    Real(N),
}

impl<N: Clone> Clone for NodeRef<N> {
    fn clone(&self) -> Self {
        match self {
            Self::Pending(node) => Self::Pending(Arc::clone(node)),
            Self::Real(node) => Self::Real(node.clone()),
        }
    }
}

impl<N: fmt::Debug> fmt::Debug for NodeRef<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(node) => f.debug_tuple("Pending").field(&node.temp_id).finish(),
            Self::Real(node) => f.debug_tuple("Real").field(node).finish(),
        }
    }
}

impl<N> From<N> for NodeRef<N> {
    fn from(node: N) -> Self {
        Self::Real(node)
    }
}

impl<N> NodeRef<N> {
    /// Check if the node is pending
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Pending node, if any
    #[inline]
    #[must_use]
    pub fn as_pending(&self) -> Option<&Arc<PendingNode<N>>> {
        match self {
            Self::Pending(node) => Some(node),
            Self::Real(_) => None,
        }
    }

    /// Real handle, if any
    #[inline]
    #[must_use]
    pub fn as_real(&self) -> Option<&N> {
        match self {
            Self::Real(node) => Some(node),
            Self::Pending(_) => None,
        }
    }

    /// Temp id, if pending
    #[inline]
    #[must_use]
    pub fn temp_id(&self) -> Option<TempId> {
        self.as_pending().map(|node| node.temp_id)
    }
}

impl<N: Clone + Send + Sync> NodeRef<N> {
    /// Load the node under `root`
    ///
    /// Real handles are reloaded by path, since a handle is bound to the root
    /// it was loaded from. Pending nodes must already be resolved in `ids`.
    ///
    /// # Errors
    /// - [`NodeError::Unresolved`] for pending nodes missing from `ids`
    /// - [`NodeError::NotFound`] when the path no longer exists under `root`
    pub async fn load<S>(&self, root: &N, host: &S, ids: &TempIdMap) -> Result<N, NodeError>
    where
        S: HostStore<Node = N> + ?Sized,
    {
        let path = match self {
            Self::Real(node) => host.get_path(node),
            Self::Pending(node) => ids
                .get(&node.temp_id)
                .cloned()
                .ok_or(NodeError::Unresolved(node.temp_id))?,
        };
        load_path(root, host, &path).await
    }
}

/// Load a real node by path, failing when it is absent
///
/// # Errors
/// Returns [`NodeError::NotFound`] when the path does not exist under `root`.
pub async fn load_path<S>(root: &S::Node, host: &S, path: &NodeId) -> Result<S::Node, NodeError>
where
    S: HostStore + ?Sized,
{
    host.load_by_path(root, path)
        .await?
        .ok_or_else(|| NodeError::NotFound(path.clone()))
}

/// Description of a node to create
///
/// Both fields are required; they are optional here so that missing values
/// are reported as errors rather than being unrepresentable at call sites
/// that assemble descriptions dynamically.
pub struct NodeDescriptor<N> {
    /// Type the new node derives from
    pub base: Option<NodeRef<N>>,
    /// Container of the new node
    pub parent: Option<NodeRef<N>>,
}

impl<N> NodeDescriptor<N> {
    /// Describe a node with both base and parent
    #[inline]
    #[must_use]
    pub fn new(base: NodeRef<N>, parent: NodeRef<N>) -> Self {
        Self {
            base: Some(base),
            parent: Some(parent),
        }
    }
}

impl<N> Default for NodeDescriptor<N> {
    fn default() -> Self {
        Self {
            base: None,
            parent: None,
        }
    }
}

/// Node that has been created in a buffer but not persisted
///
/// # Invariants
/// - `temp_id` is stable for the whole buffered lifetime of the node
/// - the node is materialized in the host store at most once per apply
pub struct PendingNode<N> {
    temp_id: TempId,
    base: NodeRef<N>,
    parent: NodeRef<N>,
}

impl<N> PendingNode<N> {
    /// Create pending node with a fresh temp id
    ///
    /// # Errors
    /// Returns [`NodeError::MissingBase`] or [`NodeError::MissingParent`]
    /// when the description is incomplete.
    pub fn create(desc: NodeDescriptor<N>) -> Result<Self, NodeError> {
        let base = desc.base.ok_or(NodeError::MissingBase)?;
        let parent = desc.parent.ok_or(NodeError::MissingParent)?;
        Ok(Self {
            temp_id: TempId::next(),
            base,
            parent,
        })
    }

    /// Temporary identity
    #[inline]
    #[must_use]
    pub fn temp_id(&self) -> TempId {
        self.temp_id
    }

    /// Declared base
    #[inline]
    #[must_use]
    pub fn base(&self) -> &NodeRef<N> {
        &self.base
    }

    /// Declared parent
    #[inline]
    #[must_use]
    pub fn parent(&self) -> &NodeRef<N> {
        &self.parent
    }

    /// First real node on the declared base chain
    #[must_use]
    pub fn real_base(&self) -> &N {
        let mut current = &self.base;
        loop {
            match current {
                NodeRef::Real(node) => return node,
                NodeRef::Pending(pending) => current = &pending.base,
            }
        }
    }
}

impl<N: Clone + Send + Sync> PendingNode<N> {
    /// Materialize this node in the host store under `root`
    ///
    /// Base and parent are loaded under `root` first; pending ones must
    /// already be resolved in `ids`. Callers are responsible for calling
    /// this at most once per node.
    ///
    /// # Errors
    /// Returns [`NodeError`] when base or parent cannot be loaded, or the
    /// host store refuses the creation.
    pub async fn resolve<S>(&self, root: &N, host: &S, ids: &TempIdMap) -> Result<N, NodeError>
    where
        S: HostStore<Node = N> + ?Sized,
    {
        let parent = self.parent.load(root, host, ids).await?;
        let base = self.base.load(root, host, ids).await?;
        Ok(host.create_node(&base, &parent)?)
    }
}

impl<N: fmt::Debug> fmt::Debug for PendingNode<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingNode")
            .field("temp_id", &self.temp_id)
            .field("base", &self.base)
            .field("parent", &self.parent)
            .finish()
    }
}
