//! Error types for the host-store boundary
//!
//! - [`StoreError`]: failures reported by the host store or project
//! - [`NodeError`]: failures while describing or materializing pending nodes

use crate::id::{NodeId, TempId};

/// Errors originating from the host store or the project it belongs to
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Storage I/O failed
    #[error("storage io failed: {0}")]
    Io(String),

    /// Commit could not be made
    #[error("commit failed: {0}")]
    Commit(String),

    /// Root hash is not known to the store
    #[error("unknown root: {0}")]
    UnknownRoot(String),

    /// Commit hash is not known to the project
    #[error("unknown commit: {0}")]
    UnknownCommit(String),

    /// Branch does not exist
    #[error("unknown branch: {0}")]
    UnknownBranch(String),

    /// Node handle does not refer to a live node
    #[error("invalid node: {0}")]
    InvalidNode(NodeId),

    /// Store refused the operation
    #[error("operation rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Check if the failure may go away on retry
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Commit(_))
    }
}

/// Errors while creating or materializing pending nodes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeError {
    /// Node description lacks a base
    #[error("cannot create node without base")]
    MissingBase,

    /// Node description lacks a parent
    #[error("cannot create node without parent")]
    MissingParent,

    /// Pending node referenced before it was persisted
    #[error("creation id not resolved to actual id: {0}")]
    Unresolved(TempId),

    /// Real node could not be loaded under the given root
    #[error("node not found: {0}")]
    NotFound(NodeId),

    /// Host store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StoreError::Io("disk".into()).is_retryable());
        assert!(StoreError::Commit("busy".into()).is_retryable());
        assert!(!StoreError::UnknownBranch("main".into()).is_retryable());
    }

    #[test]
    fn store_errors_pass_through_unchanged() {
        let err = NodeError::from(StoreError::Io("disk".into()));
        assert_eq!(err.to_string(), "storage io failed: disk");
    }
}
