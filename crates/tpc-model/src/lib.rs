//! TPC Model
//!
//! Node identity and the host-store boundary for staged transactions.
//!
//! # Core Concepts
//!
//! - [`NodeRef<N>`]: tagged handle, either [`NodeRef::Real`] or [`NodeRef::Pending`]
//! - [`PendingNode<N>`]: node created in a buffer, identified by a [`TempId`]
//! - [`NodeKey`]: key under which buffered edits are recorded
//! - [`HostStore`]: the versioned tree store the overlay writes through
//! - [`Project`]: branches and commits, including the merge-or-fork decision
//!
//! # Example
//!
//! ```rust,ignore
//! use tpc_model::{NodeDescriptor, NodeRef, PendingNode};
//!
//! let pending = PendingNode::create(NodeDescriptor::new(
//!     NodeRef::Real(widget),
//!     NodeRef::Real(root),
//! ))?;
//! let node = pending.resolve(&root, &store, &resolved_ids).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
mod error;
mod id;
mod node;
mod project;
mod store;
mod value;

// Re-exports
pub use error::{NodeError, StoreError};
pub use id::{NodeId, NodeKey, TempId, TempIdMap};
pub use node::{load_path, NodeDescriptor, NodeRef, PendingNode};
pub use project::{CommitHash, CommitResult, CommitStatus, Project, SaveRequest};
pub use store::{HostStore, Persisted, RootHash};
pub use value::AttrValue;

/// JSON value type used for attributes and registry entries
pub use serde_json::Value;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn pending_key_and_rendered_path_agree() {
        let pending = PendingNode::create(NodeDescriptor::new(
            NodeRef::Real(NodeId::new("/1")),
            NodeRef::Real(NodeId::root()),
        ))
        .unwrap();

        let key = NodeKey::from(pending.temp_id());
        assert_eq!(TempId::parse(&key.to_string()), Some(pending.temp_id()));
        assert!(key.as_real().is_none());
    }

    #[test]
    fn fork_status_display() {
        let status = CommitStatus::Forked {
            branch: "main_fork".into(),
        };
        assert!(status.is_forked());
        assert_eq!(status.to_string(), "FORKED (main_fork)");
        assert_eq!(CommitStatus::Synced.to_string(), "SYNCED");
    }
}
