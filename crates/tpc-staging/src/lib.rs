//! TPC Staging
//!
//! Read-your-own-writes overlay over a versioned tree store.
//!
//! # Core Concepts
//!
//! - [`TransactionCore`]: buffers writes, answers reads through the buffers,
//!   and applies staged work in three phases
//! - [`Changeset`]: frozen content of one buffering interval, queued FIFO
//! - [`NodeEdits`] / [`AttrEdit`]: per-node attribute and pointer edits
//! - [`EventBus`]: synchronous `NodeCreated` notifications during apply
//!
//! # Example
//!
//! ```rust,ignore
//! use tpc_staging::TransactionCore;
//! use tpc_model::NodeDescriptor;
//!
//! let core = TransactionCore::new(store);
//! let node = core.create_node(NodeDescriptor::new(widget, root_ref))?;
//! core.set_attribute(&node, "name", "A")?;
//!
//! let changeset = core.stage();
//! core.apply(&root, &changeset).await?;
//! core.discard(&changeset)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
mod changeset;
mod error;
mod events;
mod transaction;

// Re-exports
pub use changeset::{ApplyPhase, AttrEdit, Changeset, ChangesetId, NodeEdits};
pub use error::{Result, TxError};
pub use events::{CoreEvent, EventBus, EventKind, Handler};
pub use transaction::TransactionCore;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
