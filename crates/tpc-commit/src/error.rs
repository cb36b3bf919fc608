//! Error types for the save protocol
//!
//! Provides error handling for:
//! - Apply failures, propagated from the transaction core
//! - Commit and load failures, propagated from the host store
//! - Saves blocked behind a failed changeset
//! - Commits that landed but could not be reloaded
//! - Invalid session configuration

use tpc_model::{CommitHash, StoreError};
use tpc_staging::{ChangesetId, TxError};

/// Save orchestrator error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// Transaction core failure
    #[error(transparent)]
    Transaction(#[from] TxError),

    /// Host store or project failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An earlier changeset is still queued; retry or abandon it first
    #[error("save blocked: {head} is still queued from a failed save")]
    Blocked {
        /// Changeset at the head of the queue
        head: ChangesetId,
    },

    /// The commit landed and its changeset was discarded, but the session
    /// could not reload from it; the next save reloads first
    #[error("committed {commit} but refreshing the session failed: {reason}")]
    Refresh {
        /// Commit the session now follows
        commit: CommitHash,
        /// Underlying failure
        reason: String,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl CommitError {
    /// Create configuration error
    #[inline]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if the failed changeset can be replayed with `retry`
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transaction(err) => err.is_retryable(),
            Self::Store(err) => err.is_retryable(),
            Self::Blocked { .. } | Self::Refresh { .. } | Self::Config(_) => false,
        }
    }
}

/// Result alias for the save protocol
pub type Result<T, E = CommitError> = std::result::Result<T, E>;
