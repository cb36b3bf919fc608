//! Error types for the staging overlay
//!
//! Provides error handling for:
//! - Invalid buffering calls (missing base, unset values, deleted nodes)
//! - Out-of-order apply and discard
//! - Nodes that vanished from the host store
//! - Failing event handlers

use tpc_model::{NodeError, StoreError};

/// Transaction core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TxError {
    /// Caller passed an argument the buffer cannot accept
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Ordering or lifecycle rule broken
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Node does not exist under the root being applied to
    #[error("not found: {0}")]
    NotFound(String),

    /// Host store failure, propagated unchanged
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Event handler failed
    #[error("event handler failed: {0}")]
    Observer(String),
}

impl TxError {
    /// Create invalid argument error
    #[inline]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create invariant violation error
    #[inline]
    pub fn invariant_violation(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create not found error
    #[inline]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create observer error
    #[inline]
    pub fn observer(msg: impl Into<String>) -> Self {
        Self::Observer(msg.into())
    }

    /// Check if error is an ordering or lifecycle violation
    #[inline]
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<NodeError> for TxError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::MissingBase | NodeError::MissingParent => {
                Self::InvalidArgument(err.to_string())
            }
            NodeError::Unresolved(_) => Self::InvariantViolation(err.to_string()),
            NodeError::NotFound(_) => Self::NotFound(err.to_string()),
            NodeError::Store(store) => Self::Store(store),
        }
    }
}

/// Result alias for the staging overlay
pub type Result<T, E = TxError> = std::result::Result<T, E>;
