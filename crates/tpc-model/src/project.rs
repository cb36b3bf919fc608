//! Project boundary: branches and commits
//!
//! The merge-or-fork decision belongs to the [`Project`]; the overlay only
//! reacts to the [`CommitStatus`] it reports.

use crate::error::StoreError;
use crate::store::RootHash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Commit hash
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitHash(String);

impl CommitHash {
    /// Wrap a hash string
    #[inline]
    #[must_use]
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Hash as string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request to commit a persisted root onto a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveRequest {
    /// Branch to advance
    pub branch: String,
    /// Commit the root was derived from
    pub parent: CommitHash,
    /// Persisted root to commit
    pub root: RootHash,
    /// Branch to create if the commit cannot be merged
    pub fork_name: String,
    /// Commit message
    pub message: String,
}

/// How the project integrated a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitStatus {
    /// Branch had advanced; the commit was merged into its head
    Merged,
    /// Branch head was the parent; the commit fast-forwarded it
    Synced,
    /// Commit conflicted and was placed on a new branch
    Forked {
        /// Name of the new branch
        branch: String,
    },
}

impl CommitStatus {
    /// Check if the commit forked
    #[inline]
    #[must_use]
    pub fn is_forked(&self) -> bool {
        matches!(self, Self::Forked { .. })
    }
}

impl Display for CommitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merged => f.write_str("MERGED"),
            Self::Synced => f.write_str("SYNCED"),
            Self::Forked { branch } => write!(f, "FORKED ({branch})"),
        }
    }
}

/// Outcome of a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    /// Integration status
    pub status: CommitStatus,
    /// Hash of the new commit
    pub hash: CommitHash,
}

/// Versioned project holding branches of commits
#[async_trait]
pub trait Project: Send + Sync {
    /// Names of all branches
    async fn branch_names(&self) -> Result<Vec<String>, StoreError>;

    /// Head commit of a branch
    async fn branch_head(&self, branch: &str) -> Result<CommitHash, StoreError>;

    /// Commit a persisted root, merging or forking as needed
    async fn save(&self, request: SaveRequest) -> Result<CommitResult, StoreError>;

    /// Root hash of a commit
    async fn root_of(&self, commit: &CommitHash) -> Result<RootHash, StoreError>;
}
