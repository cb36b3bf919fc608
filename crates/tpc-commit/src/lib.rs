//! TPC Commit
//!
//! Serialized save protocol on top of the staging overlay.
//!
//! # Core Concepts
//!
//! - [`SaveOrchestrator`]: one save cycle at a time, in call order
//! - [`SavePhase`]: observable progress of the running cycle
//! - [`NodeCache`]: named node handles reloaded after every commit
//! - [`SessionConfig`]: branch, fork naming and logging settings
//!
//! # Example
//!
//! ```rust,ignore
//! use tpc_commit::{SaveOrchestrator, SessionConfig};
//!
//! let config = SessionConfig::from_toml_str(r#"branch = "master""#)?;
//! tpc_commit::init_tracing(&config.log_filter);
//!
//! let session = SaveOrchestrator::open(store.clone(), store, config).await?;
//! let node = session.core().create_node(desc)?;
//! session.core().set_attribute(&node, "name", "A")?;
//! let outcome = session.save("create A").await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

// Core modules
mod cache;
mod config;
mod error;
mod fork;
mod orchestrator;
mod telemetry;

// Re-exports
pub use cache::NodeCache;
pub use config::SessionConfig;
pub use error::{CommitError, Result};
pub use fork::{fork_name_candidate, sanitize};
pub use orchestrator::{ForkNotice, ForkObserver, SaveOrchestrator, SaveOutcome, SavePhase};
pub use telemetry::{init_tracing, try_init_tracing};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::Arc;
    use tpc_model::{CommitStatus, NodeDescriptor, NodeRef};
    use tpc_test_utils::Fixture;

    #[tokio::test]
    async fn create_and_save() {
        let fixture = Fixture::new(&["Widget"]).await;
        let session = SaveOrchestrator::open(
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.store),
            SessionConfig::new(),
        )
        .await
        .unwrap();

        let root = NodeRef::Real(session.root());
        let node = session
            .core()
            .create_node(NodeDescriptor::new(fixture.meta_ref("Widget"), root))
            .unwrap();
        session.core().set_attribute(&node, "name", "A").unwrap();

        let outcome = session.save("create A").await.unwrap();
        assert_eq!(outcome.status, CommitStatus::Synced);
        assert_eq!(session.core().queue_len(), 0);
        assert_eq!(fixture.store.find_by_name(&outcome.commit, "A").len(), 1);
    }

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
