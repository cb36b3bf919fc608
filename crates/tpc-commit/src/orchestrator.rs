//! Save Orchestrator
//!
//! Drives one save cycle at a time:
//! - Stages the live buffer when `save` is called
//! - Applies the changeset against the current root
//! - Persists and commits through the project
//! - Follows forks and notifies fork observers
//! - Reloads the root, the active node and every registered cache
//! - Discards the changeset once it is committed

use crate::cache::NodeCache;
use crate::config::SessionConfig;
use crate::error::{CommitError, Result};
use crate::fork::fork_name_candidate;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tpc_model::{
    AttrValue, CommitHash, CommitStatus, HostStore, NodeRef, Project, SaveRequest, Value,
};
use tpc_staging::{Changeset, ChangesetId, TransactionCore, TxError};

/// Stage of the running save cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SavePhase {
    /// No save running
    #[default]
    Idle,
    /// Changeset taken; fork name being computed
    Staging,
    /// Writing the changeset into the tree
    Applying,
    /// Persisting and committing
    Committing,
    /// Commit landed on a new branch
    Forked,
    /// Commit merged with concurrent work
    Merged,
    /// Commit fast-forwarded the branch
    Synced,
    /// Reloading root, active node and caches
    Refreshing,
}

impl fmt::Display for SavePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Staging => "staging",
            Self::Applying => "applying",
            Self::Committing => "committing",
            Self::Forked => "forked",
            Self::Merged => "merged",
            Self::Synced => "synced",
            Self::Refreshing => "refreshing",
        };
        f.write_str(name)
    }
}

/// Notification sent when a save lands on a fork branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkNotice {
    /// Branch the session now follows
    pub branch: String,
    /// Human readable message
    pub message: String,
}

/// Result of one committed save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Committed changeset
    pub changeset: ChangesetId,
    /// How the commit was integrated
    pub status: CommitStatus,
    /// New commit
    pub commit: CommitHash,
    /// Branch the session follows after the save
    pub branch: String,
}

/// Fork observer callback
pub type ForkObserver = Arc<dyn Fn(&ForkNotice) + Send + Sync>;

struct Session<N> {
    root: N,
    active: Option<NodeRef<N>>,
    commit: CommitHash,
    branch: String,
    /// `root` predates `commit`; reload before the next apply
    stale: bool,
}

/// Serialized save protocol over a [`TransactionCore`]
pub struct SaveOrchestrator<S: HostStore, P: Project> {
    config: SessionConfig,
    core: Arc<TransactionCore<S>>,
    project: Arc<P>,
    session: RwLock<Session<S::Node>>,
    caches: RwLock<IndexMap<String, NodeCache<S::Node>>>,
    save_lock: tokio::sync::Mutex<()>,
    phase: RwLock<SavePhase>,
    fork_observers: RwLock<Vec<ForkObserver>>,
}

impl<S: HostStore, P: Project> SaveOrchestrator<S, P> {
    /// Open a session on the head of the configured branch
    ///
    /// # Errors
    /// - [`CommitError::Config`] for invalid settings
    /// - [`CommitError::Store`] when the branch head cannot be loaded
    pub async fn open(host: Arc<S>, project: Arc<P>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let commit = project.branch_head(&config.branch).await?;
        let root_hash = project.root_of(&commit).await?;
        let root = host.load_root(&root_hash).await?;
        tracing::info!("Opened session on {} at {}", config.branch, commit);

        let branch = config.branch.clone();
        Ok(Self {
            config,
            core: Arc::new(TransactionCore::new(host)),
            project,
            session: RwLock::new(Session {
                root,
                active: None,
                commit,
                branch,
                stale: false,
            }),
            caches: RwLock::new(IndexMap::new()),
            save_lock: tokio::sync::Mutex::new(()),
            phase: RwLock::new(SavePhase::Idle),
            fork_observers: RwLock::new(Vec::new()),
        })
    }

    /// Transaction core all reads and writes go through
    #[inline]
    #[must_use]
    pub fn core(&self) -> &Arc<TransactionCore<S>> {
        &self.core
    }

    /// Session configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Root of the last commit
    #[must_use]
    pub fn root(&self) -> S::Node {
        self.session.read().root.clone()
    }

    /// Branch the session follows
    #[must_use]
    pub fn branch(&self) -> String {
        self.session.read().branch.clone()
    }

    /// Last commit of the session
    #[must_use]
    pub fn commit(&self) -> CommitHash {
        self.session.read().commit.clone()
    }

    /// Check if the root still has to be reloaded from the last commit
    ///
    /// Set when a commit landed but reloading from it failed. The next save,
    /// [`Self::retry`] or [`Self::reload`] reloads first.
    #[must_use]
    pub fn needs_reload(&self) -> bool {
        self.session.read().stale
    }

    /// Current save phase
    #[inline]
    #[must_use]
    pub fn phase(&self) -> SavePhase {
        *self.phase.read()
    }

    /// Node the session is working on
    #[must_use]
    pub fn active(&self) -> Option<NodeRef<S::Node>> {
        self.session.read().active.clone()
    }

    /// Set the node the session is working on
    pub fn set_active(&self, node: Option<NodeRef<S::Node>>) {
        self.session.write().active = node;
    }

    /// Register a cache reloaded after every save, replacing one of the same name
    pub fn register_cache(&self, name: impl Into<String>, cache: NodeCache<S::Node>) {
        self.caches.write().insert(name.into(), cache);
    }

    /// Snapshot of a registered cache
    #[must_use]
    pub fn cache(&self, name: &str) -> Option<NodeCache<S::Node>> {
        self.caches.read().get(name).cloned()
    }

    /// Single entry of a registered cache
    #[must_use]
    pub fn cached(&self, name: &str, key: &str) -> Option<NodeRef<S::Node>> {
        self.caches.read().get(name)?.get(key).cloned()
    }

    /// Register a fork observer
    pub fn on_fork<F>(&self, observer: F)
    where
        F: Fn(&ForkNotice) + Send + Sync + 'static,
    {
        self.fork_observers.write().push(Arc::new(observer));
    }

    /// Stage the live buffer and commit it once earlier saves have finished
    ///
    /// The changeset is staged when this is called, not when the future is
    /// first polled, so staging order is call order.
    ///
    /// # Errors
    /// - [`CommitError::Blocked`] when a failed changeset is still queued ahead
    /// - [`CommitError::Transaction`] when the apply fails
    /// - [`CommitError::Store`] when persisting or committing fails
    /// - [`CommitError::Refresh`] when the commit landed but reloading from it failed
    ///
    /// Until the commit lands a failed changeset stays queued; see
    /// [`Self::retry`] and [`Self::abandon`].
    pub fn save(
        &self,
        message: impl Into<String>,
    ) -> impl Future<Output = Result<SaveOutcome>> + '_ {
        let changeset = self.core.stage();
        let message = message.into();
        tracing::debug!("Staged {} for save", changeset.id());

        async move {
            let _guard = self.save_lock.lock().await;
            self.run_cycle(&changeset, &message).await
        }
    }

    /// Replay the changeset at the head of the queue against a freshly loaded root
    ///
    /// # Errors
    /// Same as [`Self::save`]; [`CommitError::Transaction`] when nothing is queued.
    pub async fn retry(&self, message: impl Into<String>) -> Result<SaveOutcome> {
        let message = message.into();
        let _guard = self.save_lock.lock().await;
        let head = self
            .core
            .queue_head()
            .ok_or_else(|| TxError::invariant_violation("no changeset to retry"))?;
        tracing::info!("Retrying {}", head.id());

        self.reload_session().await?;
        self.run_cycle(&head, &message).await
    }

    /// Drop the changeset at the head of the queue without committing it
    ///
    /// # Errors
    /// [`CommitError::Transaction`] when nothing is queued, or
    /// [`CommitError::Store`] when the root cannot be reloaded.
    pub async fn abandon(&self) -> Result<ChangesetId> {
        let _guard = self.save_lock.lock().await;
        let head = self
            .core
            .queue_head()
            .ok_or_else(|| TxError::invariant_violation("no changeset to abandon"))?;

        self.core.discard(&head)?;
        tracing::warn!("Abandoned {}", head.id());
        self.reload_session().await?;
        Ok(head.id())
    }

    /// Reload root, active node and caches from the last commit
    ///
    /// # Errors
    /// [`CommitError::Store`] or [`CommitError::Transaction`] when loading fails.
    pub async fn reload(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        self.reload_session().await
    }

    fn set_phase(&self, phase: SavePhase) {
        *self.phase.write() = phase;
        tracing::debug!("Save phase: {}", phase);
    }

    async fn run_cycle(
        &self,
        changeset: &Arc<Changeset<S::Node>>,
        message: &str,
    ) -> Result<SaveOutcome> {
        match self.core.queue_head() {
            Some(head) if Arc::ptr_eq(&head, changeset) => {}
            Some(head) => {
                tracing::warn!("Cannot save {}: {} is still queued", changeset.id(), head.id());
                return Err(CommitError::Blocked { head: head.id() });
            }
            None => {
                return Err(TxError::invariant_violation(format!(
                    "{} is not queued",
                    changeset.id()
                ))
                .into());
            }
        }

        let result = self.commit_changeset(changeset, message).await;
        if let Err(err) = &result {
            tracing::error!("Save of {} failed: {}", changeset.id(), err);
            self.set_phase(SavePhase::Idle);
        }
        result
    }

    async fn commit_changeset(
        &self,
        changeset: &Arc<Changeset<S::Node>>,
        message: &str,
    ) -> Result<SaveOutcome> {
        self.set_phase(SavePhase::Staging);
        let stale = self.session.read().stale;
        if stale {
            tracing::info!("Reloading session before applying {}", changeset.id());
            self.reload_session().await?;
        }
        let (branch, parent, root) = {
            let session = self.session.read();
            (
                session.branch.clone(),
                session.commit.clone(),
                session.root.clone(),
            )
        };
        let branches = self.project.branch_names().await?;
        let fork_name =
            fork_name_candidate(self.config.fork_base(), &self.config.fork_suffix, &branches);

        self.set_phase(SavePhase::Applying);
        self.core.apply(&root, changeset).await?;

        self.set_phase(SavePhase::Committing);
        let persisted = self.core.persist(&root).await?;
        let result = self
            .project
            .save(SaveRequest {
                branch: branch.clone(),
                parent,
                root: persisted.root_hash,
                fork_name,
                message: message.to_string(),
            })
            .await?;
        tracing::info!("Save finished w/ status: {}", result.status);

        let branch = match &result.status {
            CommitStatus::Forked { branch: fork } => {
                self.set_phase(SavePhase::Forked);
                self.notify_fork(fork);
                fork.clone()
            }
            CommitStatus::Merged => {
                self.set_phase(SavePhase::Merged);
                branch
            }
            CommitStatus::Synced => {
                self.set_phase(SavePhase::Synced);
                branch
            }
        };

        // the commit has landed; the changeset must never be applied again
        {
            let mut session = self.session.write();
            session.commit = result.hash.clone();
            session.branch = branch.clone();
            session.stale = true;
        }
        self.core.discard(changeset)?;

        self.set_phase(SavePhase::Refreshing);
        if let Err(err) = self.refresh(result.hash.clone(), branch.clone()).await {
            return Err(CommitError::Refresh {
                commit: result.hash,
                reason: err.to_string(),
            });
        }
        self.set_phase(SavePhase::Idle);

        Ok(SaveOutcome {
            changeset: changeset.id(),
            status: result.status,
            commit: result.hash,
            branch,
        })
    }

    fn active_name(&self) -> String {
        let value = self.active().and_then(|node| {
            self.core
                .get_attribute(&node, &self.config.active_attribute)
                .ok()
                .and_then(AttrValue::into_value)
        });
        match value {
            Some(Value::String(name)) => name,
            Some(other) => other.to_string(),
            None => self.config.fork_base().to_string(),
        }
    }

    fn notify_fork(&self, branch: &str) {
        let notice = ForkNotice {
            branch: branch.to_string(),
            message: format!(
                "\"{}\" execution has forked to \"{}\"",
                self.active_name(),
                branch
            ),
        };
        tracing::warn!("{}", notice.message);

        let observers = self.fork_observers.read().clone();
        for observer in &observers {
            observer(&notice);
        }
    }

    async fn reload_session(&self) -> Result<()> {
        let (commit, branch) = {
            let session = self.session.read();
            (session.commit.clone(), session.branch.clone())
        };
        self.refresh(commit, branch).await
    }

    /// Reload a handle under `root`; `None` when the node no longer exists
    async fn reload_node(
        &self,
        root: &S::Node,
        node: &NodeRef<S::Node>,
    ) -> Result<Option<NodeRef<S::Node>>> {
        let id = match node {
            NodeRef::Pending(pending) => match self.core.resolved_id(pending.temp_id()) {
                Some(id) => id,
                None => return Ok(Some(node.clone())),
            },
            NodeRef::Real(real) => self.core.host().get_path(real),
        };
        let loaded = self.core.host().load_by_path(root, &id).await?;
        Ok(loaded.map(NodeRef::Real))
    }

    async fn refresh(&self, commit: CommitHash, branch: String) -> Result<()> {
        let root_hash = self.project.root_of(&commit).await?;
        let root = self.core.load_root(&root_hash).await?;
        if let Err(err) = self.rebind_all(&root).await {
            self.core.host().release(&root);
            return Err(err);
        }

        let previous = {
            let mut session = self.session.write();
            session.commit = commit;
            session.branch = branch;
            session.stale = false;
            std::mem::replace(&mut session.root, root)
        };
        self.core.host().release(&previous);
        tracing::debug!("Refreshed session at {}", self.commit());
        Ok(())
    }

    /// Move the active node, every cache and the core's handles under `root`
    async fn rebind_all(&self, root: &S::Node) -> Result<()> {
        self.core.rebind(root).await?;

        let active = self.active();
        let active = match active {
            Some(node) => {
                let reloaded = self.reload_node(root, &node).await?;
                if reloaded.is_none() {
                    tracing::warn!("Active node {} no longer exists", self.core.key_of(&node));
                }
                reloaded
            }
            None => None,
        };

        let entries: Vec<(String, String, NodeRef<S::Node>)> = self
            .caches
            .read()
            .iter()
            .flat_map(|(name, cache)| {
                cache
                    .iter()
                    .map(|(key, node)| (name.clone(), key.to_string(), node.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut reloaded = Vec::with_capacity(entries.len());
        for (name, key, node) in entries {
            let node = self.reload_node(root, &node).await?;
            reloaded.push((name, key, node));
        }

        {
            let mut caches = self.caches.write();
            for (name, key, node) in reloaded {
                let Some(cache) = caches.get_mut(&name) else {
                    continue;
                };
                match node {
                    Some(node) => {
                        cache.insert(key, node);
                    }
                    None => {
                        tracing::warn!("Dropping {}.{}: node no longer exists", name, key);
                        cache.remove(&key);
                    }
                }
            }
        }

        self.session.write().active = active;
        Ok(())
    }
}

impl<S: HostStore, P: Project> fmt::Debug for SaveOrchestrator<S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session.read();
        f.debug_struct("SaveOrchestrator")
            .field("branch", &session.branch)
            .field("commit", &session.commit)
            .field("phase", &self.phase())
            .field("queued", &self.core.queue_len())
            .field("caches", &self.caches.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tpc_model::{NodeDescriptor, StoreError};
    use tpc_test_utils::{Fixture, MemoryStore};

    async fn open(fixture: &Fixture) -> SaveOrchestrator<MemoryStore, MemoryStore> {
        SaveOrchestrator::open(
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.store),
            SessionConfig::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn open_checks_out_branch_head() {
        let fixture = Fixture::new(&["Widget"]).await;
        let orchestrator = open(&fixture).await;

        assert_eq!(orchestrator.branch(), "master");
        assert_eq!(orchestrator.commit(), fixture.store.head("master").unwrap());
        assert_eq!(orchestrator.phase(), SavePhase::Idle);
    }

    #[tokio::test]
    async fn open_rejects_unknown_branch() {
        let fixture = Fixture::new(&[]).await;
        let result = SaveOrchestrator::open(
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.store),
            SessionConfig::new().with_branch("missing"),
        )
        .await;
        assert!(matches!(
            result,
            Err(CommitError::Store(StoreError::UnknownBranch(_)))
        ));
    }

    #[tokio::test]
    async fn failed_save_returns_to_idle() {
        let fixture = Fixture::new(&["Widget"]).await;
        let orchestrator = open(&fixture).await;
        let root = NodeRef::Real(orchestrator.root());
        let widget = NodeRef::Real(fixture.meta("Widget"));
        orchestrator
            .core()
            .create_node(NodeDescriptor::new(widget, root))
            .unwrap();

        fixture
            .store
            .fail_next_save(StoreError::Commit("offline".into()));
        let err = orchestrator.save("broken").await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(orchestrator.phase(), SavePhase::Idle);
        assert_eq!(orchestrator.core().queue_len(), 1);
    }

    #[test]
    fn phase_display() {
        assert_eq!(SavePhase::Refreshing.to_string(), "refreshing");
        assert_eq!(SavePhase::default(), SavePhase::Idle);
    }
}
