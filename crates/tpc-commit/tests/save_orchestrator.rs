//! Save cycle scenarios against the in-memory store

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tpc_commit::{CommitError, ForkNotice, NodeCache, SaveOrchestrator, SavePhase, SessionConfig};
use tpc_model::{
    CommitHash, CommitResult, CommitStatus, HostStore, NodeDescriptor, NodeRef, Project, RootHash,
    SaveRequest, StoreError, Value,
};
use tpc_test_utils::{init_test_tracing, ConflictPolicy, Fixture, MemNode, MemoryStore, StoreOp};

type Session = SaveOrchestrator<MemoryStore, MemoryStore>;

async fn open(fixture: &Fixture, config: SessionConfig) -> Session {
    init_test_tracing();
    SaveOrchestrator::open(Arc::clone(&fixture.store), Arc::clone(&fixture.store), config)
        .await
        .unwrap()
}

fn create_named<P: Project>(
    session: &SaveOrchestrator<MemoryStore, P>,
    fixture: &Fixture,
    parent: NodeRef<MemNode>,
    name: &str,
) -> NodeRef<MemNode> {
    let node = session
        .core()
        .create_node(NodeDescriptor::new(fixture.meta_ref("Widget"), parent))
        .unwrap();
    session.core().set_attribute(&node, "name", name).unwrap();
    node
}

fn root_ref<P: Project>(session: &SaveOrchestrator<MemoryStore, P>) -> NodeRef<MemNode> {
    NodeRef::Real(session.root())
}

/// Project whose commit roots cannot be read once, right after a save
struct FlakyRoots {
    store: Arc<MemoryStore>,
    armed: AtomicBool,
    failing: AtomicBool,
}

impl FlakyRoots {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            armed: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    fn fail_root_after_next_save(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Project for FlakyRoots {
    async fn branch_names(&self) -> Result<Vec<String>, StoreError> {
        self.store.branch_names().await
    }

    async fn branch_head(&self, branch: &str) -> Result<CommitHash, StoreError> {
        self.store.branch_head(branch).await
    }

    async fn save(&self, request: SaveRequest) -> Result<CommitResult, StoreError> {
        let result = self.store.save(request).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.failing.store(true, Ordering::SeqCst);
        }
        Ok(result)
    }

    async fn root_of(&self, commit: &CommitHash) -> Result<RootHash, StoreError> {
        if self.failing.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Io("transient".into()));
        }
        self.store.root_of(commit).await
    }
}

#[tokio::test]
async fn synced_save_commits_on_the_branch() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;
    let parent = session.commit();

    create_named(&session, &fixture, root_ref(&session), "A");
    let outcome = session.save("create A").await?;

    assert_eq!(outcome.status, CommitStatus::Synced);
    assert_eq!(outcome.branch, "master");
    assert_eq!(fixture.store.head("master"), Some(outcome.commit.clone()));
    assert_eq!(session.commit(), outcome.commit);
    assert_eq!(session.phase(), SavePhase::Idle);
    assert_eq!(session.core().queue_len(), 0);

    let record = fixture.store.commit_record(&outcome.commit).unwrap();
    assert_eq!(record.parents, vec![parent]);
    assert_eq!(record.message, "create A");
    assert_eq!(fixture.store.find_by_name(&outcome.commit, "A").len(), 1);
    Ok(())
}

#[tokio::test]
async fn diverged_branch_forks_and_notifies() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    fixture.store.set_conflict_policy(ConflictPolicy::Fork);
    let session = open(&fixture, SessionConfig::new()).await;

    let notices = Arc::new(Mutex::new(Vec::<ForkNotice>::new()));
    let sink = Arc::clone(&notices);
    session.on_fork(move |notice| sink.lock().push(notice.clone()));

    fixture
        .store
        .advance_branch("master", "concurrent edit", |store, root| {
            store.set_attribute(root, "name", Value::from("elsewhere"))
        })
        .await?;

    let job = create_named(&session, &fixture, root_ref(&session), "job");
    session.set_active(Some(job));
    let outcome = session.save("run job").await?;

    assert_eq!(
        outcome.status,
        CommitStatus::Forked {
            branch: "master_fork".into()
        }
    );
    assert_eq!(session.branch(), "master_fork");
    assert_eq!(fixture.store.head("master_fork"), Some(outcome.commit.clone()));
    assert_eq!(
        notices.lock().clone(),
        vec![ForkNotice {
            branch: "master_fork".into(),
            message: "\"job\" execution has forked to \"master_fork\"".into(),
        }]
    );

    // the active node now refers to the committed node
    let active = session.active().unwrap();
    let node = active.as_real().unwrap();
    assert_eq!(node.tree(), session.root().tree());
    assert_eq!(
        fixture.store.find_by_name(&outcome.commit, "job"),
        vec![node.path().clone()]
    );
    Ok(())
}

#[tokio::test]
async fn second_fork_gets_a_numbered_name() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    fixture.store.set_conflict_policy(ConflictPolicy::Fork);
    let session = open(&fixture, SessionConfig::new().with_fork_name_base("nightly-run")).await;

    for round in 0..2 {
        let branch = session.branch();
        fixture
            .store
            .advance_branch(&branch, "concurrent edit", |store, root| {
                store.set_attribute(root, "round", Value::from(round))
            })
            .await?;
        create_named(&session, &fixture, root_ref(&session), "x");
        session.save("x").await?;
    }

    assert_eq!(session.branch(), "nightly_run_fork_2");
    assert!(fixture.store.head("nightly_run_fork").is_some());
    Ok(())
}

#[tokio::test]
async fn diverged_branch_merges_by_default() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;
    let concurrent = fixture
        .store
        .advance_branch("master", "concurrent edit", |store, root| {
            store.set_attribute(root, "name", Value::from("elsewhere"))
        })
        .await?;

    create_named(&session, &fixture, root_ref(&session), "A");
    let outcome = session.save("create A").await?;

    assert_eq!(outcome.status, CommitStatus::Merged);
    assert_eq!(session.branch(), "master");
    assert_eq!(fixture.store.head("master"), Some(outcome.commit.clone()));
    let record = fixture.store.commit_record(&outcome.commit).unwrap();
    assert!(record.parents.contains(&concurrent));
    Ok(())
}

#[tokio::test]
async fn failed_commit_blocks_until_retried() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;
    let start = session.commit();

    create_named(&session, &fixture, root_ref(&session), "A");
    fixture
        .store
        .fail_next_save(StoreError::Commit("offline".into()));
    let err = session.save("create A").await.unwrap_err();
    assert_eq!(err, CommitError::Store(StoreError::Commit("offline".into())));
    assert_eq!(session.core().queue_len(), 1);
    assert_eq!(session.commit(), start);
    let failed = session.core().queue_head().unwrap().id();

    create_named(&session, &fixture, root_ref(&session), "B");
    let blocked = session.save("create B").await.unwrap_err();
    assert_eq!(blocked, CommitError::Blocked { head: failed });
    assert_eq!(session.core().queue_len(), 2);

    let first = session.retry("create A").await?;
    assert_eq!(first.changeset, failed);
    let second = session.retry("create B").await?;
    assert_eq!(session.core().queue_len(), 0);

    // the retry starts from the committed root, not the half-applied one
    assert_eq!(fixture.store.find_by_name(&first.commit, "A").len(), 1);
    assert_eq!(fixture.store.find_by_name(&second.commit, "A").len(), 1);
    assert_eq!(fixture.store.find_by_name(&second.commit, "B").len(), 1);
    Ok(())
}

#[tokio::test]
async fn abandon_drops_the_failed_changeset() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;
    let start = session.commit();

    create_named(&session, &fixture, root_ref(&session), "A");
    fixture
        .store
        .fail_next_save(StoreError::Commit("offline".into()));
    assert!(session.save("create A").await.is_err());
    let failed = session.core().queue_head().unwrap().id();

    assert_eq!(session.abandon().await?, failed);
    assert_eq!(session.core().queue_len(), 0);
    assert_eq!(session.commit(), start);
    assert_eq!(fixture.store.head("master"), Some(start));

    // the reloaded root no longer holds the half-applied node
    let children = session.core().load_children(&root_ref(&session)).await?;
    assert_eq!(children.len(), fixture.meta.len());

    let err = session.abandon().await.unwrap_err();
    assert!(matches!(err, CommitError::Transaction(e) if e.is_invariant_violation()));
    Ok(())
}

#[tokio::test]
async fn concurrent_saves_apply_in_call_order() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;
    fixture.store.clear_journal();

    create_named(&session, &fixture, root_ref(&session), "A");
    let first = session.save("one");
    create_named(&session, &fixture, root_ref(&session), "B");
    let second = session.save("two");
    let (first, second) = tokio::join!(first, second);
    let (first, second) = (first?, second?);

    assert_eq!(first.status, CommitStatus::Synced);
    assert_eq!(second.status, CommitStatus::Synced);
    let record = fixture.store.commit_record(&second.commit).unwrap();
    assert_eq!(record.parents, vec![first.commit.clone()]);

    assert_eq!(fixture.store.find_by_name(&first.commit, "A").len(), 1);
    assert!(fixture.store.find_by_name(&first.commit, "B").is_empty());
    assert_eq!(fixture.store.find_by_name(&second.commit, "A").len(), 1);
    assert_eq!(fixture.store.find_by_name(&second.commit, "B").len(), 1);

    // the second apply ran on the root loaded from the first commit
    let persisted: Vec<u64> = fixture
        .store
        .journal()
        .iter()
        .filter_map(|op| match op {
            StoreOp::Persist { tree, .. } => Some(*tree),
            _ => None,
        })
        .collect();
    assert_eq!(persisted.len(), 2);
    let first_root = fixture.store.root_of(&first.commit).await?;
    assert_eq!(fixture.store.loaded_from(persisted[1]), Some(first_root));
    Ok(())
}

#[tokio::test]
async fn nested_creation_across_saves() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;

    let a = create_named(&session, &fixture, root_ref(&session), "A");
    let first = session.save("create A");

    let b = create_named(&session, &fixture, a.clone(), "B");
    session.core().set_pointer(&b, "ref", &a)?;
    let second = session.save("create B");

    let (first, second) = tokio::join!(first, second);
    let (_, second) = (first?, second?);

    let a_path = fixture.store.find_by_name(&second.commit, "A").pop().unwrap();
    let b_path = fixture.store.find_by_name(&second.commit, "B").pop().unwrap();
    assert_eq!(fixture.store.parent_at(&second.commit, &b_path), Some(a_path.clone()));
    assert_eq!(fixture.store.pointer_at(&second.commit, &b_path, "ref"), Some(a_path));
    Ok(())
}

#[tokio::test]
async fn caches_follow_the_committed_root() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;

    let fresh = create_named(&session, &fixture, root_ref(&session), "fresh");
    let cache: NodeCache<MemNode> = [("Widget", fixture.meta_ref("Widget")), ("fresh", fresh)]
        .into_iter()
        .collect();
    session.register_cache("META", cache);

    let outcome = session.save("create fresh").await?;
    let tree = session.root().tree();

    let widget = session.cached("META", "Widget").unwrap();
    assert_eq!(widget.as_real().map(MemNode::tree), Some(tree));
    let fresh = session.cached("META", "fresh").unwrap();
    let node = fresh.as_real().unwrap();
    assert_eq!(node.tree(), tree);
    assert_eq!(
        fixture.store.find_by_name(&outcome.commit, "fresh"),
        vec![node.path().clone()]
    );

    // deleting a cached node drops its entry on the next refresh
    session.core().delete_node(&fresh);
    session.save("delete fresh").await?;
    let cache = session.cache("META").unwrap();
    assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["Widget"]);
    Ok(())
}

#[tokio::test]
async fn unsaved_pending_entries_stay_pending() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;

    create_named(&session, &fixture, root_ref(&session), "saved");
    let first = session.save("first");

    // created after the first save staged its changeset
    let later = create_named(&session, &fixture, root_ref(&session), "later");
    session.register_cache("nodes", [("later", later)].into_iter().collect());
    first.await?;

    assert!(session.cached("nodes", "later").unwrap().is_pending());
    session.save("second").await?;
    assert!(!session.cached("nodes", "later").unwrap().is_pending());
    Ok(())
}

#[tokio::test]
async fn created_then_deleted_is_never_materialized() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;
    let before = fixture.store.paths_at(&session.commit()).len();
    fixture.store.clear_journal();

    let ghost = create_named(&session, &fixture, root_ref(&session), "ghost");
    create_named(&session, &fixture, ghost.clone(), "child");
    session.core().delete_node(&ghost);
    let outcome = session.save("nothing").await?;

    assert_eq!(fixture.store.paths_at(&outcome.commit).len(), before);
    assert!(!fixture
        .store
        .journal()
        .iter()
        .any(|op| matches!(op, StoreOp::Create { .. })));
    Ok(())
}

#[tokio::test]
async fn failed_refresh_does_not_recommit() -> anyhow::Result<()> {
    init_test_tracing();
    let fixture = Fixture::new(&["Widget"]).await;
    let project = Arc::new(FlakyRoots::new(Arc::clone(&fixture.store)));
    let session =
        SaveOrchestrator::open(Arc::clone(&fixture.store), Arc::clone(&project), SessionConfig::new())
            .await?;

    create_named(&session, &fixture, root_ref(&session), "A");
    project.fail_root_after_next_save();
    let err = session.save("create A").await.unwrap_err();

    let head = fixture.store.head("master").unwrap();
    assert_eq!(
        err,
        CommitError::Refresh {
            commit: head.clone(),
            reason: "storage io failed: transient".into(),
        }
    );
    assert!(!err.is_retryable());
    assert_eq!(session.commit(), head);
    assert_eq!(session.phase(), SavePhase::Idle);
    assert_eq!(session.core().queue_len(), 0);
    assert!(session.needs_reload());

    // the committed changeset is gone, so there is nothing to replay
    let retried = session.retry("create A").await.unwrap_err();
    assert!(matches!(retried, CommitError::Transaction(e) if e.is_invariant_violation()));

    create_named(&session, &fixture, root_ref(&session), "B");
    let outcome = session.save("create B").await?;
    assert_eq!(outcome.status, CommitStatus::Synced);
    assert!(!session.needs_reload());

    let record = fixture.store.commit_record(&outcome.commit).unwrap();
    assert_eq!(record.parents, vec![head]);
    assert_eq!(fixture.store.find_by_name(&outcome.commit, "A").len(), 1);
    assert_eq!(fixture.store.find_by_name(&outcome.commit, "B").len(), 1);
    Ok(())
}

#[tokio::test]
async fn pending_handles_follow_later_commits() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;

    let a = create_named(&session, &fixture, root_ref(&session), "A");
    session.save("create A").await?;
    assert_eq!(
        session.core().get_attribute(&a, "name")?.into_value(),
        Some(Value::from("A"))
    );

    session.core().set_attribute(&a, "name", "renamed")?;
    let outcome = session.save("rename A").await?;
    assert_eq!(
        session.core().get_attribute(&a, "name")?.into_value(),
        Some(Value::from("renamed"))
    );
    assert_eq!(fixture.store.find_by_name(&outcome.commit, "renamed").len(), 1);
    assert!(fixture.store.find_by_name(&outcome.commit, "A").is_empty());
    Ok(())
}

#[tokio::test]
async fn saves_release_replaced_roots() -> anyhow::Result<()> {
    let fixture = Fixture::new(&["Widget"]).await;
    let session = open(&fixture, SessionConfig::new()).await;
    let checked_out = fixture.store.checked_out();
    fixture.store.clear_journal();

    for name in ["A", "B", "C"] {
        create_named(&session, &fixture, root_ref(&session), name);
        session.save(name).await?;
    }

    assert_eq!(fixture.store.checked_out(), checked_out);
    let released = fixture
        .store
        .journal()
        .iter()
        .filter(|op| matches!(op, StoreOp::Release { .. }))
        .count();
    assert_eq!(released, 3);
    Ok(())
}
