use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use super::{OperationPoller, PollPhase, StatusPoller};
use crate::config::Config;
use crate::director::{OperationKind, OperationState};
use crate::fixtures::{self, MockDirector};
use crate::lock::{LockManager, LockRequest};
use crate::store::Store;

struct Harness {
    config: Arc<Config>,
    director: Arc<MockDirector>,
    locks: LockManager,
    _tmpdir: tempfile::TempDir,
}

async fn setup() -> Result<Harness> {
    let (config, tmpdir) = Config::new_test()?;
    let store = Store::new(config.clone()).await?;
    let locks = LockManager::new(store, config.clone());
    let director = Arc::new(MockDirector::new());
    Ok(Harness { config, director, locks, _tmpdir: tmpdir })
}

impl Harness {
    fn poller(&self, kind: OperationKind) -> OperationPoller {
        OperationPoller::new(
            self.config.clone(),
            self.director.clone(),
            self.locks.clone(),
            kind,
            fixtures::instance_info(fixtures::TEST_INSTANCE_GUID),
            "broker-admin".to_string(),
        )
    }

    /// Take the operation's WRITE lock as the request path would have.
    async fn lock_operation(&self, operation: &str) -> Result<()> {
        let mut metadata = fixtures::lock_metadata(operation);
        metadata.instance_info = Some(fixtures::instance_info(fixtures::TEST_INSTANCE_GUID));
        self.locks
            .lock(&fixtures::deployment_name(fixtures::TEST_INSTANCE_GUID), LockRequest { ttl: None, metadata })
            .await
    }
}

#[tokio::test]
async fn in_progress_operation_keeps_polling() -> Result<()> {
    let h = setup().await?;
    let mut poller = h.poller(OperationKind::Backup);

    assert!(!poller.check_once().await?, "in-progress operation must not finish");
    assert!(!poller.check_once().await?);
    assert_eq!(h.director.status_queries.load(Ordering::SeqCst), 2);
    assert_eq!(h.director.aborts.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn agent_errors_are_treated_as_still_in_progress() -> Result<()> {
    let h = setup().await?;
    let mut poller = h.poller(OperationKind::Backup);
    h.director.fail_operation_state.store(true, Ordering::SeqCst);

    assert!(!poller.check_once().await?, "a failed status query must not finish the operation");
    assert_eq!(poller.phase, PollPhase::Watching, "a failed status query must not transition state");

    Ok(())
}

#[tokio::test]
async fn exceeded_max_duration_aborts_exactly_once() -> Result<()> {
    let h = setup().await?;
    let mut config = (*h.config).clone();
    config.lock_max_duration_secs = 0;
    let mut poller = h.poller(OperationKind::Backup);
    poller.config = Arc::new(config);

    assert!(!poller.check_once().await?, "aborting is not yet terminal");
    assert_eq!(h.director.aborts.load(Ordering::SeqCst), 1, "expected exactly one abort request");
    assert!(matches!(poller.phase, PollPhase::Aborting { .. }));

    // Subsequent ticks while aborting must not re-issue the abort.
    assert!(!poller.check_once().await?);
    assert_eq!(h.director.aborts.load(Ordering::SeqCst), 1, "abort must be issued exactly once");

    Ok(())
}

#[tokio::test]
async fn hung_abort_is_forced_to_aborted() -> Result<()> {
    let h = setup().await?;
    h.lock_operation("backup").await?;

    let mut config = (*h.config).clone();
    config.lock_max_duration_secs = 0;
    config.abort_timeout_secs = 0;
    let mut poller = h.poller(OperationKind::Backup);
    poller.config = Arc::new(config);

    assert!(!poller.check_once().await?, "first tick issues the abort");
    // The agent never acknowledges; the next tick forces completion
    // without querying the agent again.
    let queries_before = h.director.status_queries.load(Ordering::SeqCst);
    assert!(poller.check_once().await?, "expected the hung abort to be forced to aborted");
    assert_eq!(h.director.status_queries.load(Ordering::SeqCst), queries_before);
    assert!(
        h.locks.read_lock(&fixtures::deployment_name(fixtures::TEST_INSTANCE_GUID)).await?.is_none(),
        "forced completion must release the lock"
    );

    Ok(())
}

#[tokio::test]
async fn terminal_state_unlocks_and_finishes() -> Result<()> {
    let h = setup().await?;
    h.lock_operation("backup").await?;
    let mut poller = h.poller(OperationKind::Backup);

    assert!(!poller.check_once().await?);
    h.director.set_operation_state(OperationState::Succeeded);
    assert!(poller.check_once().await?, "a succeeded operation must finish the poller");
    assert!(
        h.locks.read_lock(&fixtures::deployment_name(fixtures::TEST_INSTANCE_GUID)).await?.is_none(),
        "terminal cleanup must release the lock"
    );

    Ok(())
}

#[tokio::test]
async fn start_validates_instance_info() -> Result<()> {
    let h = setup().await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let poller = StatusPoller::new(h.config.clone(), h.director.clone(), h.locks.clone(), shutdown_tx);

    let mut info = fixtures::instance_info(fixtures::TEST_INSTANCE_GUID);
    info.agent_url = String::new();
    assert!(
        poller.start(OperationKind::Backup, info, "broker-admin".to_string()).await.is_err(),
        "instance info without an agent url must be rejected"
    );

    Ok(())
}

#[tokio::test]
async fn start_registers_and_terminal_state_deregisters() -> Result<()> {
    let h = setup().await?;
    h.lock_operation("backup").await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let poller = StatusPoller::new(h.config.clone(), h.director.clone(), h.locks.clone(), shutdown_tx.clone());
    let deployment = fixtures::deployment_name(fixtures::TEST_INSTANCE_GUID);

    let info = fixtures::instance_info(fixtures::TEST_INSTANCE_GUID);
    poller.start(OperationKind::Backup, info.clone(), "broker-admin".to_string()).await?;
    assert!(poller.is_tracked(&deployment).await);
    // A duplicate start is a no-op.
    poller.start(OperationKind::Backup, info, "broker-admin".to_string()).await?;

    h.director.set_operation_state(OperationState::Succeeded);
    // The poll interval in test config is 1s; give the loop time to
    // observe the terminal state and deregister.
    for _ in 0..50 {
        if !poller.is_tracked(&deployment).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(!poller.is_tracked(&deployment).await, "terminal state must deregister the poller");
    let queries_after = h.director.status_queries.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(
        h.director.status_queries.load(Ordering::SeqCst),
        queries_after,
        "a deregistered poller must not keep querying"
    );
    let _ = shutdown_tx.send(());

    Ok(())
}

#[tokio::test]
async fn restart_resumes_pollers_from_live_write_locks() -> Result<()> {
    let h = setup().await?;
    h.lock_operation("backup").await?;
    // An update lock has no trackable operation and must be skipped.
    h.locks
        .lock("some-other-deployment", LockRequest { ttl: None, metadata: fixtures::lock_metadata("update") })
        .await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let poller = StatusPoller::new(h.config.clone(), h.director.clone(), h.locks.clone(), shutdown_tx.clone());

    let resumed = poller.restart().await?;
    assert_eq!(resumed, 1, "only the backup lock should resume a poller");
    assert!(poller.is_tracked(&fixtures::deployment_name(fixtures::TEST_INSTANCE_GUID)).await);
    assert!(!poller.is_tracked("some-other-deployment").await);
    let _ = shutdown_tx.send(());

    Ok(())
}

#[tokio::test]
async fn restart_stagger_does_not_block_the_scan() -> Result<()> {
    let h = setup().await?;
    h.lock_operation("backup").await?;

    let mut config = (*h.config).clone();
    config.restart_stagger_secs = 60;
    let (shutdown_tx, _) = broadcast::channel(1);
    let poller = StatusPoller::new(Arc::new(config), h.director.clone(), h.locks.clone(), shutdown_tx.clone());

    // The stagger delays each resumed poller's first check, not the scan
    // itself, so restart must return well before the stagger elapses.
    let resumed = tokio::time::timeout(Duration::from_secs(5), poller.restart())
        .await
        .expect("restart must not wait out the stagger")?;
    assert_eq!(resumed, 1);
    assert!(poller.is_tracked(&fixtures::deployment_name(fixtures::TEST_INSTANCE_GUID)).await);
    let _ = shutdown_tx.send(());

    Ok(())
}
