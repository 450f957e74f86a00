use std::time::Duration;

use anyhow::Result;
use chrono::Utc;

use super::{LockManager, LockRequest, LockType};
use crate::config::Config;
use crate::error::broker_error;
use crate::fixtures;
use crate::store::Store;
use kiln_core::BrokerError;

async fn setup() -> Result<(LockManager, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let store = Store::new(config.clone()).await?;
    Ok((LockManager::new(store, config), tmpdir))
}

fn request(operation: &str, ttl: Option<Duration>) -> LockRequest {
    LockRequest { ttl, metadata: fixtures::lock_metadata(operation) }
}

#[tokio::test]
async fn concurrent_lock_yields_exactly_one_winner() -> Result<()> {
    let (manager, _tmpdir) = setup().await?;

    let (res_a, res_b) = tokio::join!(
        manager.lock("res-1", request("backup", None)),
        manager.lock("res-1", request("update", None)),
    );

    let successes = [&res_a, &res_b].iter().filter(|res| res.is_ok()).count();
    assert_eq!(successes, 1, "expected exactly one of two concurrent acquisitions to win, got {:?} / {:?}", res_a, res_b);

    let loser = if res_a.is_err() { res_a.unwrap_err() } else { res_b.unwrap_err() };
    match broker_error(&loser) {
        Some(BrokerError::AlreadyLocked { resource, .. }) => {
            assert_eq!(resource, "res-1", "conflict reported for unexpected resource");
        }
        other => panic!("expected AlreadyLocked for the losing acquisition, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn expired_lock_is_overwritten_without_unlock() -> Result<()> {
    let (manager, _tmpdir) = setup().await?;

    manager.lock("res-1", request("backup", Some(Duration::from_secs(0)))).await?;

    // The zero TTL lock is immediately expired, so a second acquisition
    // must succeed without an intervening unlock.
    manager.lock("res-1", request("restore", None)).await?;

    let record = manager.read_lock("res-1").await?.ok_or_else(|| anyhow::anyhow!("expected a lock record"))?;
    assert_eq!(record.metadata.operation, "restore", "expected the new lock to have replaced the expired one");

    Ok(())
}

#[tokio::test]
async fn live_lock_rejects_second_acquisition() -> Result<()> {
    let (manager, _tmpdir) = setup().await?;

    manager.lock("res-1", request("update", Some(Duration::from_secs(3600)))).await?;

    let err = manager
        .lock("res-1", request("backup", None))
        .await
        .expect_err("expected second acquisition on a live lock to fail");
    match broker_error(&err) {
        Some(BrokerError::AlreadyLocked { operation, locked_at, .. }) => {
            assert_eq!(operation, "update", "conflict should report the holder's operation");
            assert!(*locked_at <= Utc::now(), "lock_time should not be in the future");
        }
        other => panic!("expected AlreadyLocked, got {:?}", other),
    }

    // A different resource is unaffected.
    manager.lock("res-2", request("backup", None)).await?;

    Ok(())
}

#[tokio::test]
async fn unlock_is_idempotent() -> Result<()> {
    let (manager, _tmpdir) = setup().await?;

    manager.lock("res-1", request("backup", None)).await?;
    manager.unlock("res-1").await?;
    // Unlocking an already-unlocked resource is not an error.
    manager.unlock("res-1").await?;

    assert!(manager.read_lock("res-1").await?.is_none(), "expected no lock record after unlock");
    manager.lock("res-1", request("backup", None)).await?;

    Ok(())
}

#[tokio::test]
async fn is_write_locked_reflects_lock_type_and_liveness() -> Result<()> {
    let (manager, _tmpdir) = setup().await?;

    assert!(!manager.is_write_locked("res-1").await?, "unlocked resource must not report a write lock");

    // A read-class operation takes a READ lock.
    manager.lock("res-1", request("state", None)).await?;
    assert!(!manager.is_write_locked("res-1").await?, "READ lock must not report as a write lock");
    manager.unlock("res-1").await?;

    manager.lock("res-1", request("backup", None)).await?;
    assert!(manager.is_write_locked("res-1").await?, "live WRITE lock must report as write locked");

    manager.unlock("res-1").await?;
    assert!(!manager.is_write_locked("res-1").await?, "unlocked resource must not report a write lock");

    // An expired WRITE lock is not live.
    manager.lock("res-1", request("update", Some(Duration::from_secs(0)))).await?;
    assert!(!manager.is_write_locked("res-1").await?, "expired WRITE lock must not report as write locked");

    Ok(())
}

#[tokio::test]
async fn live_write_locks_returns_only_live_write_records() -> Result<()> {
    let (manager, _tmpdir) = setup().await?;

    let mut backup = request("backup", None);
    backup.metadata.instance_info = Some(fixtures::instance_info(fixtures::TEST_INSTANCE_GUID));
    manager.lock("res-live", backup).await?;
    manager.lock("res-read", request("state", None)).await?;
    manager.lock("res-expired", request("update", Some(Duration::from_secs(0)))).await?;

    let live = manager.live_write_locks().await?;
    assert_eq!(live.len(), 1, "expected exactly one live WRITE lock, got {:?}", live);
    let (resource, record) = &live[0];
    assert_eq!(resource, "res-live");
    assert_eq!(record.lock_type, LockType::Write);
    let info = record.metadata.instance_info.as_ref().ok_or_else(|| anyhow::anyhow!("expected instance info on the lock record"))?;
    assert_eq!(info.instance_guid, fixtures::TEST_INSTANCE_GUID);

    Ok(())
}
