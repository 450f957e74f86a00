//! Lock service.
//!
//! Per-resource advisory locks with READ/WRITE semantics and TTL expiry.
//! Acquisition is a read-modify-write on the resource's lock record, made
//! atomic by holding the store's ephemeral named lock for the duration of
//! the section; the store itself only guarantees per-key atomicity.
//!
//! Stale records are not proactively reaped: a later `lock()` call discovers
//! an expired record and overwrites it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::director::InstanceInfo;
use crate::store::Store;
use kiln_core::{BrokerError, WRITE_OPERATIONS};

/// Suffix of the key holding a resource's lock record.
const LOCK_DETAILS_SUFFIX: &str = "/lock/details";
/// Suffix of the key used as the resource's ephemeral meta-lock.
const LOCK_META_SUFFIX: &str = "/lock";
/// Lease TTL on the meta-lock itself, bounding how long a crashed caller can
/// hold up other acquirers mid-section.
const META_LOCK_TTL: Duration = Duration::from_secs(30);
/// Max attempts when releasing an application lock.
const MAX_UNLOCK_RETRIES: u32 = 3;
/// Delay between unlock attempts.
const UNLOCK_RETRY_DELAY: Duration = Duration::from_millis(500);

const METRIC_LOCKS_ACQUIRED: &str = "kiln_locks_acquired_total";
const METRIC_LOCK_CONFLICTS: &str = "kiln_lock_conflicts_total";

/// The type of a held lock.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockType {
    Read,
    Write,
}

impl LockType {
    /// Derive the lock type from the operation taking the lock.
    pub fn for_operation(operation: &str) -> Self {
        if WRITE_OPERATIONS.contains(&operation) {
            LockType::Write
        } else {
            LockType::Read
        }
    }
}

/// Metadata describing who is locking and why.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LockMetadata {
    /// The operation taking the lock, e.g. `backup` or `update`.
    pub operation: String,
    /// The user on whose behalf the operation runs.
    pub requested_by: String,
    /// Instance info of the tracked operation, when the locker is a
    /// long-running backup/restore supervised by the status poller.
    pub instance_info: Option<InstanceInfo>,
}

/// The persisted lock record for a resource.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LockRecord {
    pub lock_type: LockType,
    pub lock_time: DateTime<Utc>,
    /// TTL in seconds; `None` means the lock never expires on its own.
    pub lock_ttl_secs: Option<u64>,
    pub metadata: LockMetadata,
}

impl LockRecord {
    /// A lock is live iff its TTL has not yet elapsed.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        match self.lock_ttl_secs {
            Some(ttl_secs) => (now - self.lock_time).num_seconds() < ttl_secs as i64,
            None => true,
        }
    }
}

/// A lock acquisition request.
pub struct LockRequest {
    /// TTL for the new lock; `None` for an unbounded lock.
    pub ttl: Option<Duration>,
    pub metadata: LockMetadata,
}

/// The lock service, providing per-resource mutual exclusion.
#[derive(Clone)]
pub struct LockManager {
    store: Store,
    config: Arc<Config>,
}

impl LockManager {
    pub fn new(store: Store, config: Arc<Config>) -> Self {
        metrics::register_counter!(METRIC_LOCKS_ACQUIRED, metrics::Unit::Count, "number of locks acquired");
        metrics::register_counter!(METRIC_LOCK_CONFLICTS, metrics::Unit::Count, "number of lock acquisitions rejected due to a live lock");
        Self { store, config }
    }

    fn details_key(resource_id: &str) -> String {
        format!("{}{}", resource_id, LOCK_DETAILS_SUFFIX)
    }

    fn meta_key(resource_id: &str) -> String {
        format!("{}{}", resource_id, LOCK_META_SUFFIX)
    }

    /// Acquire the lock on the given resource.
    ///
    /// Fails with `BrokerError::AlreadyLocked` if a live lock exists, or
    /// `BrokerError::LockError` if the meta-lock could not be acquired in time.
    #[tracing::instrument(level = "debug", skip(self, request))]
    pub async fn lock(&self, resource_id: &str, request: LockRequest) -> Result<()> {
        let meta_timeout = Duration::from_secs(self.config.meta_lock_timeout_secs);
        let meta = self.store.acquire_named_lock(&Self::meta_key(resource_id), META_LOCK_TTL, meta_timeout).await?;
        let res = self.lock_under_meta(resource_id, request).await;
        if let Err(err) = self.store.release_named_lock(meta).await {
            tracing::error!(error = ?err, resource = resource_id, "error releasing meta-lock");
        }
        res
    }

    /// The guarded check-then-write section of `lock`.
    async fn lock_under_meta(&self, resource_id: &str, request: LockRequest) -> Result<()> {
        let key = Self::details_key(resource_id);
        let now = Utc::now();
        if let Some(raw) = self.store.get(&key).await? {
            let current: LockRecord = serde_json::from_slice(&raw).context("error decoding lock record")?;
            if current.is_live(now) {
                metrics::increment_counter!(METRIC_LOCK_CONFLICTS);
                tracing::debug!(
                    resource = resource_id,
                    operation = %current.metadata.operation,
                    "resource is already locked"
                );
                return Err(BrokerError::AlreadyLocked {
                    resource: resource_id.to_string(),
                    operation: current.metadata.operation,
                    locked_at: current.lock_time,
                }
                .into());
            }
            tracing::debug!(resource = resource_id, "overwriting expired lock record");
        }
        let record = LockRecord {
            lock_type: LockType::for_operation(&request.metadata.operation),
            lock_time: now,
            lock_ttl_secs: request.ttl.map(|ttl| ttl.as_secs()),
            metadata: request.metadata,
        };
        let encoded = serde_json::to_vec(&record).context("error encoding lock record")?;
        self.store.put(&key, encoded).await?;
        metrics::increment_counter!(METRIC_LOCKS_ACQUIRED);
        tracing::debug!(resource = resource_id, lock_type = ?record.lock_type, "lock acquired");
        Ok(())
    }

    /// Release the lock on the given resource.
    ///
    /// Idempotent: unlocking an already-unlocked resource is not an error.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn unlock(&self, resource_id: &str) -> Result<()> {
        let key = Self::details_key(resource_id);
        let mut attempt = 0;
        loop {
            match self.store.delete(&key).await {
                Ok(()) => {
                    tracing::debug!(resource = resource_id, "lock released");
                    return Ok(());
                }
                Err(err) if attempt < MAX_UNLOCK_RETRIES => {
                    attempt += 1;
                    tracing::error!(error = ?err, resource = resource_id, attempt, "error releasing lock, retrying");
                    tokio::time::sleep(UNLOCK_RETRY_DELAY).await;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("could not unlock resource '{}' after {} retries", resource_id, MAX_UNLOCK_RETRIES))
                }
            }
        }
    }

    /// Fetch the current lock record for the given resource, if any.
    pub async fn read_lock(&self, resource_id: &str) -> Result<Option<LockRecord>> {
        let raw = match self.store.get(&Self::details_key(resource_id)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let record: LockRecord = serde_json::from_slice(&raw).context("error decoding lock record")?;
        Ok(Some(record))
    }

    /// Check whether the resource currently holds a live WRITE lock.
    ///
    /// This is a lock-free read used by synchronous operations to detect a
    /// concurrent write operation without contending for the meta-lock. A
    /// stale read is acceptable: callers fail recoverably and retry.
    pub async fn is_write_locked(&self, resource_id: &str) -> Result<bool> {
        let record = match self.read_lock(resource_id).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        Ok(record.lock_type == LockType::Write && record.is_live(Utc::now()))
    }

    /// Scan the store for all live WRITE locks, returning their resource ids
    /// and records. Used to reconstruct status pollers after a restart.
    pub async fn live_write_locks(&self) -> Result<Vec<(String, LockRecord)>> {
        let now = Utc::now();
        let mut out = vec![];
        for (key, raw) in self.store.list_with_prefix("", None).await? {
            let resource_id = match key.strip_suffix(LOCK_DETAILS_SUFFIX) {
                Some(resource_id) => resource_id,
                None => continue,
            };
            let record: LockRecord = match serde_json::from_slice(&raw) {
                Ok(record) => record,
                Err(err) => {
                    tracing::error!(error = ?err, key = %key, "skipping undecodable lock record");
                    continue;
                }
            };
            if record.lock_type == LockType::Write && record.is_live(now) {
                out.push((resource_id.to_string(), record));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod mod_test;
