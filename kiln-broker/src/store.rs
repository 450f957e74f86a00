//! Distributed store client.
//!
//! A thin wrapper exposing the key/value and named-lock primitives which the
//! lock service and operation queue are built upon. The only consistency
//! primitive upper layers may assume is per-key compare-and-swap; multi-key
//! sections must be guarded with a named lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sled::{Config as SledConfig, Db, IVec, Tree};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, ERR_ITER_FAILURE};
use kiln_core::BrokerError;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/kiln/db";
/// The DB tree holding all broker records.
const TREE_BROKER: &str = "broker";
/// Delay between attempts while acquiring a named lock.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// A handle to a held named lock, needed to release it.
///
/// The holder token fences the release: a handle whose lock has expired and
/// been re-acquired by another caller will not release the new holder's lock.
#[derive(Debug)]
pub struct NamedLockHandle {
    key: String,
    holder: Uuid,
}

/// The record stored for a held named lock.
#[derive(Debug, Deserialize, Serialize)]
struct NamedLockRecord {
    holder: Uuid,
    acquired_at: DateTime<Utc>,
    ttl_secs: u64,
}

impl NamedLockRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        (now - self.acquired_at).num_seconds() < self.ttl_secs as i64
    }
}

/// An abstraction over the broker's backing store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    #[allow(dead_code)]
    config: Arc<Config>,
    #[allow(dead_code)]
    db: Db,
    tree: Tree,
}

impl Store {
    /// Open the store for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let dbpath = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for kiln broker store")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let tree = db.open_tree(TREE_BROKER)?;
            let inner = Arc::new(StoreInner { config, db, tree });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking store-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get the value stored at the given key, if any.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (tree, key) = (self.inner.tree.clone(), key.to_string());
        let val = Self::spawn_blocking(move || -> Result<Option<IVec>> { Ok(tree.get(key.as_bytes())?) }).await??;
        Ok(val.map(|ivec| ivec.to_vec()))
    }

    /// Put the given value at the given key, overwriting any existing value.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let (tree, key) = (self.inner.tree.clone(), key.to_string());
        Self::spawn_blocking(move || -> Result<()> {
            tree.insert(key.as_bytes(), value)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Delete the record at the given key. Deleting an absent key is a no-op.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let (tree, key) = (self.inner.tree.clone(), key.to_string());
        Self::spawn_blocking(move || -> Result<()> {
            tree.remove(key.as_bytes())?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Atomically swap the value at the given key.
    ///
    /// `old == None` asserts the key is absent ("insert if absent"); `new == None`
    /// deletes the key. Returns false if the current value did not match `old`.
    pub async fn compare_and_swap(&self, key: &str, old: Option<Vec<u8>>, new: Option<Vec<u8>>) -> Result<bool> {
        let (tree, key) = (self.inner.tree.clone(), key.to_string());
        let res = Self::spawn_blocking(move || -> Result<bool> {
            let res = tree.compare_and_swap(key.as_bytes(), old.as_deref(), new)?;
            Ok(res.is_ok())
        })
        .await??;
        Ok(res)
    }

    /// List all records under the given key prefix, in ascending key order.
    pub async fn list_with_prefix(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<(String, Vec<u8>)>> {
        let (tree, prefix) = (self.inner.tree.clone(), prefix.to_string());
        let out = Self::spawn_blocking(move || -> Result<Vec<(String, Vec<u8>)>> {
            let mut out = vec![];
            for kv in tree.scan_prefix(prefix.as_bytes()) {
                let (key, val) = kv.context(ERR_ITER_FAILURE)?;
                let key = std::str::from_utf8(&key).context("store key is not valid utf8")?.to_string();
                out.push((key, val.to_vec()));
                if matches!(limit, Some(limit) if out.len() >= limit) {
                    break;
                }
            }
            Ok(out)
        })
        .await??;
        Ok(out)
    }

    /// Acquire the named lock, waiting at most `timeout` for it to become free.
    ///
    /// The lock is leased for `ttl`: if the holder crashes without releasing,
    /// the next acquirer takes it over once the lease has lapsed.
    pub async fn acquire_named_lock(&self, name: &str, ttl: Duration, timeout: Duration) -> Result<NamedLockHandle> {
        let deadline = tokio::time::Instant::now() + timeout;
        let holder = Uuid::new_v4();
        loop {
            let current = self.get(name).await?;
            let now = Utc::now();
            let is_free = match current.as_deref() {
                Some(raw) => {
                    let record: NamedLockRecord = serde_json::from_slice(raw).context("error decoding named lock record")?;
                    !record.is_live(now)
                }
                None => true,
            };
            if is_free {
                let record = NamedLockRecord { holder, acquired_at: now, ttl_secs: ttl.as_secs() };
                let encoded = serde_json::to_vec(&record).context("error encoding named lock record")?;
                if self.compare_and_swap(name, current, Some(encoded)).await? {
                    return Ok(NamedLockHandle { key: name.to_string(), holder });
                }
                // Lost the race, re-read and try again.
            }
            if tokio::time::Instant::now() + LOCK_RETRY_DELAY >= deadline {
                return Err(anyhow!(BrokerError::LockError(format!(
                    "timed out after {:?} acquiring named lock '{}'",
                    timeout, name
                ))));
            }
            tokio::time::sleep(LOCK_RETRY_DELAY).await;
        }
    }

    /// Release a held named lock. Releasing an expired or superseded lock is a no-op.
    pub async fn release_named_lock(&self, handle: NamedLockHandle) -> Result<()> {
        let current = match self.get(&handle.key).await? {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let record: NamedLockRecord = serde_json::from_slice(&current).context("error decoding named lock record")?;
        if record.holder != handle.holder {
            return Ok(());
        }
        let _swapped = self.compare_and_swap(&handle.key, Some(current), None).await?;
        Ok(())
    }
}
