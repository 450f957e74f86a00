//! Operation status poller.
//!
//! Supervises long-running backup/restore operations. Each tracked operation
//! gets its own periodic poll task which watches the deployed agent for a
//! terminal state, aborts the operation once it exceeds the configured max
//! lock duration, and force-finishes it when even the abort hangs. On any
//! terminal state the resource's lock is released, a completion audit record
//! is emitted and the poller is deregistered.
//!
//! The registry of active pollers is keyed by deployment name, which is
//! unique per tracked operation since each holds that deployment's WRITE
//! lock. After a broker restart the registry is reconstructed by scanning
//! the lock service for live WRITE locks carrying instance info.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use rand::Rng;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::director::{DirectorClient, InstanceInfo, OperationKind, OperationState};
use crate::lock::LockManager;
use kiln_core::BrokerError;

const METRIC_OPERATIONS_COMPLETED: &str = "kiln_operations_completed_total";
const METRIC_OPERATIONS_ABORTED: &str = "kiln_operations_aborted_total";

/// Max random jitter added to the per-lock restart stagger.
const RESTART_JITTER_MS: u64 = 2_000;

/// The phase of a tracked operation's supervision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PollPhase {
    /// Watching for a terminal state from the agent.
    Watching,
    /// An abort has been issued; awaiting its effect.
    Aborting { since: DateTime<Utc> },
}

/// The poll loop state of a single tracked operation.
struct OperationPoller {
    config: Arc<Config>,
    director: Arc<dyn DirectorClient>,
    locks: LockManager,
    kind: OperationKind,
    info: InstanceInfo,
    user: String,
    phase: PollPhase,
}

impl OperationPoller {
    fn new(config: Arc<Config>, director: Arc<dyn DirectorClient>, locks: LockManager, kind: OperationKind, info: InstanceInfo, user: String) -> Self {
        Self { config, director, locks, kind, info, user, phase: PollPhase::Watching }
    }

    /// Run one supervision check, returning `true` once the operation has
    /// reached a terminal state and been cleaned up.
    async fn check_once(&mut self) -> Result<bool> {
        let now = Utc::now();

        // A hung agent must not hang the broker: once the abort itself has
        // exceeded its timeout, the operation is finished as aborted no
        // matter what the agent reports.
        if let PollPhase::Aborting { since } = self.phase {
            if (now - since).num_seconds() >= self.config.abort_timeout_secs as i64 {
                let err = BrokerError::OperationTimeout(format!(
                    "abort of {} on deployment '{}' did not complete within {}s",
                    self.kind, self.info.deployment, self.config.abort_timeout_secs
                ));
                tracing::warn!(error = %err, "forcing operation state to aborted");
                self.finish(OperationState::Aborted, true).await;
                return Ok(true);
            }
        }

        let state = match self.director.get_operation_state(self.kind, &self.info).await {
            Ok(state) => state,
            Err(err) => {
                // Transient agent unavailability is not completion; keep
                // watching and try again next tick.
                tracing::error!(error = ?err, deployment = %self.info.deployment, "error querying operation state");
                return Ok(false);
            }
        };
        tracing::debug!(deployment = %self.info.deployment, state = %state, "operation state polled");

        if state.is_terminal() {
            self.finish(state, false).await;
            return Ok(true);
        }

        if self.phase == PollPhase::Watching && (now - self.info.started_at).num_seconds() >= self.config.lock_max_duration_secs as i64 {
            tracing::warn!(
                deployment = %self.info.deployment,
                operation = %self.kind,
                started_at = %self.info.started_at,
                "operation exceeded max lock duration, issuing abort"
            );
            if let Err(err) = self.director.abort_operation(self.kind, &self.info).await {
                // The abort itself failed; stay in the watching phase so the
                // next tick retries it.
                tracing::error!(error = ?err, deployment = %self.info.deployment, "error aborting operation");
                return Ok(false);
            }
            metrics::increment_counter!(METRIC_OPERATIONS_ABORTED);
            self.phase = PollPhase::Aborting { since: Utc::now() };
        }
        Ok(false)
    }

    /// Terminal cleanup: release the lock and emit the completion audit
    /// record. Unlock failures are logged but never block completion; the
    /// lock's TTL and visible metadata allow recovery out of band.
    async fn finish(&self, state: OperationState, forced: bool) {
        if let Err(err) = self.locks.unlock(&self.info.deployment).await {
            tracing::error!(error = ?err, deployment = %self.info.deployment, "error releasing lock of finished operation");
        }
        metrics::increment_counter!(METRIC_OPERATIONS_COMPLETED);
        tracing::info!(
            deployment = %self.info.deployment,
            instance = %self.info.instance_guid,
            operation = %self.kind,
            state = %state,
            forced,
            user = %self.user,
            "operation completed"
        );
    }
}

/// The registry of active operation pollers.
#[derive(Clone)]
pub struct StatusPoller {
    inner: Arc<StatusPollerInner>,
}

struct StatusPollerInner {
    config: Arc<Config>,
    director: Arc<dyn DirectorClient>,
    locks: LockManager,
    registry: Mutex<HashMap<String, JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl StatusPoller {
    pub fn new(config: Arc<Config>, director: Arc<dyn DirectorClient>, locks: LockManager, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_OPERATIONS_COMPLETED, metrics::Unit::Count, "number of tracked operations which reached a terminal state");
        metrics::register_counter!(METRIC_OPERATIONS_ABORTED, metrics::Unit::Count, "number of tracked operations aborted for exceeding their max duration");
        Self {
            inner: Arc::new(StatusPollerInner {
                config,
                director,
                locks,
                registry: Mutex::new(HashMap::new()),
                shutdown_tx,
            }),
        }
    }

    /// Begin supervising a newly started backup/restore operation.
    ///
    /// Idempotent per deployment: a second start for an already tracked
    /// deployment is a no-op.
    #[tracing::instrument(level = "debug", skip(self, info), fields(deployment = %info.deployment))]
    pub async fn start(&self, kind: OperationKind, info: InstanceInfo, user: String) -> Result<()> {
        self.start_with_delay(kind, info, user, Duration::ZERO).await
    }

    /// Begin supervising with an initial delay before the first check.
    async fn start_with_delay(&self, kind: OperationKind, info: InstanceInfo, user: String, delay: Duration) -> Result<()> {
        Self::validate(&info)?;
        let mut registry = self.inner.registry.lock().await;
        if registry.contains_key(&info.deployment) {
            tracing::debug!(deployment = %info.deployment, "operation is already tracked");
            return Ok(());
        }
        let deployment = info.deployment.clone();
        let poller = OperationPoller::new(
            self.inner.config.clone(),
            self.inner.director.clone(),
            self.inner.locks.clone(),
            kind,
            info,
            user,
        );
        let handle = tokio::spawn(Self::poll_loop(
            poller,
            Arc::downgrade(&self.inner),
            BroadcastStream::new(self.inner.shutdown_tx.subscribe()),
            delay,
        ));
        registry.insert(deployment, handle);
        Ok(())
    }

    fn validate(info: &InstanceInfo) -> Result<()> {
        if info.instance_guid.is_empty() || info.deployment.is_empty() || info.agent_url.is_empty() {
            bail!(
                "incomplete instance info for deployment '{}': instance_guid, deployment and agent_url are required",
                info.deployment
            );
        }
        Ok(())
    }

    async fn poll_loop(mut poller: OperationPoller, inner: Weak<StatusPollerInner>, mut shutdown_rx: BroadcastStream<()>, delay: Duration) {
        let deployment = poller.info.deployment.clone();
        if !delay.is_zero() {
            tokio::select! {
                _ = sleep(delay) => (),
                _ = shutdown_rx.next() => return,
            }
        }
        let mut ticker = interval(Duration::from_secs(poller.config.status_check_interval_secs));
        // A slow check must never overlap with the next one for the same
        // operation; missed ticks are skipped outright.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => match poller.check_once().await {
                    Ok(true) => break,
                    Ok(false) => (),
                    Err(err) => tracing::error!(error = ?err, deployment = %deployment, "error during operation status check"),
                },
                _ = shutdown_rx.next() => return,
            }
        }
        if let Some(inner) = inner.upgrade() {
            inner.registry.lock().await.remove(&deployment);
        }
    }

    /// Reconstruct pollers for operations which were in flight before a
    /// broker restart, from the live WRITE locks carrying instance info.
    ///
    /// Each resumed poller's first check is staggered to avoid a thundering
    /// herd of status queries right after boot; the scan itself returns
    /// without waiting. Returns the number of operations resumed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restart(&self) -> Result<usize> {
        let locks = self.inner.locks.live_write_locks().await.context("error scanning locks for trackable operations")?;
        let mut resumed = 0;
        for (resource, record) in locks {
            let kind = match OperationKind::from_operation(&record.metadata.operation) {
                Some(kind) => kind,
                None => continue,
            };
            let info = match record.metadata.instance_info {
                Some(info) => info,
                None => {
                    tracing::warn!(resource = %resource, "write lock has no instance info, cannot resume poller");
                    continue;
                }
            };
            let stagger_secs = self.inner.config.restart_stagger_secs;
            let delay = if stagger_secs > 0 {
                let jitter = rand::thread_rng().gen_range(0..=RESTART_JITTER_MS);
                Duration::from_secs(stagger_secs * resumed as u64) + Duration::from_millis(jitter)
            } else {
                Duration::ZERO
            };
            if let Err(err) = self.start_with_delay(kind, info, record.metadata.requested_by.clone(), delay).await {
                tracing::error!(error = ?err, resource = %resource, "error resuming operation poller");
                continue;
            }
            resumed += 1;
        }
        if resumed > 0 {
            tracing::info!(resumed, "resumed operation pollers from live locks");
        }
        Ok(resumed)
    }

    /// Check whether an operation is currently tracked for the deployment.
    pub async fn is_tracked(&self, deployment: &str) -> bool {
        self.inner.registry.lock().await.contains_key(deployment)
    }
}

#[cfg(test)]
mod mod_test;
