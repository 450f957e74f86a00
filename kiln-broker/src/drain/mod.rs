//! Queue drain controller.
//!
//! Periodically replays queued deployment operations through the admission
//! controller, oldest first. Per-item failures are logged and skipped so one
//! bad entry never stalls the rest of the batch.

use std::sync::Arc;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;

use crate::admission::{AdmissionController, DeploymentRequest};
use crate::config::Config;
use crate::error::broker_error;
use crate::queue::OperationQueue;
use kiln_core::BrokerError;

const METRIC_DRAIN_REPLAYED: &str = "kiln_drain_replayed_total";
const METRIC_DRAIN_FAILED: &str = "kiln_drain_failed_total";

/// The queue drain controller.
pub struct DrainCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The durable operation queue being drained.
    queue: OperationQueue,
    /// The admission controller through which replays are resubmitted.
    admission: AdmissionController,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl DrainCtl {
    pub fn new(config: Arc<Config>, queue: OperationQueue, admission: AdmissionController, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_DRAIN_REPLAYED, metrics::Unit::Count, "number of queued operations replayed to the director");
        metrics::register_counter!(METRIC_DRAIN_FAILED, metrics::Unit::Count, "number of queued operations which failed to replay");
        Self {
            config,
            queue,
            admission,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(interval_secs = self.config.drain_interval_secs, "queue drain controller has started");

        let mut ticker = interval(Duration::from_secs(self.config.drain_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.drain_once().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("queue drain controller has shutdown");
        Ok(())
    }

    /// Replay all queued operations once, oldest first.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn drain_once(&self) {
        let names = match self.queue.list_deployment_names(None).await {
            Ok(names) => names,
            Err(err) => {
                tracing::error!(error = ?err, "error listing queued deployments, skipping drain tick");
                return;
            }
        };
        if names.is_empty() {
            return;
        }
        tracing::info!(queued = names.len(), "draining queued deployment operations");
        for name in names {
            if let Err(err) = self.replay(&name).await {
                // Still at capacity; the entry stays queued for the next tick.
                if matches!(broker_error(&err), Some(BrokerError::DeploymentDelayed(_))) {
                    tracing::debug!(deployment = %name, "no director capacity for replay, leaving queued");
                    continue;
                }
                metrics::increment_counter!(METRIC_DRAIN_FAILED);
                tracing::error!(error = ?err, deployment = %name, "error replaying queued operation");
            }
        }
    }

    async fn replay(&self, deployment_name: &str) -> Result<()> {
        let op = match self.queue.get_deployment(deployment_name).await? {
            Some(op) => op,
            // Raced with a direct replay of the same deployment.
            None => return Ok(()),
        };
        let outcome = self
            .admission
            .create_or_update(DeploymentRequest {
                action: op.action,
                plan_id: op.plan_id,
                deployment_name: op.deployment_name,
                params: op.params,
                args: op.args,
                scheduled: false,
                run_immediately: false,
            })
            .await?;
        metrics::increment_counter!(METRIC_DRAIN_REPLAYED);
        tracing::info!(deployment = %deployment_name, task_id = %outcome.task_id, "queued operation replayed");
        Ok(())
    }
}
