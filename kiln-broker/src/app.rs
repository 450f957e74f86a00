use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::admission::AdmissionController;
use crate::config::{Config, ProcessRole};
use crate::director::{DirectorClient, HttpDirectorClient};
use crate::drain::DrainCtl;
use crate::lock::LockManager;
use crate::queue::OperationQueue;
use crate::server::spawn_prom_server;
use crate::status::StatusPoller;
use crate::store::Store;
use kiln_core::prom::spawn_proc_metrics_sampler;

/// The application object for when the broker is running as a server.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The application's durable store.
    _store: Store,
    /// The admission controller handed to the broker-API layer.
    _admission: AdmissionController,
    /// The status poller registry handed to the broker-API layer.
    _status: StatusPoller,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the queue drain controller, when this process's
    /// role runs it.
    drain_handle: Option<JoinHandle<Result<()>>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(100);

        // Initialize this node's storage and the services layered on it.
        let store = Store::new(config.clone()).await.context("error opening store")?;
        let locks = LockManager::new(store.clone(), config.clone());
        let queue = OperationQueue::new(store.clone());
        let director: Arc<dyn DirectorClient> = Arc::new(HttpDirectorClient::new(&config).context("error building director client")?);
        let admission = AdmissionController::new(config.clone(), director.clone(), queue.clone());
        let status = StatusPoller::new(config.clone(), director, locks, shutdown_tx.clone());

        // Queued operations are only drained under the internal role, and
        // only when rate limiting is active at all.
        let drain_handle = if config.enable_rate_limit && config.process_role == ProcessRole::Internal {
            Some(DrainCtl::new(config.clone(), queue, admission.clone(), shutdown_tx.clone()).spawn())
        } else {
            None
        };

        // The external role owns status polling; pick up any operations
        // which were in flight before this process started. The scan runs
        // in the background so a slow or unavailable store cannot block
        // startup, and a failed scan leaves the broker serving with the
        // error logged.
        if config.process_role == ProcessRole::External {
            let status = status.clone();
            tokio::spawn(async move {
                if let Err(err) = status.restart().await {
                    tracing::error!(error = ?err, "error resuming operation pollers");
                }
            });
        }

        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            config,
            _store: store,
            _admission: admission,
            _status: status,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            drain_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let mut sampler_shutdown = self.shutdown_tx.subscribe();
        let sampler = spawn_proc_metrics_sampler(async move {
            let _res = sampler_shutdown.recv().await;
        });

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!(role = self.config.process_role.as_str(), "broker is shutting down");
        if let Some(drain_handle) = self.drain_handle {
            if let Err(err) = drain_handle.await.context("error joining drain controller handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down drain controller");
            }
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }
        if let Err(err) = sampler.await {
            tracing::error!(error = ?err, "error joining metrics sampler task");
        }

        tracing::debug!("broker shutdown complete");
        Ok(())
    }
}
