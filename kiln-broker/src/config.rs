//! Runtime configuration.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The role under which this broker process runs.
///
/// Multiple broker instances run with different roles; the queue drain poller
/// only runs under the `internal` role so that queued operations are never
/// drained twice, while the status-poller restart scan runs under `external`.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Internal,
    External,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Internal => "internal",
            ProcessRole::External => "external",
        }
    }
}

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port on which the metrics server listens.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,
    /// The path to the operation store on disk.
    #[serde(default = "crate::store::default_data_path")]
    pub storage_data_path: String,
    /// This process's role.
    pub process_role: ProcessRole,
    /// Whether director rate limiting (admission control + durable queueing)
    /// is enabled. When disabled, operations are submitted straight through.
    #[serde(default)]
    pub enable_rate_limit: bool,

    /// The base URL of the director.
    pub director_url: String,
    /// The director API username.
    pub director_user: String,
    /// The director API password.
    pub director_password: String,

    /// Global ceiling on concurrent director tasks.
    #[serde(default = "Config::default_max_workers_total")]
    pub max_workers_total: u64,
    /// Ceiling on concurrent user-triggered tasks of a single action type.
    #[serde(default = "Config::default_max_workers_category")]
    pub max_workers_per_action: u64,
    /// Ceiling on concurrent scheduled tasks.
    #[serde(default = "Config::default_max_workers_category")]
    pub max_workers_scheduled: u64,

    /// Seconds between queue drain ticks.
    #[serde(default = "Config::default_drain_interval_secs")]
    pub drain_interval_secs: u64,
    /// Seconds between status checks of a tracked backup/restore operation.
    #[serde(default = "Config::default_status_check_interval_secs")]
    pub status_check_interval_secs: u64,
    /// Maximum seconds a deployment may stay locked by a backup/restore
    /// operation before the status poller aborts it.
    #[serde(default = "Config::default_lock_max_duration_secs")]
    pub lock_max_duration_secs: u64,
    /// Maximum seconds to wait for an abort to be acknowledged before the
    /// operation is forced to `aborted`.
    #[serde(default = "Config::default_abort_timeout_secs")]
    pub abort_timeout_secs: u64,
    /// Bounded acquisition timeout for the store's ephemeral meta-lock.
    #[serde(default = "Config::default_meta_lock_timeout_secs")]
    pub meta_lock_timeout_secs: u64,
    /// Per-lock stagger applied when reconstructing status pollers on restart.
    #[serde(default = "Config::default_restart_stagger_secs")]
    pub restart_stagger_secs: u64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(self.max_workers_total >= 1, "max_workers_total must be at least 1");
        ensure!(self.max_workers_per_action >= 1, "max_workers_per_action must be at least 1");
        ensure!(self.max_workers_scheduled >= 1, "max_workers_scheduled must be at least 1");
        ensure!(self.meta_lock_timeout_secs >= 1, "meta_lock_timeout_secs must be at least 1");
        ensure!(self.drain_interval_secs >= 1, "drain_interval_secs must be at least 1");
        ensure!(self.status_check_interval_secs >= 1, "status_check_interval_secs must be at least 1");
        Ok(())
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_max_workers_total() -> u64 {
        6
    }

    fn default_max_workers_category() -> u64 {
        3
    }

    fn default_drain_interval_secs() -> u64 {
        60
    }

    fn default_status_check_interval_secs() -> u64 {
        120
    }

    fn default_lock_max_duration_secs() -> u64 {
        7200
    }

    fn default_abort_timeout_secs() -> u64 {
        300
    }

    fn default_meta_lock_timeout_secs() -> u64 {
        5
    }

    fn default_restart_stagger_secs() -> u64 {
        10
    }
}

#[cfg(test)]
impl Config {
    /// Create a config for testing along with the tempdir backing its storage.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir().context("error creating tempdir for test config")?;
        let config = Self {
            rust_log: "".into(),
            metrics_port: 0,
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            process_role: ProcessRole::Internal,
            enable_rate_limit: true,
            director_url: "http://localhost:25555".into(),
            director_user: "admin".into(),
            director_password: "admin".into(),
            max_workers_total: Self::default_max_workers_total(),
            max_workers_per_action: Self::default_max_workers_category(),
            max_workers_scheduled: Self::default_max_workers_category(),
            drain_interval_secs: 1,
            status_check_interval_secs: 1,
            lock_max_duration_secs: Self::default_lock_max_duration_secs(),
            abort_timeout_secs: Self::default_abort_timeout_secs(),
            meta_lock_timeout_secs: 1,
            restart_stagger_secs: 0,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
