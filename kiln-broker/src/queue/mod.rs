//! Durable operation queue.
//!
//! Deferred deployment operations and the task handles of submitted ones,
//! persisted in the store so that neither survives only in process memory.
//! Entries are keyed by deployment name under `deployments/` and by service
//! instance id under `tasks/`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::director::{Action, TaskId};
use crate::store::Store;
use kiln_core::BrokerError;

/// Key prefix for deferred deployment operations.
pub const PREFIX_DEPLOYMENTS: &str = "deployments/";
/// Key prefix for submitted task handles.
pub const PREFIX_TASKS: &str = "tasks/";

const METRIC_QUEUE_SAVED: &str = "kiln_queue_operations_saved_total";
const METRIC_QUEUE_DELETED: &str = "kiln_queue_operations_deleted_total";

/// A deferred deployment operation, exactly as needed to replay it later.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DeploymentOperation {
    /// The action of the original request, preserved for replay.
    pub action: Action,
    pub plan_id: String,
    pub deployment_name: String,
    /// The service broker request parameters of the original call.
    pub params: Value,
    /// The request arguments of the original call.
    pub args: Value,
    pub created_at: DateTime<Utc>,
}

/// The queue of deferred operations and submitted task handles.
#[derive(Clone)]
pub struct OperationQueue {
    store: Store,
}

impl OperationQueue {
    pub fn new(store: Store) -> Self {
        metrics::register_counter!(METRIC_QUEUE_SAVED, metrics::Unit::Count, "number of deployment operations enqueued");
        metrics::register_counter!(METRIC_QUEUE_DELETED, metrics::Unit::Count, "number of deployment operations removed from the queue");
        Self { store }
    }

    fn deployment_key(name: &str) -> String {
        format!("{}{}", PREFIX_DEPLOYMENTS, name)
    }

    fn task_key(instance_id: &str) -> String {
        format!("{}{}", PREFIX_TASKS, instance_id)
    }

    /// Check whether a deferred operation exists for the deployment.
    pub async fn contains_deployment(&self, name: &str) -> Result<bool> {
        Ok(self.store.get(&Self::deployment_key(name)).await?.is_some())
    }

    /// Enqueue a deferred operation for the deployment.
    ///
    /// Idempotent by presence: if an entry already exists it is left
    /// untouched and `false` is returned. Store failures surface as
    /// `BrokerError::CacheUpdateError`.
    #[tracing::instrument(level = "debug", skip(self, op), fields(deployment = %op.deployment_name))]
    pub async fn save(&self, op: &DeploymentOperation) -> Result<bool> {
        let key = Self::deployment_key(&op.deployment_name);
        let encoded = serde_json::to_vec(op).context("error encoding deployment operation")?;
        let created = self
            .store
            .compare_and_swap(&key, None, Some(encoded))
            .await
            .map_err(|err| BrokerError::CacheUpdateError { key: key.clone(), source: err })?;
        if created {
            metrics::increment_counter!(METRIC_QUEUE_SAVED);
            tracing::debug!(deployment = %op.deployment_name, "deployment operation enqueued");
        } else {
            tracing::debug!(deployment = %op.deployment_name, "deployment operation already enqueued");
        }
        Ok(created)
    }

    /// Fetch the deferred operation for the deployment, if any.
    pub async fn get_deployment(&self, name: &str) -> Result<Option<DeploymentOperation>> {
        let raw = match self.store.get(&Self::deployment_key(name)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let op = serde_json::from_slice(&raw).context("error decoding deployment operation")?;
        Ok(Some(op))
    }

    /// Remove the deferred operation for the deployment. Not finding an
    /// entry is not an error.
    pub async fn delete_deployment(&self, name: &str) -> Result<()> {
        let key = Self::deployment_key(name);
        self.store
            .delete(&key)
            .await
            .map_err(|err| BrokerError::CacheUpdateError { key, source: err })?;
        metrics::increment_counter!(METRIC_QUEUE_DELETED);
        Ok(())
    }

    /// Remove the deferred operations of all named deployments, continuing
    /// past individual failures. Returns the names that could not be removed.
    pub async fn delete_deployments(&self, names: &[String]) -> Result<Vec<String>> {
        let mut failed = vec![];
        for name in names {
            if let Err(err) = self.delete_deployment(name).await {
                tracing::error!(error = ?err, deployment = %name, "error deleting queued deployment operation");
                failed.push(name.clone());
            }
        }
        Ok(failed)
    }

    /// List the names of queued deployments, oldest first, up to `limit`.
    pub async fn list_deployment_names(&self, limit: Option<usize>) -> Result<Vec<String>> {
        let mut entries = vec![];
        for (key, raw) in self.store.list_with_prefix(PREFIX_DEPLOYMENTS, None).await? {
            let name = key.trim_start_matches(PREFIX_DEPLOYMENTS).to_string();
            let op: DeploymentOperation = match serde_json::from_slice(&raw) {
                Ok(op) => op,
                Err(err) => {
                    tracing::error!(error = ?err, key = %key, "skipping undecodable queued operation");
                    continue;
                }
            };
            entries.push((op.created_at, name));
        }
        entries.sort();
        let mut names: Vec<String> = entries.into_iter().map(|(_, name)| name).collect();
        if let Some(limit) = limit {
            names.truncate(limit);
        }
        Ok(names)
    }

    /// Record the director task handle of a submitted operation.
    pub async fn save_task_handle(&self, instance_id: &str, task_id: &TaskId) -> Result<()> {
        let key = Self::task_key(instance_id);
        let encoded = serde_json::to_vec(task_id).context("error encoding task handle")?;
        self.store
            .put(&key, encoded)
            .await
            .map_err(|err| BrokerError::CacheUpdateError { key, source: err })?;
        Ok(())
    }

    /// Fetch the recorded task handle for the service instance, if any.
    pub async fn get_task_handle(&self, instance_id: &str) -> Result<Option<TaskId>> {
        let raw = match self.store.get(&Self::task_key(instance_id)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let task_id = serde_json::from_slice(&raw).context("error decoding task handle")?;
        Ok(Some(task_id))
    }

    /// Remove the recorded task handle for the service instance.
    pub async fn delete_task_handle(&self, instance_id: &str) -> Result<()> {
        let key = Self::task_key(instance_id);
        self.store
            .delete(&key)
            .await
            .map_err(|err| BrokerError::CacheUpdateError { key, source: err })?;
        Ok(())
    }

    /// Check whether a task handle exists for the service instance.
    pub async fn contains_task_handle(&self, instance_id: &str) -> Result<bool> {
        Ok(self.store.get(&Self::task_key(instance_id)).await?.is_some())
    }

    /// Check whether any queued deployment belongs to the service instance.
    ///
    /// Deployment names embed the instance guid as their suffix, so this is
    /// a suffix match over the queued names.
    pub async fn contains_service_instance(&self, instance_guid: &str) -> Result<bool> {
        for (key, _) in self.store.list_with_prefix(PREFIX_DEPLOYMENTS, None).await? {
            if key.trim_start_matches(PREFIX_DEPLOYMENTS).ends_with(instance_guid) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
