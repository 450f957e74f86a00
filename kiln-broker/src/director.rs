//! Director client.
//!
//! The director executes deployment tasks and exposes a bounded concurrent
//! task capacity. The broker consumes it through the `DirectorClient` trait;
//! all admission, queueing and supervision logic lives above this seam.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;

/// A director task identifier.
pub type TaskId = String;

/// A user-triggered deployment action.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current director task counts, partitioned by category.
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskCounts {
    /// All in-flight tasks, regardless of category.
    pub total: u64,
    /// In-flight tasks submitted by scheduled background jobs.
    pub scheduled: u64,
    /// In-flight user-triggered create tasks.
    pub create: u64,
    /// In-flight user-triggered update tasks.
    pub update: u64,
}

impl TaskCounts {
    /// The count for the given user action category.
    pub fn for_action(&self, action: Action) -> u64 {
        match action {
            Action::Create => self.create,
            Action::Update => self.update,
        }
    }
}

/// The state of a submitted director task.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Queued,
    Processing,
    Done,
    Error,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Error | TaskState::Cancelled)
    }
}

/// The kind of a long-running agent operation tracked by the status poller.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
        }
    }

    /// Parse an operation name, returning None for operations the status
    /// poller does not track.
    pub fn from_operation(op: &str) -> Option<Self> {
        match op {
            "backup" => Some(OperationKind::Backup),
            "restore" => Some(OperationKind::Restore),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The observed state of a long-running agent operation.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InProgress,
    Aborting,
    Aborted,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Aborted | OperationState::Succeeded | OperationState::Failed)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            OperationState::InProgress => "in_progress",
            OperationState::Aborting => "aborting",
            OperationState::Aborted => "aborted",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
        };
        write!(f, "{}", state)
    }
}

/// Identifying info of the service instance behind a tracked operation.
///
/// This record is embedded in the lock metadata of the operation's WRITE
/// lock, which is what allows status pollers to be reconstructed from the
/// lock store after a broker restart.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct InstanceInfo {
    pub instance_guid: String,
    pub deployment: String,
    pub agent_url: String,
    pub tenant_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub backup_guid: String,
    pub started_at: DateTime<Utc>,
}

/// The client interface consumed from the director and its deployed agents.
#[async_trait]
pub trait DirectorClient: Send + Sync + 'static {
    /// Fetch current task counts, partitioned by category.
    async fn get_current_task_counts(&self, action: Action) -> Result<TaskCounts>;
    /// Submit a deployment operation, returning the assigned task id.
    async fn submit_operation(&self, action: Action, deployment: &str, params: &Value, args: &Value, scheduled: bool) -> Result<TaskId>;
    /// Fetch the state of a submitted task.
    async fn get_task_state(&self, task_id: &str) -> Result<TaskState>;
    /// Query the deployed agent for the state of a long-running operation.
    async fn get_operation_state(&self, kind: OperationKind, info: &InstanceInfo) -> Result<OperationState>;
    /// Ask the deployed agent to abort a long-running operation.
    async fn abort_operation(&self, kind: OperationKind, info: &InstanceInfo) -> Result<()>;
}

/// The context id with which scheduled tasks are submitted to the director.
const SCHEDULED_CONTEXT: &str = "scheduled";

#[derive(Deserialize)]
struct DirectorTask {
    description: Option<String>,
    context_id: Option<String>,
}

#[derive(Deserialize)]
struct TaskStatus {
    state: TaskState,
}

#[derive(Deserialize)]
struct AgentOperationStatus {
    state: OperationState,
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: TaskId,
}

/// A `DirectorClient` implementation against a BOSH-style director HTTP API.
pub struct HttpDirectorClient {
    client: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
}

impl HttpDirectorClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .context("error building director HTTP client")?;
        Ok(Self {
            client,
            base_url: config.director_url.trim_end_matches('/').to_string(),
            user: config.director_user.clone(),
            password: config.director_password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl DirectorClient for HttpDirectorClient {
    async fn get_current_task_counts(&self, _action: Action) -> Result<TaskCounts> {
        let tasks: Vec<DirectorTask> = self
            .client
            .get(self.url("/tasks?state=processing,queued&verbose=2"))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .context("error fetching current tasks from director")?
            .error_for_status()
            .context("unexpected status fetching current tasks from director")?
            .json()
            .await
            .context("error decoding director task list")?;

        let mut counts = TaskCounts { total: tasks.len() as u64, ..Default::default() };
        for task in tasks {
            if task.context_id.as_deref() == Some(SCHEDULED_CONTEXT) {
                counts.scheduled += 1;
                continue;
            }
            match task.description.as_deref() {
                Some(desc) if desc.starts_with("create deployment") => counts.create += 1,
                Some(desc) if desc.starts_with("update deployment") => counts.update += 1,
                _ => continue,
            }
        }
        Ok(counts)
    }

    async fn submit_operation(&self, action: Action, deployment: &str, params: &Value, args: &Value, scheduled: bool) -> Result<TaskId> {
        let body = serde_json::json!({
            "action": action.as_str(),
            "deployment": deployment,
            "params": params,
            "args": args,
        });
        let mut req = self
            .client
            .post(self.url("/deployments"))
            .basic_auth(&self.user, Some(&self.password))
            .json(&body);
        if scheduled {
            req = req.header("X-Bosh-Context-Id", SCHEDULED_CONTEXT);
        }
        let resp: SubmitResponse = req
            .send()
            .await
            .with_context(|| format!("error submitting {} for deployment '{}'", action, deployment))?
            .error_for_status()
            .with_context(|| format!("unexpected status submitting {} for deployment '{}'", action, deployment))?
            .json()
            .await
            .context("error decoding director submission response")?;
        Ok(resp.task_id)
    }

    async fn get_task_state(&self, task_id: &str) -> Result<TaskState> {
        let status: TaskStatus = self
            .client
            .get(self.url(&format!("/tasks/{}", task_id)))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .with_context(|| format!("error fetching task '{}'", task_id))?
            .error_for_status()
            .with_context(|| format!("unexpected status fetching task '{}'", task_id))?
            .json()
            .await
            .context("error decoding director task status")?;
        Ok(status.state)
    }

    async fn get_operation_state(&self, kind: OperationKind, info: &InstanceInfo) -> Result<OperationState> {
        let url = format!("{}/v1/{}", info.agent_url.trim_end_matches('/'), kind.as_str());
        let status: AgentOperationStatus = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("error fetching {} state from agent of '{}'", kind, info.deployment))?
            .error_for_status()
            .with_context(|| format!("unexpected status fetching {} state from agent of '{}'", kind, info.deployment))?
            .json()
            .await
            .context("error decoding agent operation status")?;
        Ok(status.state)
    }

    async fn abort_operation(&self, kind: OperationKind, info: &InstanceInfo) -> Result<()> {
        let url = format!("{}/v1/{}", info.agent_url.trim_end_matches('/'), kind.as_str());
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("error sending {} abort to agent of '{}'", kind, info.deployment))?;
        if !resp.status().is_success() {
            return Err(anyhow!("unexpected status {} aborting {} on '{}'", resp.status(), kind, info.deployment));
        }
        Ok(())
    }
}

/// Extract the instance guid from a deployment name.
///
/// Deployment names are formatted as `{prefix}-{network_index}-{instance_guid}`,
/// where the guid is always the trailing 36 characters.
pub fn instance_guid_from_deployment(deployment: &str) -> Result<&str> {
    if deployment.len() <= 37 || !deployment.is_char_boundary(deployment.len() - 36) {
        return Err(anyhow!("deployment name '{}' does not end with an instance guid", deployment));
    }
    let guid = &deployment[deployment.len() - 36..];
    uuid::Uuid::parse_str(guid).with_context(|| format!("deployment name '{}' does not end with an instance guid", deployment))?;
    Ok(guid)
}
