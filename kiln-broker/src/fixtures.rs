//! Test fixtures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::director::{Action, DirectorClient, InstanceInfo, OperationKind, OperationState, TaskCounts, TaskId, TaskState};
use crate::lock::LockMetadata;

pub const TEST_INSTANCE_GUID: &str = "6f9b6bd5-6f01-42ea-9a38-6bc0f9d3f025";
pub const TEST_PLAN_ID: &str = "bc158c9a-7934-401e-94ab-057082a5073f";

/// Build a deployment name for the given instance guid.
pub fn deployment_name(instance_guid: &str) -> String {
    format!("kiln-0021-{}", instance_guid)
}

/// Build instance info for a tracked operation on the given instance guid.
pub fn instance_info(instance_guid: &str) -> InstanceInfo {
    InstanceInfo {
        instance_guid: instance_guid.to_string(),
        deployment: deployment_name(instance_guid),
        agent_url: "http://10.11.0.2:2718".to_string(),
        tenant_id: "tenant-1".to_string(),
        service_id: "service-1".to_string(),
        plan_id: TEST_PLAN_ID.to_string(),
        backup_guid: "071acb05-66a3-471b-af3c-8bbf1e4180be".to_string(),
        started_at: Utc::now(),
    }
}

/// Build lock metadata for the given operation, without instance info.
pub fn lock_metadata(operation: &str) -> LockMetadata {
    LockMetadata {
        operation: operation.to_string(),
        requested_by: "broker-admin".to_string(),
        instance_info: None,
    }
}

/// A record of an operation submitted to the mock director.
#[derive(Clone, Debug)]
pub struct SubmittedOp {
    pub action: Action,
    pub deployment: String,
    pub scheduled: bool,
    pub task_id: TaskId,
}

/// A scriptable in-memory `DirectorClient`.
pub struct MockDirector {
    /// The task counts returned from `get_current_task_counts`.
    pub counts: Mutex<TaskCounts>,
    /// When set, `get_current_task_counts` fails.
    pub fail_task_counts: AtomicBool,
    /// All successfully submitted operations, in order.
    pub submitted: Mutex<Vec<SubmittedOp>>,
    /// When set, submissions for this deployment name fail.
    pub fail_submit_for: Mutex<Option<String>>,
    /// The agent operation state returned from `get_operation_state`.
    pub operation_state: Mutex<OperationState>,
    /// When set, `get_operation_state` fails.
    pub fail_operation_state: AtomicBool,
    /// Number of `get_operation_state` calls observed.
    pub status_queries: AtomicU64,
    /// Number of `abort_operation` calls observed.
    pub aborts: AtomicU64,
    task_seq: AtomicU64,
}

impl MockDirector {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(TaskCounts::default()),
            fail_task_counts: AtomicBool::new(false),
            submitted: Mutex::new(Vec::new()),
            fail_submit_for: Mutex::new(None),
            operation_state: Mutex::new(OperationState::InProgress),
            fail_operation_state: AtomicBool::new(false),
            status_queries: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            task_seq: AtomicU64::new(0),
        }
    }

    pub fn set_counts(&self, counts: TaskCounts) {
        *self.counts.lock().unwrap() = counts;
    }

    pub fn set_operation_state(&self, state: OperationState) {
        *self.operation_state.lock().unwrap() = state;
    }

    pub fn submitted_deployments(&self) -> Vec<String> {
        self.submitted.lock().unwrap().iter().map(|op| op.deployment.clone()).collect()
    }
}

#[async_trait]
impl DirectorClient for MockDirector {
    async fn get_current_task_counts(&self, _action: Action) -> Result<TaskCounts> {
        if self.fail_task_counts.load(Ordering::SeqCst) {
            return Err(anyhow!("director unreachable"));
        }
        Ok(*self.counts.lock().unwrap())
    }

    async fn submit_operation(&self, action: Action, deployment: &str, _params: &Value, _args: &Value, scheduled: bool) -> Result<TaskId> {
        if self.fail_submit_for.lock().unwrap().as_deref() == Some(deployment) {
            return Err(anyhow!("director rejected submission for '{}'", deployment));
        }
        let task_id = format!("task-{}", self.task_seq.fetch_add(1, Ordering::SeqCst) + 1);
        self.submitted.lock().unwrap().push(SubmittedOp {
            action,
            deployment: deployment.to_string(),
            scheduled,
            task_id: task_id.clone(),
        });
        Ok(task_id)
    }

    async fn get_task_state(&self, _task_id: &str) -> Result<TaskState> {
        Ok(TaskState::Processing)
    }

    async fn get_operation_state(&self, _kind: OperationKind, _info: &InstanceInfo) -> Result<OperationState> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_operation_state.load(Ordering::SeqCst) {
            return Err(anyhow!("agent unreachable"));
        }
        Ok(*self.operation_state.lock().unwrap())
    }

    async fn abort_operation(&self, _kind: OperationKind, _info: &InstanceInfo) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
