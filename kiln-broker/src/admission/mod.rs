//! Admission control.
//!
//! Rate limits deployment operations against the director's bounded task
//! capacity. Denied user-triggered operations are persisted to the
//! operation queue for later replay; denied scheduled operations are
//! rejected outright since their scheduler re-issues them on its own
//! cadence.
//!
//! The capacity check is a point-in-time estimate, not a reservation.
//! Over-admission under races is tolerated; the director enforces its own
//! limits as the final backstop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use crate::config::Config;
use crate::director::{instance_guid_from_deployment, Action, DirectorClient, TaskId, TaskState};
use crate::queue::{DeploymentOperation, OperationQueue};
use kiln_core::BrokerError;

/// Max attempts when cleaning up queue records after an operation finishes.
const MAX_CLEANUP_RETRIES: u32 = 3;
/// Delay between cleanup attempts.
const CLEANUP_RETRY_DELAY: Duration = Duration::from_millis(500);

const METRIC_ADMITTED: &str = "kiln_admission_admitted_total";
const METRIC_DENIED: &str = "kiln_admission_denied_total";

/// The outcome of the capacity check against the director.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionEvaluation {
    /// Capacity is available for this operation right now.
    pub should_run_now: bool,
    /// A queue entry for this deployment already exists from an earlier
    /// denied attempt.
    pub cached: bool,
}

/// A fully resolved admission decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub should_run_now: bool,
    pub cached: bool,
    /// The caller must persist the operation for later replay.
    pub enqueue: bool,
}

/// A deployment create/update request as seen by admission control.
#[derive(Clone, Debug)]
pub struct DeploymentRequest {
    pub action: Action,
    pub plan_id: String,
    pub deployment_name: String,
    pub params: Value,
    pub args: Value,
    /// Submitted by a scheduled background job rather than a user.
    pub scheduled: bool,
    /// Bypass admission control entirely, e.g. for replays that must not
    /// be re-queued.
    pub run_immediately: bool,
}

/// The observable state of a service instance's in-flight operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurrentOperationState {
    /// Queued in the broker, not yet submitted to the director.
    InQueue,
    /// Submitted; carries the director's task state.
    Submitted(TaskState),
}

/// The outcome of a successful submission.
#[derive(Clone, Debug)]
pub struct SubmissionOutcome {
    /// The submission replayed a previously queued operation.
    pub cached: bool,
    pub task_id: TaskId,
}

/// The admission controller, gatekeeping director submissions.
#[derive(Clone)]
pub struct AdmissionController {
    config: Arc<Config>,
    director: Arc<dyn DirectorClient>,
    queue: OperationQueue,
}

impl AdmissionController {
    pub fn new(config: Arc<Config>, director: Arc<dyn DirectorClient>, queue: OperationQueue) -> Self {
        metrics::register_counter!(METRIC_ADMITTED, metrics::Unit::Count, "number of operations admitted for immediate submission");
        metrics::register_counter!(METRIC_DENIED, metrics::Unit::Count, "number of operations denied for lack of director capacity");
        Self { config, director, queue }
    }

    /// Check director capacity for the given operation.
    ///
    /// Fails closed: a director communication error is treated as "no
    /// capacity" so a partial outage never over-admits.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn evaluate(&self, scheduled: bool, action: Action, deployment_name: &str) -> Result<AdmissionEvaluation> {
        let counts = match self.director.get_current_task_counts(action).await {
            Ok(counts) => counts,
            Err(err) => {
                tracing::error!(error = ?err, deployment = deployment_name, "error fetching director task counts, denying admission");
                return Ok(AdmissionEvaluation { should_run_now: false, cached: false });
            }
        };

        let should_run_now = if counts.total >= self.config.max_workers_total {
            false
        } else if scheduled {
            counts.scheduled < self.config.max_workers_scheduled
        } else {
            counts.for_action(action) < self.config.max_workers_per_action
        };

        let cached = if should_run_now && !scheduled {
            self.queue.contains_deployment(deployment_name).await?
        } else {
            false
        };
        tracing::debug!(
            deployment = deployment_name,
            total = counts.total,
            scheduled_count = counts.scheduled,
            action_count = counts.for_action(action),
            should_run_now,
            cached,
            "admission evaluated"
        );
        Ok(AdmissionEvaluation { should_run_now, cached })
    }

    /// Resolve an evaluation into a decision.
    ///
    /// Denied scheduled operations fail with `BrokerError::DeploymentDelayed`
    /// rather than queueing, since their scheduler retries on its own cadence.
    pub fn decide(&self, eval: AdmissionEvaluation, scheduled: bool, deployment_name: &str) -> Result<AdmissionDecision> {
        if eval.should_run_now {
            return Ok(AdmissionDecision { should_run_now: true, cached: eval.cached, enqueue: false });
        }
        metrics::increment_counter!(METRIC_DENIED);
        if scheduled {
            return Err(BrokerError::DeploymentDelayed(deployment_name.to_string()).into());
        }
        Ok(AdmissionDecision { should_run_now: false, cached: false, enqueue: true })
    }

    /// Admit and submit a deployment create/update, or queue it for later.
    ///
    /// Fails with `BrokerError::DeploymentDelayed` when the operation was
    /// queued instead of submitted; the caller reports it as accepted and
    /// still in progress.
    #[tracing::instrument(level = "debug", skip(self, request), fields(deployment = %request.deployment_name))]
    pub async fn create_or_update(&self, request: DeploymentRequest) -> Result<SubmissionOutcome> {
        if !self.config.enable_rate_limit || request.run_immediately {
            let task_id = self.submit(&request).await?;
            return Ok(SubmissionOutcome { cached: false, task_id });
        }

        let eval = self.evaluate(request.scheduled, request.action, &request.deployment_name).await?;
        let decision = self.decide(eval, request.scheduled, &request.deployment_name)?;
        if decision.enqueue {
            let op = DeploymentOperation {
                action: request.action,
                plan_id: request.plan_id.clone(),
                deployment_name: request.deployment_name.clone(),
                params: request.params.clone(),
                args: request.args.clone(),
                created_at: Utc::now(),
            };
            self.queue.save(&op).await?;
            tracing::info!(deployment = %request.deployment_name, "no director capacity, operation queued");
            return Err(BrokerError::DeploymentDelayed(request.deployment_name).into());
        }

        metrics::increment_counter!(METRIC_ADMITTED);
        if decision.cached {
            // Drop the queue entry before submitting so a replay of this
            // same entry cannot submit the operation twice.
            self.queue.delete_deployment(&request.deployment_name).await?;
        }
        let task_id = self.submit(&request).await?;
        if decision.cached {
            let instance_guid = instance_guid_from_deployment(&request.deployment_name)?;
            self.queue.save_task_handle(instance_guid, &task_id).await?;
        }
        Ok(SubmissionOutcome { cached: decision.cached, task_id })
    }

    async fn submit(&self, request: &DeploymentRequest) -> Result<TaskId> {
        let task_id = self
            .director
            .submit_operation(request.action, &request.deployment_name, &request.params, &request.args, request.scheduled)
            .await
            .with_context(|| format!("error submitting {} for deployment '{}'", request.action, request.deployment_name))?;
        tracing::info!(deployment = %request.deployment_name, task_id = %task_id, action = %request.action, "operation submitted");
        Ok(task_id)
    }

    /// Remove the queue entry and task handle of a finished operation,
    /// retrying each deletion a bounded number of times.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cleanup_operation(&self, deployment_name: &str) -> Result<()> {
        let instance_guid = instance_guid_from_deployment(deployment_name)?;
        Self::with_retries("delete queued operation", || self.queue.delete_deployment(deployment_name)).await?;
        Self::with_retries("delete task handle", || self.queue.delete_task_handle(instance_guid)).await?;
        Ok(())
    }

    async fn with_retries<F, Fut>(label: &str, mut call: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < MAX_CLEANUP_RETRIES => {
                    attempt += 1;
                    tracing::error!(error = ?err, attempt, "error during operation cleanup ({}), retrying", label);
                    tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
                }
                Err(err) => return Err(err).with_context(|| format!("operation cleanup failed ({})", label)),
            }
        }
    }

    /// Report the state of a service instance's in-flight operation.
    ///
    /// Fails with `BrokerError::NotFound` when neither a submitted task nor
    /// a queued operation exists for the instance.
    pub async fn current_operation_state(&self, instance_guid: &str) -> Result<CurrentOperationState> {
        if let Some(task_id) = self.queue.get_task_handle(instance_guid).await? {
            let state = self.director.get_task_state(&task_id).await?;
            return Ok(CurrentOperationState::Submitted(state));
        }
        if self.queue.contains_service_instance(instance_guid).await? {
            return Ok(CurrentOperationState::InQueue);
        }
        Err(BrokerError::NotFound(format!("no in-flight operation for service instance '{}'", instance_guid)).into())
    }
}
