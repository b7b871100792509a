//! Automated task executor and the other ticket-bound task operations.
//!
//! The ticketing call always happens outside any database transaction: read
//! what is needed, call out, then persist the result through the engine's
//! normal transition path.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::cascade::TaskChange;
use super::engine::OnboardingEngine;
use super::model::{TaskInstance, TaskStatus};
use crate::error::EngineError;
use crate::integration::{
    TicketDetails, TicketRequest, TicketingClient, build_ticket_request, is_issue_key,
};
use crate::store::{TxMode, with_transaction};
use crate::templates::model::{TaskTemplate, TaskType};

const DRY_RUN_MESSAGE: &str = "This is a dry run. The following payload would be sent to Jira.";

/// Body of `POST /tasks/{id}/dry-run`.
#[derive(Debug, Clone, Serialize)]
pub struct DryRun {
    pub message: String,
    pub payload: TicketRequest,
}

/// Task plus everything needed to talk to the ticketing system about it.
struct Prepared {
    task: TaskInstance,
    request: TicketRequest,
}

pub struct TaskExecutor {
    engine: Arc<OnboardingEngine>,
    ticketing: Arc<dyn TicketingClient>,
}

impl TaskExecutor {
    pub fn new(engine: Arc<OnboardingEngine>, ticketing: Arc<dyn TicketingClient>) -> Self {
        Self { engine, ticketing }
    }

    /// Create the ticket for an automated access request and move the task
    /// to `in_progress`. Nothing is written if the ticketing call fails.
    pub async fn execute(&self, task_id: Uuid) -> Result<TaskInstance, EngineError> {
        let Prepared { task, request } = self.prepare(task_id).await?;
        match task.status {
            TaskStatus::Blocked => {
                return Err(EngineError::validation(format!(
                    "task {task_id} is blocked by unmet dependencies"
                )));
            }
            TaskStatus::Completed => {
                return Err(EngineError::validation(format!(
                    "task {task_id} is already completed"
                )));
            }
            TaskStatus::NotStarted | TaskStatus::InProgress => {}
        }
        if let Some(existing) = &task.issue_key {
            return Err(EngineError::validation(format!(
                "task {task_id} already tracks ticket {existing}"
            )));
        }

        let created = self
            .ticketing
            .create_ticket(&request)
            .await
            .inspect_err(|e| {
                warn!(task_id = %task_id, kind = e.kind(), error = %e, "Ticket creation failed");
            })?;

        let plan = self
            .engine
            .transition(
                task_id,
                TaskChange::TicketCreated {
                    issue_key: created.issue_key.clone(),
                    ticket_info: created.metadata,
                },
            )
            .await
            .inspect_err(|e| {
                warn!(
                    task_id = %task_id,
                    issue_key = %created.issue_key,
                    error = %e,
                    "Ticket created but task update failed"
                );
            })?;
        info!(task_id = %task_id, issue_key = %created.issue_key, "Automated task executed");
        Ok(plan.task)
    }

    /// The request `execute` would send, without sending it or writing anything.
    pub async fn dry_run(&self, task_id: Uuid) -> Result<DryRun, EngineError> {
        let Prepared { request, .. } = self.prepare(task_id).await?;
        Ok(DryRun {
            message: DRY_RUN_MESSAGE.to_string(),
            payload: request,
        })
    }

    /// Drop ticket and progress data; the task returns to `not_started`, or
    /// `blocked` if its dependencies are unmet.
    pub async fn unassign(&self, task_id: Uuid) -> Result<TaskInstance, EngineError> {
        let plan = self.engine.transition(task_id, TaskChange::Unassign).await?;
        info!(task_id = %task_id, status = %plan.task.status, "Task unassigned");
        Ok(plan.task)
    }

    /// Link an existing ticket to an access-request task.
    pub async fn associate(&self, task_id: Uuid, issue_key: &str) -> Result<TaskInstance, EngineError> {
        let issue_key = issue_key.trim();
        if !is_issue_key(issue_key) {
            return Err(EngineError::validation(format!(
                "'{issue_key}' is not a valid issue key"
            )));
        }
        let (_, template) = self.load(task_id).await?;
        if !template.task_type().carries_ticket() {
            return Err(invalid_kind(task_id, template.task_type()));
        }

        let plan = self
            .engine
            .transition(
                task_id,
                TaskChange::Associate {
                    issue_key: issue_key.to_string(),
                    ticket_info: serde_json::json!({ "issueKey": issue_key }),
                },
            )
            .await?;
        info!(task_id = %task_id, issue_key, "Ticket associated");
        Ok(plan.task)
    }

    /// Live state of the task's ticket.
    pub async fn ticket_details(&self, task_id: Uuid) -> Result<TicketDetails, EngineError> {
        let (task, _) = self.load(task_id).await?;
        let issue_key = task
            .issue_key
            .ok_or_else(|| EngineError::validation(format!("task {task_id} has no ticket")))?;
        if !is_issue_key(&issue_key) {
            return Err(EngineError::validation(format!(
                "task {task_id} has a malformed issue key"
            )));
        }
        Ok(self.ticketing.ticket_details(&issue_key).await?)
    }

    /// Task and template from one read snapshot.
    async fn load(&self, task_id: Uuid) -> Result<(TaskInstance, TaskTemplate), EngineError> {
        with_transaction(self.engine.db().as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                let task = tx
                    .get_task_instance(task_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("task", task_id))?;
                let template = tx
                    .get_task_template(task.task_template_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("task template", task.task_template_id))?;
                Ok((task, template))
            })
        })
        .await
    }

    async fn prepare(&self, task_id: Uuid) -> Result<Prepared, EngineError> {
        let (task, template) = self.load(task_id).await?;
        if template.task_type() != TaskType::AutomatedAccessRequest {
            return Err(invalid_kind(task_id, template.task_type()));
        }

        let instance_id = task.onboarding_instance_id;
        let user_id = with_transaction(self.engine.db().as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.get_onboarding_instance(instance_id)
                    .await?
                    .map(|i| i.user_id)
                    .ok_or_else(|| EngineError::not_found("onboarding instance", instance_id))
            })
        })
        .await?;
        let profile = self
            .engine
            .db()
            .get_user(&user_id)
            .await?
            .ok_or_else(|| EngineError::not_found("user", &user_id))?;

        let request = build_ticket_request(&template.config, &profile)
            .ok_or_else(|| invalid_kind(task_id, template.task_type()))?;
        Ok(Prepared { task, request })
    }
}

fn invalid_kind(task_id: Uuid, actual: TaskType) -> EngineError {
    EngineError::InvalidTaskKind {
        task_id: task_id.to_string(),
        actual: actual.to_string(),
    }
}
