//! Onboarding instance engine.
//!
//! Creates instances from templates and runs every task status change through
//! one write transaction: fresh rows in, dependency graph built, transition
//! planned, rows written, commit.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::cascade::{TaskChange, TransitionPlan, plan_transition};
use super::graph::DependencyGraph;
use super::model::{
    CreateInstanceRequest, InstanceDetail, InstanceStatus, InstanceSummary, OnboardingInstance,
    TaskInstance, TaskStatus, TaskStatusUpdate, TaskView,
};
use super::resolver;
use crate::error::EngineError;
use crate::store::{Database, TxMode, with_transaction};
use crate::templates::model::TaskTemplate;

/// Owns instance creation and the transactional status transition.
pub struct OnboardingEngine {
    db: Arc<dyn Database>,
}

impl OnboardingEngine {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Expand an onboarding template into a new instance, one task instance
    /// per task template. All or nothing.
    pub async fn create_instance(
        &self,
        req: CreateInstanceRequest,
    ) -> Result<OnboardingInstance, EngineError> {
        if req.user_id.trim().is_empty() {
            return Err(EngineError::validation("user_id is required"));
        }
        if req.assigned_by.trim().is_empty() {
            return Err(EngineError::validation("assigned_by is required"));
        }

        let instance = OnboardingInstance::new(req.user_id, req.template_id, req.assigned_by);
        let created = instance.clone();
        let task_count = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                let templates = tx
                    .onboarding_template_tasks(instance.onboarding_template_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::not_found("onboarding template", instance.onboarding_template_id)
                    })?;

                tx.insert_onboarding_instance(&instance).await?;
                for template in &templates {
                    let status = if template.depends_on.is_empty() {
                        TaskStatus::NotStarted
                    } else {
                        TaskStatus::Blocked
                    };
                    tx.insert_task_instance(&TaskInstance::new(instance.id, template.id, status))
                        .await?;
                }
                Ok(templates.len())
            })
        })
        .await?;

        info!(
            instance_id = %created.id,
            user_id = %created.user_id,
            tasks = task_count,
            "Onboarding instance created"
        );
        Ok(created)
    }

    /// Direct status write with optional ticket fields.
    pub async fn update_task_status(
        &self,
        task_id: Uuid,
        update: TaskStatusUpdate,
    ) -> Result<TaskInstance, EngineError> {
        Ok(self.transition(task_id, TaskChange::Status(update)).await?.task)
    }

    /// Apply any task change, cascade included, in one write transaction.
    pub async fn transition(
        &self,
        task_id: Uuid,
        change: TaskChange,
    ) -> Result<TransitionPlan, EngineError> {
        let plan = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                let task = tx
                    .get_task_instance(task_id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("task", task_id))?;
                let siblings = tx.list_instance_tasks(task.onboarding_instance_id).await?;
                let templates = tx.instance_task_templates(task.onboarding_instance_id).await?;
                let graph = DependencyGraph::from_templates(&templates);

                let plan = plan_transition(&graph, &siblings, task_id, &change, Utc::now())?;
                tx.update_task_instance(&plan.task).await?;
                for effect in &plan.effects {
                    tx.update_task_instance(&effect.task).await?;
                }
                Ok(plan)
            })
        })
        .await?;

        info!(
            task_id = %task_id,
            from = %plan.previous,
            to = %plan.task.status,
            cascaded = plan.effects.len(),
            "Task status changed"
        );
        for effect in &plan.effects {
            debug!(
                task_id = %effect.task.id,
                from = %effect.from,
                to = %effect.task.status,
                "Cascade moved dependent"
            );
        }
        Ok(plan)
    }

    pub async fn update_instance(
        &self,
        id: Uuid,
        status: InstanceStatus,
    ) -> Result<OnboardingInstance, EngineError> {
        let instance = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                if !tx.update_instance_status(id, status, Utc::now()).await? {
                    return Err(EngineError::not_found("onboarding instance", id));
                }
                tx.get_onboarding_instance(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("onboarding instance", id))
            })
        })
        .await?;
        info!(instance_id = %id, status = instance.status.as_str(), "Onboarding instance updated");
        Ok(instance)
    }

    /// Delete an instance together with its task instances.
    pub async fn delete_instance(&self, id: Uuid) -> Result<(), EngineError> {
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                if tx.delete_onboarding_instance(id).await? {
                    Ok(())
                } else {
                    Err(EngineError::not_found("onboarding instance", id))
                }
            })
        })
        .await?;
        info!(instance_id = %id, "Onboarding instance deleted");
        Ok(())
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>, EngineError> {
        Ok(self.db.list_instance_summaries().await?)
    }

    /// One instance with its task views, read from one snapshot.
    pub async fn instance_detail(&self, id: Uuid) -> Result<InstanceDetail, EngineError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                let instance = tx
                    .get_onboarding_instance(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("onboarding instance", id))?;
                let tasks = tx.list_instance_tasks(id).await?;
                let templates = tx.instance_task_templates(id).await?;
                Ok(InstanceDetail {
                    instance,
                    tasks: task_views(&templates, tasks),
                })
            })
        })
        .await
    }

    /// Task views across every instance of a user that is not completed yet.
    pub async fn tasks_for_user(&self, user_id: &str) -> Result<Vec<TaskView>, EngineError> {
        let instances = self.db.list_user_instances(user_id).await?;
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                let mut views = Vec::new();
                for instance in &instances {
                    let tasks = tx.list_instance_tasks(instance.id).await?;
                    let templates = tx.instance_task_templates(instance.id).await?;
                    views.extend(task_views(&templates, tasks));
                }
                Ok(views)
            })
        })
        .await
    }
}

/// Join task instances with their templates and resolver diagnostics.
pub fn task_views(templates: &[TaskTemplate], tasks: Vec<TaskInstance>) -> Vec<TaskView> {
    let graph = DependencyGraph::from_templates(templates);
    let statuses = resolver::snapshot(&tasks);
    let by_id: HashMap<Uuid, &TaskTemplate> = templates.iter().map(|t| (t.id, t)).collect();

    tasks
        .into_iter()
        .filter_map(|task| {
            let template = by_id.get(&task.task_template_id)?;
            let blocked_by = graph
                .eligibility(template.id, &statuses)
                .unmet_names(&graph);
            Some(TaskView {
                name: template.name.clone(),
                description: template.description.clone(),
                task_type: template.task_type(),
                dependencies: template.depends_on.clone(),
                blocked_by,
                task,
            })
        })
        .collect()
}
