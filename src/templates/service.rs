//! Template store: save-time validation for task and onboarding templates.
//!
//! Every write runs in one write transaction so the checks see the same rows
//! the write lands on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use super::model::{OnboardingTemplate, TaskConfig, TaskTemplate, TaskType, TemplateTask};
use crate::error::EngineError;
use crate::onboarding::graph::DependencyGraph;
use crate::store::{Database, StoreTransaction, TxMode, with_transaction};

/// Body of `POST /task-templates` and `PUT /task-templates/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTemplateInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    /// Kind-specific settings without the `task_type` tag.
    #[serde(default)]
    pub config: Value,
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl TaskTemplateInput {
    fn task_config(&self) -> Result<TaskConfig, EngineError> {
        let mut fields = match &self.config {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => return Err(EngineError::validation("config must be an object")),
        };
        fields.insert(
            "task_type".to_string(),
            Value::String(self.task_type.as_str().to_string()),
        );
        serde_json::from_value(Value::Object(fields))
            .map_err(|e| EngineError::validation(format!("invalid {} config: {e}", self.task_type)))
    }
}

/// Body of `POST /templates` and `PUT /templates/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct OnboardingTemplateInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tasks: Vec<TemplateTask>,
    #[serde(default)]
    pub created_by: Option<String>,
}

pub struct TemplateService {
    db: Arc<dyn Database>,
}

impl TemplateService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    // ── Task templates ──────────────────────────────────────────────

    pub async fn create_task_template(
        &self,
        input: TaskTemplateInput,
    ) -> Result<TaskTemplate, EngineError> {
        let mut template = TaskTemplate::new(input.name.trim(), input.task_config()?)
            .with_description(input.description)
            .depending_on(input.dependencies);
        template.created_by = input.created_by;

        let saved = template.clone();
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                check_task_template(tx, &template, None).await?;
                tx.save_task_template(&template).await?;
                Ok(())
            })
        })
        .await?;
        info!(template_id = %saved.id, task_type = %saved.task_type(), "Task template created");
        Ok(saved)
    }

    pub async fn update_task_template(
        &self,
        id: Uuid,
        input: TaskTemplateInput,
    ) -> Result<TaskTemplate, EngineError> {
        let config = input.task_config()?;
        let updated = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                let existing = tx
                    .get_task_template(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("task template", id))?;
                let template = TaskTemplate {
                    name: input.name.trim().to_string(),
                    description: input.description,
                    config,
                    depends_on: input.dependencies,
                    updated_at: Utc::now(),
                    ..existing.clone()
                };
                check_task_template(tx, &template, Some(&existing)).await?;
                tx.save_task_template(&template).await?;
                Ok(template)
            })
        })
        .await?;
        info!(template_id = %id, "Task template updated");
        Ok(updated)
    }

    pub async fn get_task_template(&self, id: Uuid) -> Result<TaskTemplate, EngineError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.get_task_template(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("task template", id))
            })
        })
        .await
    }

    pub async fn list_task_templates(&self) -> Result<Vec<TaskTemplate>, EngineError> {
        with_transaction(self.db.as_ref(), TxMode::Read, |tx| {
            Box::pin(async move { Ok(tx.list_task_templates().await?) })
        })
        .await
    }

    /// Rejected while any onboarding template, task instance or other task
    /// template still refers to it.
    pub async fn delete_task_template(&self, id: Uuid) -> Result<(), EngineError> {
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                let refs = tx.task_template_references(id).await?;
                if refs.is_referenced() {
                    return Err(EngineError::validation(format!(
                        "task template {id} is still used by {} onboarding template(s), \
                         {} task instance(s) and {} dependent template(s)",
                        refs.onboarding_templates, refs.task_instances, refs.dependents
                    )));
                }
                if tx.delete_task_template(id).await? {
                    Ok(())
                } else {
                    Err(EngineError::not_found("task template", id))
                }
            })
        })
        .await?;
        info!(template_id = %id, "Task template deleted");
        Ok(())
    }

    // ── Onboarding templates ────────────────────────────────────────

    pub async fn create_onboarding_template(
        &self,
        input: OnboardingTemplateInput,
    ) -> Result<OnboardingTemplate, EngineError> {
        let mut template = OnboardingTemplate::new(input.name.trim(), std::iter::empty());
        template.description = input.description;
        template.created_by = input.created_by;
        template.tasks = ordered(input.tasks);

        let saved = template.clone();
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                check_onboarding_template(tx, &template).await?;
                tx.save_onboarding_template(&template).await?;
                Ok(())
            })
        })
        .await?;
        info!(template_id = %saved.id, tasks = saved.tasks.len(), "Onboarding template created");
        Ok(saved)
    }

    pub async fn update_onboarding_template(
        &self,
        id: Uuid,
        input: OnboardingTemplateInput,
    ) -> Result<OnboardingTemplate, EngineError> {
        let updated = with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                let existing = tx
                    .get_onboarding_template(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("onboarding template", id))?;
                let template = OnboardingTemplate {
                    name: input.name.trim().to_string(),
                    description: input.description,
                    tasks: ordered(input.tasks),
                    updated_at: Utc::now(),
                    ..existing
                };
                check_onboarding_template(tx, &template).await?;
                tx.save_onboarding_template(&template).await?;
                Ok(template)
            })
        })
        .await?;
        info!(template_id = %id, tasks = updated.tasks.len(), "Onboarding template updated");
        Ok(updated)
    }

    pub async fn get_onboarding_template(&self, id: Uuid) -> Result<OnboardingTemplate, EngineError> {
        with_transaction(self.db.as_ref(), TxMode::Read, move |tx| {
            Box::pin(async move {
                tx.get_onboarding_template(id)
                    .await?
                    .ok_or_else(|| EngineError::not_found("onboarding template", id))
            })
        })
        .await
    }

    pub async fn list_onboarding_templates(&self) -> Result<Vec<OnboardingTemplate>, EngineError> {
        with_transaction(self.db.as_ref(), TxMode::Read, |tx| {
            Box::pin(async move { Ok(tx.list_onboarding_templates().await?) })
        })
        .await
    }

    /// Rejected while onboarding instances created from it still exist.
    pub async fn delete_onboarding_template(&self, id: Uuid) -> Result<(), EngineError> {
        with_transaction(self.db.as_ref(), TxMode::Write, move |tx| {
            Box::pin(async move {
                let instances = tx.count_template_instances(id).await?;
                if instances > 0 {
                    return Err(EngineError::validation(format!(
                        "onboarding template {id} has {instances} instance(s)"
                    )));
                }
                if tx.delete_onboarding_template(id).await? {
                    Ok(())
                } else {
                    Err(EngineError::not_found("onboarding template", id))
                }
            })
        })
        .await?;
        info!(template_id = %id, "Onboarding template deleted");
        Ok(())
    }
}

/// Sort by `order` and renumber densely.
fn ordered(mut tasks: Vec<TemplateTask>) -> Vec<TemplateTask> {
    tasks.sort_by_key(|t| t.order);
    for (i, task) in tasks.iter_mut().enumerate() {
        task.order = i as i64;
    }
    tasks
}

async fn check_task_template(
    tx: &mut dyn StoreTransaction,
    template: &TaskTemplate,
    existing: Option<&TaskTemplate>,
) -> Result<(), EngineError> {
    if template.name.is_empty() {
        return Err(EngineError::validation("name is required"));
    }
    template.config.validate().map_err(EngineError::validation)?;

    let mut seen = HashSet::new();
    for dep in &template.depends_on {
        if *dep == template.id {
            return Err(EngineError::validation("a task template cannot depend on itself"));
        }
        if !seen.insert(*dep) {
            return Err(EngineError::validation(format!("dependency {dep} listed twice")));
        }
    }

    let all = tx.list_task_templates().await?;
    let known: HashSet<Uuid> = all.iter().map(|t| t.id).collect();
    if let Some(missing) = template.depends_on.iter().find(|d| !known.contains(d)) {
        return Err(EngineError::validation(format!(
            "dependency {missing} does not exist"
        )));
    }

    let mut graph = DependencyGraph::from_templates(&all);
    graph.insert(template.id, &template.name, &template.depends_on);
    if let Some(node) = graph.find_cycle() {
        return Err(EngineError::validation(format!(
            "dependencies would form a cycle through '{node}'"
        )));
    }

    let Some(existing) = existing else {
        return Ok(());
    };
    let before: HashSet<Uuid> = existing.depends_on.iter().copied().collect();
    if before == seen {
        return Ok(());
    }
    let refs = tx.task_template_references(template.id).await?;
    if refs.task_instances > 0 {
        return Err(EngineError::validation(format!(
            "dependencies of '{}' are frozen while {} task instance(s) use it",
            existing.name, refs.task_instances
        )));
    }
    // Every onboarding template listing this task must also list its new
    // dependencies.
    for onboarding in tx.list_onboarding_templates().await? {
        let listed: HashSet<Uuid> = onboarding.tasks.iter().map(|t| t.task_template_id).collect();
        if !listed.contains(&template.id) {
            continue;
        }
        if let Some(missing) = template.depends_on.iter().find(|d| !listed.contains(d)) {
            return Err(EngineError::validation(format!(
                "onboarding template '{}' lists '{}' but not its dependency {missing}",
                onboarding.name, template.name
            )));
        }
    }
    Ok(())
}

async fn check_onboarding_template(
    tx: &mut dyn StoreTransaction,
    template: &OnboardingTemplate,
) -> Result<(), EngineError> {
    if template.name.is_empty() {
        return Err(EngineError::validation("name is required"));
    }

    let mut listed = HashSet::new();
    for task in &template.tasks {
        if !listed.insert(task.task_template_id) {
            return Err(EngineError::validation(format!(
                "task template {} listed twice",
                task.task_template_id
            )));
        }
    }

    let all: HashMap<Uuid, TaskTemplate> = tx
        .list_task_templates()
        .await?
        .into_iter()
        .map(|t| (t.id, t))
        .collect();
    for task in &template.tasks {
        let Some(task_template) = all.get(&task.task_template_id) else {
            return Err(EngineError::validation(format!(
                "task template {} does not exist",
                task.task_template_id
            )));
        };
        if let Some(missing) = task_template.depends_on.iter().find(|d| !listed.contains(d)) {
            let dep_name = all.get(missing).map(|t| t.name.as_str()).unwrap_or("unknown");
            return Err(EngineError::validation(format!(
                "'{}' depends on '{dep_name}', which the template does not include",
                task_template.name
            )));
        }
    }
    Ok(())
}
