//! `Database` and `StoreTransaction` traits: the async persistence interface.
//!
//! Everything that must be atomic goes through a `StoreTransaction` obtained
//! from `Database::begin`; the few standalone reads and user-directory writes
//! live on `Database` itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::warn;
use uuid::Uuid;

use crate::error::{DatabaseError, EngineError};
use crate::onboarding::model::{InstanceStatus, InstanceSummary, OnboardingInstance, TaskInstance};
use crate::templates::model::{OnboardingTemplate, TaskTemplate};
use crate::users::model::UserProfile;

/// Lock behavior of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Consistent snapshot, no writes.
    Read,
    /// Takes the write lock before the first read.
    Write,
}

/// One open transaction. Dropping it without `commit` discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    // ── Onboarding instances ────────────────────────────────────────

    async fn get_onboarding_instance(
        &mut self,
        id: Uuid,
    ) -> Result<Option<OnboardingInstance>, DatabaseError>;

    async fn insert_onboarding_instance(
        &mut self,
        instance: &OnboardingInstance,
    ) -> Result<(), DatabaseError>;

    /// Returns `false` when no such instance exists.
    async fn update_instance_status(
        &mut self,
        id: Uuid,
        status: InstanceStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Deletes the instance and, by cascade, its task instances.
    async fn delete_onboarding_instance(&mut self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Task instances ──────────────────────────────────────────────

    async fn get_task_instance(&mut self, id: Uuid) -> Result<Option<TaskInstance>, DatabaseError>;

    /// All task instances of one onboarding instance, in template order.
    async fn list_instance_tasks(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<TaskInstance>, DatabaseError>;

    async fn insert_task_instance(&mut self, task: &TaskInstance) -> Result<(), DatabaseError>;

    /// Overwrite every mutable column of an existing row.
    async fn update_task_instance(&mut self, task: &TaskInstance) -> Result<(), DatabaseError>;

    // ── Task templates ──────────────────────────────────────────────

    async fn get_task_template(&mut self, id: Uuid) -> Result<Option<TaskTemplate>, DatabaseError>;

    async fn list_task_templates(&mut self) -> Result<Vec<TaskTemplate>, DatabaseError>;

    /// Task templates backing the task instances of one onboarding instance.
    async fn instance_task_templates(
        &mut self,
        instance_id: Uuid,
    ) -> Result<Vec<TaskTemplate>, DatabaseError>;

    /// Insert or replace a task template together with its dependency rows.
    async fn save_task_template(&mut self, template: &TaskTemplate) -> Result<(), DatabaseError>;

    async fn delete_task_template(&mut self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Counts of (onboarding templates, task instances, dependent task templates)
    /// referring to a task template.
    async fn task_template_references(
        &mut self,
        id: Uuid,
    ) -> Result<TemplateReferences, DatabaseError>;

    // ── Onboarding templates ────────────────────────────────────────

    async fn get_onboarding_template(
        &mut self,
        id: Uuid,
    ) -> Result<Option<OnboardingTemplate>, DatabaseError>;

    async fn list_onboarding_templates(&mut self) -> Result<Vec<OnboardingTemplate>, DatabaseError>;

    /// The task templates of an onboarding template, in order. `None` if the
    /// onboarding template does not exist.
    async fn onboarding_template_tasks(
        &mut self,
        template_id: Uuid,
    ) -> Result<Option<Vec<TaskTemplate>>, DatabaseError>;

    /// Insert or replace an onboarding template together with its task order.
    async fn save_onboarding_template(
        &mut self,
        template: &OnboardingTemplate,
    ) -> Result<(), DatabaseError>;

    async fn delete_onboarding_template(&mut self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Number of onboarding instances created from a template.
    async fn count_template_instances(&mut self, id: Uuid) -> Result<i64, DatabaseError>;

    // ── Lifecycle ───────────────────────────────────────────────────

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Rows referring to one task template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemplateReferences {
    pub onboarding_templates: i64,
    pub task_instances: i64,
    pub dependents: i64,
}

impl TemplateReferences {
    pub fn is_referenced(&self) -> bool {
        self.onboarding_templates + self.task_instances + self.dependents > 0
    }
}

/// Backend-agnostic persistence interface.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Open a transaction. Write transactions are serialized against each other.
    async fn begin(&self, mode: TxMode) -> Result<Box<dyn StoreTransaction>, DatabaseError>;

    // ── Users ───────────────────────────────────────────────────────

    async fn insert_user(&self, user: &UserProfile) -> Result<(), DatabaseError>;

    async fn get_user(&self, id: &str) -> Result<Option<UserProfile>, DatabaseError>;

    async fn list_users(&self) -> Result<Vec<UserProfile>, DatabaseError>;

    // ── Instance listings ───────────────────────────────────────────

    /// All instances, newest first, with display names joined in.
    async fn list_instance_summaries(&self) -> Result<Vec<InstanceSummary>, DatabaseError>;

    /// A user's instances that are not yet completed, oldest first.
    async fn list_user_instances(
        &self,
        user_id: &str,
    ) -> Result<Vec<OnboardingInstance>, DatabaseError>;
}

/// Run `work` inside one transaction: commit on `Ok`, roll back on `Err`.
///
/// The closure gets the open transaction and must not hold on to it past the
/// returned future.
pub async fn with_transaction<T, F>(db: &dyn Database, mode: TxMode, work: F) -> Result<T, EngineError>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut dyn StoreTransaction) -> BoxFuture<'t, Result<T, EngineError>> + Send,
{
    let mut tx = db.begin(mode).await?;
    match work(tx.as_mut()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
