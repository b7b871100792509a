//! Onboarding data model: instances, task instances, and their request/view types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::templates::model::TaskType;

/// Lifecycle status of a whole onboarding instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::NotStarted => "not_started",
            InstanceStatus::InProgress => "in_progress",
            InstanceStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(InstanceStatus::NotStarted),
            "in_progress" => Some(InstanceStatus::InProgress),
            "completed" => Some(InstanceStatus::Completed),
            _ => None,
        }
    }
}

/// Status of a single task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotStarted,
    Blocked,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::NotStarted => "not_started",
            TaskStatus::Blocked => "blocked",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(TaskStatus::NotStarted),
            "blocked" => Some(TaskStatus::Blocked),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One assignment of an onboarding template to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardingInstance {
    pub id: Uuid,
    /// The person being onboarded.
    pub user_id: String,
    /// The admin who made the assignment.
    pub assigned_by: String,
    pub onboarding_template_id: Uuid,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingInstance {
    pub fn new(
        user_id: impl Into<String>,
        onboarding_template_id: Uuid,
        assigned_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            assigned_by: assigned_by.into(),
            onboarding_template_id,
            status: InstanceStatus::NotStarted,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One task of one onboarding instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: Uuid,
    pub onboarding_instance_id: Uuid,
    pub task_template_id: Uuid,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_info: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskInstance {
    /// A fresh task instance with no ticket or progress data.
    pub fn new(onboarding_instance_id: Uuid, task_template_id: Uuid, status: TaskStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            onboarding_instance_id,
            task_template_id,
            status,
            ticket_info: None,
            issue_key: None,
            task_started_at: None,
            task_completed_at: None,
            ticket_created_at: None,
            ticket_closed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Body of `PUT /tasks/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatusUpdate {
    pub status: TaskStatus,
    /// Absent: leave as is. `null`: clear. Value: replace.
    #[serde(
        default,
        alias = "ticketInfo",
        deserialize_with = "present_or_null"
    )]
    pub ticket_info: Option<Option<serde_json::Value>>,
    #[serde(default, alias = "ticketCreatedAt")]
    pub ticket_created_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "ticketClosedAt")]
    pub ticket_closed_at: Option<DateTime<Utc>>,
}

impl TaskStatusUpdate {
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            ticket_info: None,
            ticket_created_at: None,
            ticket_closed_at: None,
        }
    }
}

fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<serde_json::Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

/// Body of `POST /instances`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    #[serde(alias = "userId")]
    pub user_id: String,
    #[serde(alias = "templateId", alias = "onboarding_template_id")]
    pub template_id: Uuid,
    #[serde(alias = "assignedBy")]
    pub assigned_by: String,
}

/// Body of `PUT /instances/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateInstanceRequest {
    pub status: InstanceStatus,
}

/// A task instance joined with its template, as shown to people.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: TaskInstance,
    pub name: String,
    pub description: String,
    pub task_type: TaskType,
    /// Task template ids this task waits on.
    pub dependencies: Vec<Uuid>,
    /// Names of dependencies that are not completed yet.
    pub blocked_by: Vec<String>,
}

/// Row of `GET /instances`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: Uuid,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub assigned_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_name: Option<String>,
    pub onboarding_template_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
}

/// Body of `GET /instances/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub instance: OnboardingInstance,
    pub tasks: Vec<TaskView>,
}
