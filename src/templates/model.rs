//! Template data model: task templates, their tagged configuration, and
//! onboarding templates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The behavior family of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Manual,
    ManualAccessRequest,
    AutomatedAccessRequest,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Manual => "manual",
            TaskType::ManualAccessRequest => "manual_access_request",
            TaskType::AutomatedAccessRequest => "automated_access_request",
        }
    }

    /// Access-request tasks may carry an external ticket.
    pub fn carries_ticket(&self) -> bool {
        matches!(
            self,
            TaskType::ManualAccessRequest | TaskType::AutomatedAccessRequest
        )
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-kind task configuration. The tag doubles as the task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskConfig {
    Manual,
    ManualAccessRequest {
        #[serde(default)]
        instructions: String,
    },
    AutomatedAccessRequest {
        #[serde(alias = "serviceDeskId")]
        service_desk_id: String,
        #[serde(alias = "requestTypeId")]
        request_type_id: String,
        #[serde(default, alias = "fieldMappings")]
        field_mappings: BTreeMap<String, FieldMapping>,
    },
}

impl TaskConfig {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskConfig::Manual => TaskType::Manual,
            TaskConfig::ManualAccessRequest { .. } => TaskType::ManualAccessRequest,
            TaskConfig::AutomatedAccessRequest { .. } => TaskType::AutomatedAccessRequest,
        }
    }

    /// Check the fields a ticket request cannot do without.
    pub fn validate(&self) -> Result<(), String> {
        if let TaskConfig::AutomatedAccessRequest {
            service_desk_id,
            request_type_id,
            field_mappings,
        } = self
        {
            if service_desk_id.trim().is_empty() {
                return Err("automated access requests need a service desk id".into());
            }
            if request_type_id.trim().is_empty() {
                return Err("automated access requests need a request type id".into());
            }
            for (field_id, mapping) in field_mappings {
                if field_id.trim().is_empty() {
                    return Err("field mapping with an empty field id".into());
                }
                if mapping.kind == MappingKind::Dynamic && !mapping.value.is_string() {
                    return Err(format!(
                        "dynamic mapping for {field_id} must name a profile field"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Where a mapped field value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    /// `value` is used verbatim.
    Static,
    /// `value` names a field on the user profile.
    Dynamic,
}

/// Mapping of one ticket field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    #[serde(rename = "type")]
    pub kind: MappingKind,
    pub value: serde_json::Value,
    #[serde(
        default,
        rename = "jiraSchema",
        alias = "jira_schema",
        skip_serializing_if = "Option::is_none"
    )]
    pub jira_schema: Option<FieldSchema>,
}

/// Subset of the ticketing field schema that decides value shaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,
}

/// A reusable task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub config: TaskConfig,
    /// Task templates that must be completed first.
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskTemplate {
    pub fn new(name: impl Into<String>, config: TaskConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            config,
            depends_on: Vec::new(),
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set description.
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    /// Builder: set dependencies.
    pub fn depending_on(mut self, deps: impl IntoIterator<Item = Uuid>) -> Self {
        self.depends_on = deps.into_iter().collect();
        self
    }

    pub fn task_type(&self) -> TaskType {
        self.config.task_type()
    }
}

/// Position of one task template inside an onboarding template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTask {
    #[serde(alias = "id")]
    pub task_template_id: Uuid,
    pub order: i64,
}

/// A named, ordered bundle of task templates assigned as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnboardingTemplate {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    /// Sorted by `order`.
    pub tasks: Vec<TemplateTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OnboardingTemplate {
    pub fn new(name: impl Into<String>, task_ids: impl IntoIterator<Item = Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            created_by: None,
            tasks: task_ids
                .into_iter()
                .enumerate()
                .map(|(i, id)| TemplateTask {
                    task_template_id: id,
                    order: i as i64,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }
}
