//! Ticketing integration: the collaborator that creates and looks up
//! access-request tickets in a Jira-compatible Service Desk.

pub mod jira;
pub mod payload;
pub mod routes;

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IntegrationError;

pub use jira::JiraClient;
pub use payload::{build_ticket_request, format_payload};

static ISSUE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Z0-9_]*-[0-9]+$").expect("issue key pattern compiles")
});

/// `PROJ-123` shaped. Anything else never reaches a ticketing URL.
pub fn is_issue_key(candidate: &str) -> bool {
    ISSUE_KEY.is_match(candidate)
}

/// Service desk and request type ids are interpolated into URL paths.
pub fn is_resource_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Body of a Service Desk "create request" call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketRequest {
    pub service_desk_id: String,
    pub request_type_id: String,
    pub request_field_values: serde_json::Map<String, Value>,
}

/// A ticket the ticketing system accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedTicket {
    pub issue_key: String,
    /// Full response body, stored as the task's ticket info.
    pub metadata: Value,
}

/// Normalized live state of a ticket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketDetails {
    pub issue_key: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set once the ticket reached a done status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// External ticketing system.
#[async_trait]
pub trait TicketingClient: Send + Sync {
    async fn create_ticket(&self, request: &TicketRequest) -> Result<CreatedTicket, IntegrationError>;

    async fn ticket_details(&self, issue_key: &str) -> Result<TicketDetails, IntegrationError>;

    // Metadata used while authoring templates; passed through untouched.

    async fn service_desks(&self) -> Result<Value, IntegrationError>;

    async fn request_types(&self, service_desk_id: &str) -> Result<Value, IntegrationError>;

    async fn request_type_fields(
        &self,
        service_desk_id: &str,
        request_type_id: &str,
    ) -> Result<Value, IntegrationError>;
}
