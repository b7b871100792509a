//! Jira Service Desk client.
//!
//! Thin reqwest wrapper: bearer auth, a hard per-request timeout, and error
//! mapping that keeps "the ticketing system said no" apart from "the
//! ticketing system never answered".

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{CreatedTicket, TicketDetails, TicketRequest, TicketingClient, is_issue_key, is_resource_id};
use crate::config::JiraConfig;
use crate::error::IntegrationError;

/// Client for a Jira-compatible Service Desk REST API.
pub struct JiraClient {
    base_url: Option<String>,
    api_token: SecretString,
    timeout: Duration,
    client: reqwest::Client,
}

impl JiraClient {
    pub fn new(config: &JiraConfig) -> Result<Self, IntegrationError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IntegrationError::Setup(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config
                .base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            api_token: config.api_token.clone(),
            timeout: config.timeout,
            client,
        })
    }

    fn url(&self, path: &str) -> Result<String, IntegrationError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| IntegrationError::Setup("JIRA_BASE_URL is not configured".into()))?;
        Ok(format!("{base}{path}"))
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, IntegrationError> {
        let url = self.url(path)?;
        info!(method = %method, path, "Calling ticketing API");

        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(self.api_token.expose_secret());
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(path, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(path, status = status.as_u16(), "Ticketing API rejected request");
            return Err(IntegrationError::Http {
                status: status.as_u16(),
                body,
            });
        }
        debug!(path, status = status.as_u16(), "Ticketing API success");

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(json!({ "success": true }));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| IntegrationError::InvalidResponse(format!("{path}: {e}")))
    }

    fn transport_error(&self, path: &str, e: reqwest::Error) -> IntegrationError {
        if e.is_timeout() {
            warn!(path, timeout = ?self.timeout, "Ticketing API timed out");
            IntegrationError::Timeout(self.timeout)
        } else if e.is_builder() {
            IntegrationError::Setup(e.to_string())
        } else {
            warn!(path, error = %e, "No response from ticketing API");
            IntegrationError::NoResponse {
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl TicketingClient for JiraClient {
    async fn create_ticket(&self, request: &TicketRequest) -> Result<CreatedTicket, IntegrationError> {
        let body = serde_json::to_value(request)
            .map_err(|e| IntegrationError::Setup(format!("ticket request: {e}")))?;
        let metadata = self
            .call(Method::POST, "/rest/servicedeskapi/request", Some(body))
            .await?;
        let issue_key = metadata
            .get("issueKey")
            .and_then(Value::as_str)
            .ok_or_else(|| IntegrationError::InvalidResponse("response has no issueKey".into()))?
            .to_string();
        info!(issue_key = %issue_key, "Ticket created");
        Ok(CreatedTicket {
            issue_key,
            metadata,
        })
    }

    /// Service Desk request first; plain issues answer 404 there, so fall
    /// back to the generic issue endpoint.
    async fn ticket_details(&self, issue_key: &str) -> Result<TicketDetails, IntegrationError> {
        if !is_issue_key(issue_key) {
            return Err(IntegrationError::Setup(format!(
                "refusing to look up malformed issue key '{issue_key}'"
            )));
        }
        match self
            .call(
                Method::GET,
                &format!("/rest/servicedeskapi/request/{issue_key}"),
                None,
            )
            .await
        {
            Ok(request) => normalize_service_desk_request(&request),
            Err(IntegrationError::Http { status: 404, .. }) => {
                debug!(issue_key, "Not a Service Desk request; trying generic issue API");
                let issue = self
                    .call(Method::GET, &format!("/rest/api/2/issue/{issue_key}"), None)
                    .await?;
                normalize_issue(&issue)
            }
            Err(e) => Err(e),
        }
    }

    async fn service_desks(&self) -> Result<Value, IntegrationError> {
        self.call(Method::GET, "/rest/servicedeskapi/servicedesk", None)
            .await
    }

    async fn request_types(&self, service_desk_id: &str) -> Result<Value, IntegrationError> {
        check_ids(&[service_desk_id])?;
        self.call(
            Method::GET,
            &format!("/rest/servicedeskapi/servicedesk/{service_desk_id}/requesttype"),
            None,
        )
        .await
    }

    async fn request_type_fields(
        &self,
        service_desk_id: &str,
        request_type_id: &str,
    ) -> Result<Value, IntegrationError> {
        check_ids(&[service_desk_id, request_type_id])?;
        self.call(
            Method::GET,
            &format!(
                "/rest/servicedeskapi/servicedesk/{service_desk_id}/requesttype/{request_type_id}/field"
            ),
            None,
        )
        .await
    }
}

fn check_ids(ids: &[&str]) -> Result<(), IntegrationError> {
    match ids.iter().find(|id| !is_resource_id(id)) {
        Some(id) => Err(IntegrationError::Setup(format!("malformed resource id '{id}'"))),
        None => Ok(()),
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Jira writes offsets without a colon (`+0700`), which RFC 3339 rejects.
fn parse_jira_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn is_done(category: Option<&str>) -> bool {
    category.is_some_and(|c| c.eq_ignore_ascii_case("done"))
}

/// Shape of `GET /rest/servicedeskapi/request/{key}`.
pub fn normalize_service_desk_request(request: &Value) -> Result<TicketDetails, IntegrationError> {
    let issue_key = str_at(request, "/issueKey")
        .ok_or_else(|| IntegrationError::InvalidResponse("request has no issueKey".into()))?;
    let status_category = str_at(request, "/currentStatus/statusCategory");
    let resolved_at = if is_done(status_category) {
        str_at(request, "/currentStatus/statusDate/iso8601").and_then(parse_jira_time)
    } else {
        None
    };
    Ok(TicketDetails {
        issue_key: issue_key.to_string(),
        status: str_at(request, "/currentStatus/status")
            .unwrap_or("unknown")
            .to_string(),
        status_category: status_category.map(str::to_string),
        request_type: str_at(request, "/requestType/name").map(str::to_string),
        created_at: str_at(request, "/createdDate/iso8601").and_then(parse_jira_time),
        resolved_at,
    })
}

/// Shape of `GET /rest/api/2/issue/{key}`.
pub fn normalize_issue(issue: &Value) -> Result<TicketDetails, IntegrationError> {
    let issue_key = str_at(issue, "/key")
        .ok_or_else(|| IntegrationError::InvalidResponse("issue has no key".into()))?;
    let status_category = str_at(issue, "/fields/status/statusCategory/key");
    let resolved_at = if is_done(status_category) {
        str_at(issue, "/fields/resolutiondate")
            .or_else(|| str_at(issue, "/fields/updated"))
            .and_then(parse_jira_time)
    } else {
        None
    };
    Ok(TicketDetails {
        issue_key: issue_key.to_string(),
        status: str_at(issue, "/fields/status/name")
            .unwrap_or("unknown")
            .to_string(),
        status_category: status_category.map(str::to_string),
        request_type: str_at(issue, "/fields/issuetype/name").map(str::to_string),
        created_at: str_at(issue, "/fields/created").and_then(parse_jira_time),
        resolved_at,
    })
}
