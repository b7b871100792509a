//! HTTP surface: merges the per-feature routers and maps engine errors to
//! responses.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::error::{EngineError, IntegrationError};
use crate::integration::TicketingClient;
use crate::integration::routes::{IntegrationRouteState, integration_routes};
use crate::onboarding::routes::{OnboardingRouteState, onboarding_routes};
use crate::onboarding::{OnboardingEngine, TaskExecutor};
use crate::store::Database;
use crate::templates::TemplateService;
use crate::templates::routes::{TemplateRouteState, template_routes};
use crate::users::routes::{UserRouteState, user_routes};

/// Build the full application router over one database and one ticketing client.
pub fn router(db: Arc<dyn Database>, ticketing: Arc<dyn TicketingClient>) -> Router {
    let engine = Arc::new(OnboardingEngine::new(Arc::clone(&db)));
    let executor = Arc::new(TaskExecutor::new(Arc::clone(&engine), Arc::clone(&ticketing)));
    let templates = Arc::new(TemplateService::new(Arc::clone(&db)));

    Router::new()
        .route("/ping", get(ping))
        .merge(onboarding_routes(OnboardingRouteState { engine, executor }))
        .merge(template_routes(TemplateRouteState { service: templates }))
        .merge(user_routes(UserRouteState { db }))
        .merge(integration_routes(IntegrationRouteState { ticketing }))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

impl EngineError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::InvalidTaskKind { .. } | EngineError::ValidationFailure(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::IntegrationFailure(e) => match e {
                IntegrationError::Http { .. } => StatusCode::BAD_GATEWAY,
                IntegrationError::NoResponse { .. } | IntegrationError::Timeout(_) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                IntegrationError::Setup(_) | IntegrationError::InvalidResponse(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            EngineError::TransactionFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::InvalidTaskKind { .. } => "invalid_task_kind",
            EngineError::IntegrationFailure(e) => e.kind(),
            EngineError::TransactionFailure(_) => "transaction_failure",
            EngineError::ValidationFailure(_) => "validation_failure",
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        }
        let body = match &self {
            EngineError::IntegrationFailure(IntegrationError::Http {
                status: upstream_status,
                body: upstream_body,
            }) => json!({
                "error": self.to_string(),
                "kind": self.kind(),
                "upstream_status": upstream_status,
                "upstream_body": upstream_body,
            }),
            _ => json!({ "error": self.to_string(), "kind": self.kind() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (EngineError::not_found("task", "x"), 404),
            (
                EngineError::InvalidTaskKind {
                    task_id: "x".into(),
                    actual: "manual".into(),
                },
                400,
            ),
            (EngineError::validation("bad"), 400),
            (
                IntegrationError::Http {
                    status: 400,
                    body: String::new(),
                }
                .into(),
                502,
            ),
            (
                IntegrationError::NoResponse {
                    reason: "refused".into(),
                }
                .into(),
                504,
            ),
            (IntegrationError::Setup("no url".into()).into(), 500),
            (DatabaseError::Query("locked".into()).into(), 500),
        ];
        for (err, code) in cases {
            assert_eq!(err.status_code().as_u16(), code, "{err}");
        }
    }

    #[test]
    fn integration_kinds_reach_the_body() {
        let err: EngineError = IntegrationError::Timeout(std::time::Duration::from_secs(1)).into();
        assert_eq!(err.kind(), "integration_unreachable");
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
