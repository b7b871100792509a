//! Ticketing metadata passthrough used while authoring templates.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;

use super::{TicketingClient, is_resource_id};
use crate::error::EngineError;

/// Shared state for integration routes.
#[derive(Clone)]
pub struct IntegrationRouteState {
    pub ticketing: Arc<dyn TicketingClient>,
}

async fn service_desks(
    State(state): State<IntegrationRouteState>,
) -> Result<Json<Value>, EngineError> {
    Ok(Json(state.ticketing.service_desks().await?))
}

fn check_id(id: &str) -> Result<(), EngineError> {
    if is_resource_id(id) {
        Ok(())
    } else {
        Err(EngineError::validation(format!("'{id}' is not a valid resource id")))
    }
}

async fn request_types(
    State(state): State<IntegrationRouteState>,
    Path(desk_id): Path<String>,
) -> Result<Json<Value>, EngineError> {
    check_id(&desk_id)?;
    Ok(Json(state.ticketing.request_types(&desk_id).await?))
}

async fn request_type_fields(
    State(state): State<IntegrationRouteState>,
    Path((desk_id, request_type_id)): Path<(String, String)>,
) -> Result<Json<Value>, EngineError> {
    check_id(&desk_id)?;
    check_id(&request_type_id)?;
    Ok(Json(
        state
            .ticketing
            .request_type_fields(&desk_id, &request_type_id)
            .await?,
    ))
}

/// Build the integration REST routes.
pub fn integration_routes(state: IntegrationRouteState) -> Router {
    Router::new()
        .route("/integrations/jira/servicedesks", get(service_desks))
        .route(
            "/integrations/jira/servicedesks/{desk_id}/requesttypes",
            get(request_types),
        )
        .route(
            "/integrations/jira/servicedesks/{desk_id}/requesttypes/{request_type_id}/fields",
            get(request_type_fields),
        )
        .with_state(state)
}
