//! REST endpoints for task templates and onboarding templates.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use super::model::{OnboardingTemplate, TaskTemplate};
use super::service::{OnboardingTemplateInput, TaskTemplateInput, TemplateService};
use crate::error::EngineError;

/// Shared state for template routes.
#[derive(Clone)]
pub struct TemplateRouteState {
    pub service: Arc<TemplateService>,
}

async fn create_task_template(
    State(state): State<TemplateRouteState>,
    Json(input): Json<TaskTemplateInput>,
) -> Result<(StatusCode, Json<TaskTemplate>), EngineError> {
    let template = state.service.create_task_template(input).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_task_templates(
    State(state): State<TemplateRouteState>,
) -> Result<Json<Vec<TaskTemplate>>, EngineError> {
    Ok(Json(state.service.list_task_templates().await?))
}

async fn get_task_template(
    State(state): State<TemplateRouteState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskTemplate>, EngineError> {
    Ok(Json(state.service.get_task_template(id).await?))
}

async fn update_task_template(
    State(state): State<TemplateRouteState>,
    Path(id): Path<Uuid>,
    Json(input): Json<TaskTemplateInput>,
) -> Result<Json<TaskTemplate>, EngineError> {
    Ok(Json(state.service.update_task_template(id, input).await?))
}

async fn delete_task_template(
    State(state): State<TemplateRouteState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, EngineError> {
    state.service.delete_task_template(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_onboarding_template(
    State(state): State<TemplateRouteState>,
    Json(input): Json<OnboardingTemplateInput>,
) -> Result<(StatusCode, Json<OnboardingTemplate>), EngineError> {
    let template = state.service.create_onboarding_template(input).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

async fn list_onboarding_templates(
    State(state): State<TemplateRouteState>,
) -> Result<Json<Vec<OnboardingTemplate>>, EngineError> {
    Ok(Json(state.service.list_onboarding_templates().await?))
}

async fn get_onboarding_template(
    State(state): State<TemplateRouteState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OnboardingTemplate>, EngineError> {
    Ok(Json(state.service.get_onboarding_template(id).await?))
}

async fn update_onboarding_template(
    State(state): State<TemplateRouteState>,
    Path(id): Path<Uuid>,
    Json(input): Json<OnboardingTemplateInput>,
) -> Result<Json<OnboardingTemplate>, EngineError> {
    Ok(Json(state.service.update_onboarding_template(id, input).await?))
}

async fn delete_onboarding_template(
    State(state): State<TemplateRouteState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, EngineError> {
    state.service.delete_onboarding_template(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Build the template REST routes.
pub fn template_routes(state: TemplateRouteState) -> Router {
    Router::new()
        .route(
            "/task-templates",
            get(list_task_templates).post(create_task_template),
        )
        .route(
            "/task-templates/{id}",
            get(get_task_template)
                .put(update_task_template)
                .delete(delete_task_template),
        )
        .route(
            "/templates",
            get(list_onboarding_templates).post(create_onboarding_template),
        )
        .route(
            "/templates/{id}",
            get(get_onboarding_template)
                .put(update_onboarding_template)
                .delete(delete_onboarding_template),
        )
        .with_state(state)
}
