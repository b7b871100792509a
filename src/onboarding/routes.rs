//! REST endpoints for onboarding instances and their tasks.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use super::engine::OnboardingEngine;
use super::executor::{DryRun, TaskExecutor};
use super::model::{
    CreateInstanceRequest, InstanceDetail, InstanceSummary, OnboardingInstance, TaskInstance,
    TaskStatusUpdate, TaskView, UpdateInstanceRequest,
};
use crate::error::EngineError;
use crate::integration::TicketDetails;

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub engine: Arc<OnboardingEngine>,
    pub executor: Arc<TaskExecutor>,
}

#[derive(Debug, Deserialize)]
struct AssociateRequest {
    #[serde(alias = "issueKey")]
    issue_key: String,
}

/// POST /instances
async fn create_instance(
    State(state): State<OnboardingRouteState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<OnboardingInstance>), EngineError> {
    let instance = state.engine.create_instance(req).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

/// GET /instances
async fn list_instances(
    State(state): State<OnboardingRouteState>,
) -> Result<Json<Vec<InstanceSummary>>, EngineError> {
    Ok(Json(state.engine.list_instances().await?))
}

/// GET /instances/{id}
async fn get_instance(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceDetail>, EngineError> {
    Ok(Json(state.engine.instance_detail(id).await?))
}

/// PUT /instances/{id}
async fn update_instance(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateInstanceRequest>,
) -> Result<Json<OnboardingInstance>, EngineError> {
    Ok(Json(state.engine.update_instance(id, req.status).await?))
}

/// DELETE /instances/{id}
async fn delete_instance(
    State(state): State<OnboardingRouteState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, EngineError> {
    state.engine.delete_instance(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /instances/user/{userId} and GET /users/{userId}/tasks
async fn user_tasks(
    State(state): State<OnboardingRouteState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<TaskView>>, EngineError> {
    Ok(Json(state.engine.tasks_for_user(&user_id).await?))
}

/// PUT /tasks/{taskId}
async fn update_task(
    State(state): State<OnboardingRouteState>,
    Path(task_id): Path<Uuid>,
    Json(update): Json<TaskStatusUpdate>,
) -> Result<Json<TaskInstance>, EngineError> {
    Ok(Json(state.engine.update_task_status(task_id, update).await?))
}

/// POST /tasks/{taskId}/execute
async fn execute_task(
    State(state): State<OnboardingRouteState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskInstance>, EngineError> {
    Ok(Json(state.executor.execute(task_id).await?))
}

/// POST /tasks/{taskId}/dry-run
async fn dry_run_task(
    State(state): State<OnboardingRouteState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<DryRun>, EngineError> {
    Ok(Json(state.executor.dry_run(task_id).await?))
}

/// POST /tasks/{taskId}/associate
async fn associate_ticket(
    State(state): State<OnboardingRouteState>,
    Path(task_id): Path<Uuid>,
    Json(req): Json<AssociateRequest>,
) -> Result<Json<TaskInstance>, EngineError> {
    Ok(Json(state.executor.associate(task_id, &req.issue_key).await?))
}

/// POST /tasks/{taskId}/unassign
async fn unassign_ticket(
    State(state): State<OnboardingRouteState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskInstance>, EngineError> {
    Ok(Json(state.executor.unassign(task_id).await?))
}

/// GET /tasks/{taskId}/ticket
async fn ticket_details(
    State(state): State<OnboardingRouteState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TicketDetails>, EngineError> {
    Ok(Json(state.executor.ticket_details(task_id).await?))
}

/// Build the onboarding REST routes.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    Router::new()
        .route("/instances", post(create_instance).get(list_instances))
        .route(
            "/instances/{id}",
            get(get_instance).put(update_instance).delete(delete_instance),
        )
        .route("/instances/user/{user_id}", get(user_tasks))
        .route("/users/{id}/tasks", get(user_tasks))
        .route("/tasks/{task_id}", put(update_task))
        .route("/tasks/{task_id}/execute", post(execute_task))
        .route("/tasks/{task_id}/dry-run", post(dry_run_task))
        .route("/tasks/{task_id}/associate", post(associate_ticket))
        .route("/tasks/{task_id}/unassign", post(unassign_ticket))
        .route("/tasks/{task_id}/ticket", get(ticket_details))
        .with_state(state)
}
