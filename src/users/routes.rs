//! REST endpoints for the user directory.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tracing::info;

use super::model::{CreateUserRequest, UserProfile};
use crate::error::{DatabaseError, EngineError};
use crate::store::Database;

/// Shared state for user routes.
#[derive(Clone)]
pub struct UserRouteState {
    pub db: Arc<dyn Database>,
}

/// POST /users
async fn create_user(
    State(state): State<UserRouteState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserProfile>), EngineError> {
    let email = req.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(EngineError::validation("a valid email is required"));
    }
    if req.name.trim().is_empty() {
        return Err(EngineError::validation("name is required"));
    }

    let mut user = UserProfile::new(email, req.name.trim(), req.role);
    user.attributes = req.attributes;
    state.db.insert_user(&user).await.map_err(|e| match e {
        DatabaseError::Constraint(_) => {
            EngineError::validation(format!("{} is already registered", user.email))
        }
        other => other.into(),
    })?;
    info!(user_id = %user.id, role = user.role.as_str(), "User created");
    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /users
async fn list_users(
    State(state): State<UserRouteState>,
) -> Result<Json<Vec<UserProfile>>, EngineError> {
    Ok(Json(state.db.list_users().await?))
}

/// GET /users/{id}
async fn get_user(
    State(state): State<UserRouteState>,
    Path(id): Path<String>,
) -> Result<Json<UserProfile>, EngineError> {
    state
        .db
        .get_user(&id)
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::not_found("user", id))
}

/// Build the user directory REST routes.
pub fn user_routes(state: UserRouteState) -> Router {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}", get(get_user))
        .with_state(state)
}
