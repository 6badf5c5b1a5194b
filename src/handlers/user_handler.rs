// src/handlers/user_handler.rs
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::user::{CreateUserRequest, SwitchRoleRequest, UserResponse},
    services::user_service::UserOperations,
    state::AppState,
};

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<CreateUserRequest>,
) -> DispatchResult<(StatusCode, Json<UserResponse>)> {
    let user = state.user_service.register_user(registration).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> DispatchResult<Json<UserResponse>> {
    let user = state
        .user_service
        .get_user(&user_id)
        .await?
        .ok_or_else(|| DispatchError::user_not_found(&user_id))?;
    Ok(Json(user))
}

pub async fn switch_role(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<SwitchRoleRequest>,
) -> DispatchResult<Json<UserResponse>> {
    let user = state.user_service.switch_role(&user_id, request).await?;
    Ok(Json(user))
}
