//! Authentication and profile handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde_json::json;

use super::AppState;
use crate::auth::{AuthContext, LoginRequest, RefreshRequest, RegisterRequest, UpdateProfileRequest};
use crate::error::ServiceError;

/// POST /api/v1/auth/register
pub async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let user = state.auth.register(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "user": user }))))
}

/// POST /api/v1/auth/login
pub async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let (user, tokens) = state.auth.login(req).await?;
    Ok(Json(json!({ "user": user, "tokens": tokens })))
}

/// POST /api/v1/auth/refresh
pub async fn refresh_handler(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let tokens = state.auth.refresh(req).await?;
    Ok(Json(json!({ "tokens": tokens })))
}

/// GET /api/v1/users/profile
pub async fn get_profile_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<impl IntoResponse, ServiceError> {
    let user = state.auth.get_profile(&ctx.user_id).await?;
    Ok(Json(json!({ "user": user })))
}

/// PUT /api/v1/users/profile
pub async fn update_profile_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let user = state.auth.update_profile(&ctx.user_id, req).await?;
    Ok(Json(json!({ "user": user })))
}
