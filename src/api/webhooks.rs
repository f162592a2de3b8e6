//! Webhook subscription and delivery-audit handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use super::{prepare_metadata, AppState};
use crate::auth::AuthContext;
use crate::error::ServiceError;
use crate::types::{RegisterWebhookRequest, UpdateWebhookRequest};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// POST /api/v1/webhooks
pub async fn register_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<RegisterWebhookRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    prepare_metadata(req.metadata.clone())?;
    let webhook = state.webhooks.register_webhook(&ctx.user_id, req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "webhook": webhook,
            "message": "Webhook registered successfully",
        })),
    ))
}

/// GET /api/v1/webhooks
pub async fn list_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let webhooks = state.webhooks.list_webhooks(&ctx.user_id, query.active_only).await;
    let count = webhooks.len();
    Json(json!({
        "webhooks": webhooks,
        "count": count,
    }))
}

/// PUT /api/v1/webhooks/{id}
pub async fn update_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(webhook_id): Path<String>,
    Json(req): Json<UpdateWebhookRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let webhook = state.webhooks.update_webhook(&webhook_id, &ctx.user_id, req).await?;
    Ok(Json(json!({
        "webhook": webhook,
        "message": "Webhook updated successfully",
    })))
}

/// DELETE /api/v1/webhooks/{id}
pub async fn delete_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(webhook_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    state.webhooks.delete_webhook(&webhook_id, &ctx.user_id).await?;
    Ok(Json(json!({
        "webhook_id": webhook_id,
        "message": "Webhook deleted successfully",
    })))
}

/// POST /api/v1/webhooks/{id}/test
pub async fn test_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(webhook_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let result = state.webhooks.test_webhook(&webhook_id, &ctx.user_id).await?;
    Ok(Json(json!({ "data": result })))
}

/// GET /api/v1/webhooks/{id}/deliveries
pub async fn deliveries_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(webhook_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ServiceError> {
    let limit = page.limit.unwrap_or(50).min(100);
    let offset = page.offset.unwrap_or(0);

    let deliveries = state
        .webhooks
        .get_deliveries(&webhook_id, &ctx.user_id, limit, offset)
        .await?;

    let count = deliveries.len();
    Ok(Json(json!({
        "webhook_id": webhook_id,
        "deliveries": deliveries,
        "pagination": {
            "limit": limit,
            "offset": offset,
            "count": count,
        },
    })))
}

/// GET /api/v1/webhooks/stats
pub async fn stats_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> impl IntoResponse {
    Json(json!({ "data": state.webhooks.stats(&ctx.user_id).await }))
}
