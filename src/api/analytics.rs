//! Analytics handlers

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde_json::json;

use super::{prepare_metadata, AppState};
use crate::auth::AuthContext;
use crate::error::ServiceError;
use crate::types::AnalyticsEventRequest;
use crate::validation;

/// POST /api/v1/analytics/events
pub async fn log_event_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<AnalyticsEventRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    prepare_metadata(req.metadata.clone())?;
    validation::validate_analytics_event(&req)?;

    let request_id = req.metadata.as_ref().map(|m| m.request_id.clone());
    let event = state
        .analytics
        .log_event(&ctx.user_id, req, request_id, ctx.tenant_id.clone())
        .await;

    Ok(Json(json!({
        "event_id": event.id,
        "message": "Event logged",
    })))
}

/// GET /api/v1/analytics/stats
pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "data": state.analytics.stats().await }))
}
