//! Batch execution handlers

use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde_json::json;

use super::{finalize_metadata, prepare_metadata, AppState};
use crate::auth::AuthContext;
use crate::error::ServiceError;
use crate::rate_limit::GateDecision;
use crate::types::BatchRequest;

/// POST /api/v1/batch/execute
pub async fn execute_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    decision: Option<Extension<GateDecision>>,
    Json(req): Json<BatchRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let started = Instant::now();
    let (metadata, response_metadata) = prepare_metadata(req.metadata.clone())?;

    let mut result = state.batch.execute_batch(&req, &ctx.user_id, &metadata.request_id).await?;

    let response_metadata = finalize_metadata(
        response_metadata,
        started,
        decision.as_ref().map(|Extension(d)| d),
    );
    result.response_metadata = Some(response_metadata.clone());

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "data": result,
            "metadata": response_metadata,
        })),
    ))
}

/// GET /api/v1/batch/status/{batchId}
pub async fn status_handler(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let status = state
        .batch
        .get_batch_status(&batch_id)
        .await
        .ok_or_else(|| ServiceError::not_found(format!("batch job '{}' not found", batch_id)))?;

    Ok(Json(json!({ "data": status })))
}

/// POST /api/v1/batch/{batchId}/cancel
pub async fn cancel_handler(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let result = state.batch.cancel_batch(&batch_id).await?;
    Ok(Json(json!({
        "data": result,
        "message": "Batch job cancelled",
    })))
}

/// GET /api/v1/batch/stats
pub async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "data": state.batch.stats().await }))
}
