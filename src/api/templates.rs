//! Template execution handlers: execute, status poll, SSE stream

use std::convert::Infallible;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use futures::stream;
use serde_json::json;
use tracing::warn;

use super::{finalize_metadata, prepare_metadata, AppState};
use crate::auth::AuthContext;
use crate::error::ServiceError;
use crate::rate_limit::GateDecision;
use crate::types::ExecuteTemplateRequest;
use crate::validation;

/// POST /api/v1/templates/execute
pub async fn execute_handler(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    decision: Option<Extension<GateDecision>>,
    Json(req): Json<ExecuteTemplateRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let started = Instant::now();

    validation::validate_execute_request(&req)?;
    let (metadata, response_metadata) = prepare_metadata(req.metadata.clone())?;

    let result = state.engine.execute(&req, &ctx.user_id, &metadata.request_id).await;

    let mut result = match result {
        Ok(result) => result,
        Err(err) => {
            state
                .analytics
                .log_error(&ctx.user_id, &metadata.request_id, err.kind.as_str(), &err.message)
                .await;
            warn!(request_id = %metadata.request_id, error = %err, "Template execution failed");
            return Err(err);
        }
    };

    let response_metadata = finalize_metadata(
        response_metadata,
        started,
        decision.as_ref().map(|Extension(d)| d),
    );
    result.response_metadata = Some(response_metadata.clone());

    Ok(Json(json!({
        "data": result,
        "metadata": response_metadata,
    })))
}

/// GET /api/v1/templates/status/{executionId}
pub async fn status_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let execution = state
        .engine
        .get_execution(&execution_id)
        .await
        .ok_or_else(|| ServiceError::not_found(format!("execution '{}' not found", execution_id)))?;

    let next_step = execution
        .workflow
        .as_ref()
        .and_then(crate::engine::next_ready_step)
        .cloned();

    Ok(Json(json!({
        "execution_id": execution.execution_id,
        "status": execution.status,
        "progress": 100,
        "sections_count": execution.sections.len(),
        "processing_time_ms": execution.processing_time_ms,
        "workflow": execution.workflow,
        "next_step": next_step,
    })))
}

/// GET /api/v1/templates/stream/{executionId} - replays a stored execution
/// as Server-Sent Events, one `domain_result` per section then `completed`
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    let execution = state
        .engine
        .get_execution(&execution_id)
        .await
        .ok_or_else(|| ServiceError::not_found(format!("execution '{}' not found", execution_id)))?;

    let mut events: Vec<Result<Event, Infallible>> = Vec::with_capacity(execution.sections.len() + 1);
    for section in &execution.sections {
        let payload = json!({ "type": "domain_result", "data": section });
        events.push(Ok(Event::default().data(payload.to_string())));
    }
    events.push(Ok(Event::default().data(
        json!({
            "type": "completed",
            "execution_id": execution.execution_id,
            "status": execution.status,
        })
        .to_string(),
    )));

    Ok(Sse::new(stream::iter(events)))
}
