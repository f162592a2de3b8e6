//! Liveness, readiness and version handlers

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use super::AppState;
use crate::protocol::{PROTOCOL_VERSION, SERVER_VERSION};

/// GET /
pub async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "nexus-protocol",
        "version": SERVER_VERSION,
        "protocol_version": PROTOCOL_VERSION,
    }))
}

/// GET /health
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": SERVER_VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /ready - readiness with per-component detail
pub async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    let domains = state.registry.len().await;
    let registry_ready = domains > 0;

    let components = json!({
        "domain_registry": {
            "status": if registry_ready { "ready" } else { "empty" },
            "message": format!("{} domains registered", domains),
        },
        "webhook_dispatcher": { "status": "ready" },
        "rate_limiter": {
            "status": if state.config.rate_limit.enabled { "ready" } else { "disabled" },
        },
    });

    let status = if registry_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "status": if registry_ready { "ready" } else { "not_ready" },
            "timestamp": Utc::now().to_rfc3339(),
            "components": components,
        })),
    )
}

/// GET /api/v1/version
pub async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "protocol_version": PROTOCOL_VERSION,
        "server_version": SERVER_VERSION,
        "supported_protocol_versions": ["1.0.x", "1.1.x"],
    }))
}
