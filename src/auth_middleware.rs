//! # Authentication and Gate Middleware
//!
//! Bearer-token extraction and validation for protected routes, followed by
//! the rate-limit/quota gate. The validated `AuthContext` and the gate's
//! `GateDecision` ride on request extensions for handlers to consume.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::AppState;
use crate::error::ServiceError;

/// Routes reachable without a token
fn is_public(path: &str) -> bool {
    matches!(path, "/" | "/health" | "/ready" | "/api/v1/version")
        || path.starts_with("/api/v1/auth/")
}

fn extract_bearer(req: &Request<Body>) -> Option<String> {
    let header = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(|token| token.to_string())
}

/// Validates the bearer token on protected routes and attaches the
/// authenticated context to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if is_public(req.uri().path()) {
        return next.run(req).await;
    }

    let token = match extract_bearer(&req) {
        Some(token) => token,
        None => {
            return ServiceError::authentication("missing authentication token").into_response();
        }
    };

    match state.auth.auth_context(&token) {
        Ok(context) => {
            req.extensions_mut().insert(context);
            next.run(req).await
        }
        Err(err) => err.into_response(),
    }
}

/// Applies the fixed-window rate limit and quota gate. Identity is the
/// authenticated user when present, the peer address otherwise. Every gated
/// response gets the `X-RateLimit-*` headers; rejections add `Retry-After`.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if matches!(path, "/" | "/health" | "/ready") {
        return next.run(req).await;
    }

    let identity = req
        .extensions()
        .get::<crate::auth::AuthContext>()
        .map(|ctx| ctx.user_id.clone())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        })
        .or_else(|| {
            req.extensions()
                .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
                .map(|info| info.0.ip().to_string())
        })
        .unwrap_or_else(|| "anonymous".to_string());

    match state.rate_limiter.check(&identity).await {
        Ok(decision) => {
            let info = decision.rate_limit_info.clone();
            req.extensions_mut().insert(decision);
            let mut response = next.run(req).await;
            apply_rate_limit_headers(&mut response, info.limit, info.remaining, info.reset_at);
            response
        }
        Err(err) => {
            let limit = state.rate_limiter_limit();
            let reset_at = err
                .metadata
                .as_ref()
                .and_then(|m| m.get("reset_at"))
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            let mut response = err.into_response();
            apply_rate_limit_headers(&mut response, limit, 0, reset_at);
            response
        }
    }
}

fn apply_rate_limit_headers(response: &mut Response, limit: i32, remaining: i32, reset_at: i64) {
    let headers = response.headers_mut();
    if let Ok(value) = limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", value);
    }
    if let Ok(value) = reset_at.to_string().parse() {
        headers.insert("X-RateLimit-Reset", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_paths() {
        assert!(is_public("/health"));
        assert!(is_public("/ready"));
        assert!(is_public("/api/v1/version"));
        assert!(is_public("/api/v1/auth/login"));
        assert!(is_public("/api/v1/auth/register"));
        assert!(!is_public("/api/v1/templates/execute"));
        assert!(!is_public("/api/v1/webhooks"));
    }

    #[test]
    fn test_extract_bearer() {
        let req = Request::builder()
            .uri("/api/v1/templates/execute")
            .header(AUTHORIZATION, "Bearer token-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_bearer(&req).as_deref(), Some("token-123"));

        let req = Request::builder()
            .uri("/api/v1/templates/execute")
            .header(AUTHORIZATION, "token-without-scheme")
            .body(Body::empty())
            .unwrap();
        assert!(extract_bearer(&req).is_none());

        let req = Request::builder()
            .uri("/api/v1/templates/execute")
            .body(Body::empty())
            .unwrap();
        assert!(extract_bearer(&req).is_none());
    }
}
