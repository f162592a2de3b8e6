//! # HTTP Surface
//!
//! Route table, shared application state and the envelope helpers used by
//! every handler. Handlers live in per-topic submodules.

pub mod analytics;
pub mod auth;
pub mod batch;
pub mod conversations;
pub mod health;
pub mod templates;
pub mod webhooks;

use std::sync::Arc;
use std::time::Instant;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use crate::analytics::AnalyticsService;
use crate::auth::AuthService;
use crate::auth_middleware::{auth_middleware, rate_limit_middleware};
use crate::batch::BatchService;
use crate::config::Config;
use crate::conversation::{ConversationService, KeywordReplyGenerator};
use crate::engine::ExecutionEngine;
use crate::error::ServiceError;
use crate::protocol::{self, RequestMetadata, ResponseMetadata};
use crate::rate_limit::{GateDecision, MemoryCounterStore, RateLimiter};
use crate::registry::{register_builtin_domains, DomainRegistry};
use crate::webhook::WebhookService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthService>,
    pub registry: DomainRegistry,
    pub engine: Arc<ExecutionEngine>,
    pub batch: Arc<BatchService>,
    pub webhooks: Arc<WebhookService>,
    pub conversations: Arc<ConversationService>,
    pub analytics: Arc<AnalyticsService>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    /// Wires every service from the configuration, registering the
    /// built-in domains
    pub async fn build(config: Config) -> Self {
        let config = Arc::new(config);

        let registry = DomainRegistry::new();
        register_builtin_domains(&registry).await;

        let analytics = Arc::new(AnalyticsService::new());
        let webhooks = Arc::new(WebhookService::new(config.webhook.clone()));
        let engine = Arc::new(ExecutionEngine::new(
            registry.clone(),
            config.engine.clone(),
            analytics.clone(),
            webhooks.clone(),
        ));
        let batch = Arc::new(BatchService::new(
            engine.clone(),
            analytics.clone(),
            config.batch.clone(),
        ));
        let conversations = Arc::new(ConversationService::new(Arc::new(KeywordReplyGenerator)));
        let auth = Arc::new(AuthService::new(config.auth.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::new(MemoryCounterStore::new()),
            config.rate_limit.clone(),
            config.quota.clone(),
        ));

        Self {
            config,
            auth,
            registry,
            engine,
            batch,
            webhooks,
            conversations,
            analytics,
            rate_limiter,
            started_at: Instant::now(),
        }
    }

    pub fn rate_limiter_limit(&self) -> i32 {
        self.config.rate_limit.requests_per_min as i32
    }
}

/// Builds the full router with the middleware chain
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root_handler))
        .route("/health", get(health::health_handler))
        .route("/ready", get(health::readiness_handler))
        .route("/api/v1/version", get(health::version_handler))
        .route("/api/v1/auth/register", post(auth::register_handler))
        .route("/api/v1/auth/login", post(auth::login_handler))
        .route("/api/v1/auth/refresh", post(auth::refresh_handler))
        .route(
            "/api/v1/users/profile",
            get(auth::get_profile_handler).put(auth::update_profile_handler),
        )
        .route("/api/v1/templates/execute", post(templates::execute_handler))
        .route("/api/v1/templates/status/:execution_id", get(templates::status_handler))
        .route("/api/v1/templates/stream/:execution_id", get(templates::stream_handler))
        .route("/api/v1/batch/execute", post(batch::execute_handler))
        .route("/api/v1/batch/status/:batch_id", get(batch::status_handler))
        .route("/api/v1/batch/stats", get(batch::stats_handler))
        .route("/api/v1/batch/:batch_id/cancel", post(batch::cancel_handler))
        .route(
            "/api/v1/webhooks",
            get(webhooks::list_handler).post(webhooks::register_handler),
        )
        .route(
            "/api/v1/webhooks/stats",
            get(webhooks::stats_handler),
        )
        .route(
            "/api/v1/webhooks/:webhook_id",
            put(webhooks::update_handler).delete(webhooks::delete_handler),
        )
        .route("/api/v1/webhooks/:webhook_id/test", post(webhooks::test_handler))
        .route("/api/v1/webhooks/:webhook_id/deliveries", get(webhooks::deliveries_handler))
        .route(
            "/api/v1/conversations",
            get(conversations::list_handler).post(conversations::create_handler),
        )
        .route(
            "/api/v1/conversations/:conversation_id",
            get(conversations::get_handler).delete(conversations::archive_handler),
        )
        .route(
            "/api/v1/conversations/:conversation_id/messages",
            post(conversations::send_message_handler),
        )
        .route(
            "/api/v1/conversations/:conversation_id/history",
            get(conversations::history_handler),
        )
        .route("/api/v1/analytics/events", post(analytics::log_event_handler))
        .route("/api/v1/analytics/stats", get(analytics::stats_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(RequestBodyLimitLayer::new(state.config.server.max_payload_bytes))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Runs the version gate on request metadata, synthesising metadata when
/// the client omitted it. Returns the echoing response metadata.
pub(crate) fn prepare_metadata(
    metadata: Option<RequestMetadata>,
) -> Result<(RequestMetadata, ResponseMetadata), ServiceError> {
    match metadata {
        Some(metadata) => {
            let response = protocol::validate_request_metadata(&metadata)?;
            Ok((metadata, response))
        }
        None => {
            let metadata = RequestMetadata::synthesize();
            let response = ResponseMetadata::for_request(&metadata.request_id);
            Ok((metadata, response))
        }
    }
}

/// Stamps processing time and the gate annotations onto response metadata
pub(crate) fn finalize_metadata(
    mut response: ResponseMetadata,
    started: Instant,
    decision: Option<&GateDecision>,
) -> ResponseMetadata {
    response.processing_time_ms = started.elapsed().as_millis() as i32;
    if let Some(decision) = decision {
        response.rate_limit_info = Some(decision.rate_limit_info.clone());
        response.quota_info = decision.quota_info.clone();
    }
    response
}
