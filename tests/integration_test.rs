// End-to-end scenarios against the assembled router: execution flows,
// batching, webhook lifecycle, rate limiting and protocol negotiation.

use std::time::Duration;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use nexus_protocol_rs::{router, AppState, Config};

async fn state_with(config: Config) -> AppState {
    AppState::build(config).await
}

async fn default_state() -> AppState {
    state_with(Config::default()).await
}

async fn body_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn post_json(uri: &str, token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn delete_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("DELETE").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

/// Registers and logs in a user, returning the access token
async fn access_token(app: &Router, email: &str) -> Result<String> {
    let register = post_json(
        "/api/v1/auth/register",
        None,
        &json!({
            "email": email,
            "password": "password123",
            "first_name": "Test",
            "last_name": "User",
        }),
    );
    let response = app.clone().oneshot(register).await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let login = post_json(
        "/api/v1/auth/login",
        None,
        &json!({ "email": email, "password": "password123" }),
    );
    let response = app.clone().oneshot(login).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await?;
    Ok(body["tokens"]["access_token"].as_str().unwrap().to_string())
}

fn request_metadata() -> Value {
    json!({
        "request_id": Uuid::new_v4().to_string(),
        "protocol_version": "1.1.0",
        "client_version": "1.0.0",
        "timestamp": chrono::Utc::now().timestamp(),
    })
}

#[tokio::test]
async fn test_health_and_version_are_public() -> Result<()> {
    let app = router(default_state().await);

    let response = app.clone().oneshot(get_request("/health", None)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["status"], "healthy");

    let response = app.clone().oneshot(get_request("/ready", None)).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get_request("/api/v1/version", None)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["protocol_version"], "1.1.0");

    Ok(())
}

#[tokio::test]
async fn test_protected_route_requires_token() -> Result<()> {
    let app = router(default_state().await);

    let request = post_json("/api/v1/templates/execute", None, &json!({"query": "купить ноутбук"}));
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let body = body_json(response).await?;
    assert_eq!(body["error"]["type"], "AUTHENTICATION_ERROR");
    Ok(())
}

#[tokio::test]
async fn test_single_execute_commerce_query() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "execute@example.com").await?;

    let metadata = request_metadata();
    let request = post_json(
        "/api/v1/templates/execute",
        Some(&token),
        &json!({
            "query": "купить ноутбук",
            "language": "ru",
            "metadata": metadata.clone(),
        }),
    );
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    // Rate-limit headers annotate gated responses
    assert!(response.headers().contains_key("X-RateLimit-Limit"));
    assert!(response.headers().contains_key("X-RateLimit-Remaining"));

    let body = body_json(response).await?;
    let data = &body["data"];
    assert_eq!(data["status"], "completed");
    assert_eq!(data["sections"].as_array().unwrap().len(), 1);
    assert_eq!(data["sections"][0]["domain_id"], "commerce");
    assert!(!data["sections"][0]["results"].as_array().unwrap().is_empty());

    // Ranking covers exactly the items across all sections
    let section_items: usize = data["sections"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["results"].as_array().map(|r| r.len()).unwrap_or(0))
        .sum();
    assert_eq!(data["ranking"]["items"].as_array().unwrap().len(), section_items);

    // Response metadata echoes the request id
    assert_eq!(body["metadata"]["request_id"], metadata["request_id"]);

    Ok(())
}

#[tokio::test]
async fn test_execute_validation_failures() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "validation@example.com").await?;

    // Empty query
    let request = post_json("/api/v1/templates/execute", Some(&token), &json!({"query": ""}));
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await?;
    assert_eq!(body["error"]["type"], "VALIDATION_ERROR");
    assert_eq!(body["error"]["field"], "query");

    // 1001-character query
    let request = post_json(
        "/api/v1/templates/execute",
        Some(&token),
        &json!({"query": "x".repeat(1001)}),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unsupported language
    let request = post_json(
        "/api/v1/templates/execute",
        Some(&token),
        &json!({"query": "test", "language": "de"}),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Timeout over the ceiling
    let request = post_json(
        "/api/v1/templates/execute",
        Some(&token),
        &json!({"query": "test", "options": {"timeout_ms": 120001}}),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // min_relevance out of range
    let request = post_json(
        "/api/v1/templates/execute",
        Some(&token),
        &json!({"query": "test", "filters": {"min_relevance": 1.5}}),
    );
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn test_protocol_mismatch_returns_426() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "protocol@example.com").await?;

    let request = post_json(
        "/api/v1/templates/execute",
        Some(&token),
        &json!({
            "query": "купить ноутбук",
            "metadata": {
                "request_id": Uuid::new_v4().to_string(),
                "protocol_version": "2.0.0",
                "client_version": "2.0.0",
                "timestamp": chrono::Utc::now().timestamp(),
            },
        }),
    );
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);

    let body = body_json(response).await?;
    assert_eq!(body["error"]["type"], "PROTOCOL_VERSION_ERROR");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("2.0.0"));
    assert!(message.contains("1.1.0"));

    Ok(())
}

#[tokio::test]
async fn test_execution_status_poll_and_stream() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "poll@example.com").await?;

    let request = post_json(
        "/api/v1/templates/execute",
        Some(&token),
        &json!({"query": "купить ноутбук"}),
    );
    let response = app.clone().oneshot(request).await?;
    let body = body_json(response).await?;
    let execution_id = body["data"]["execution_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(get_request(&format!("/api/v1/templates/status/{}", execution_id), Some(&token)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let status = body_json(response).await?;
    assert_eq!(status["execution_id"], execution_id.as_str());
    assert_eq!(status["status"], "completed");

    let response = app
        .clone()
        .oneshot(get_request(&format!("/api/v1/templates/stream/{}", execution_id), Some(&token)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get(header::CONTENT_TYPE).unwrap().to_str()?;
    assert!(content_type.starts_with("text/event-stream"));

    // Unknown execution id
    let response = app
        .oneshot(get_request("/api/v1/templates/status/missing", Some(&token)))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_batch_with_one_invalid_operation() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "batch@example.com").await?;

    let request = post_json(
        "/api/v1/batch/execute",
        Some(&token),
        &json!({
            "operations": [
                {"id": 1, "type": "execute_template", "request": {"query": "купить ноутбук"}},
                {"id": 2, "type": "execute_template", "request": {"query": ""}},
            ],
            "options": {"parallel": true},
        }),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = body_json(response).await?;
    let data = &body["data"];
    assert_eq!(data["total"], 2);
    assert_eq!(data["successful"], 1);
    assert_eq!(data["failed"], 1);

    let results = data["results"].as_array().unwrap();
    assert_eq!(results[0]["operation_id"], 1);
    assert_eq!(results[1]["operation_id"], 2);
    assert_eq!(results[1]["error"]["type"], "VALIDATION_ERROR");
    assert!(results[0]["data"]["execution_id"].is_string());

    // Status endpoint sees the stored job
    let batch_id = data["batch_id"].as_str().unwrap();
    let response = app
        .oneshot(get_request(&format!("/api/v1/batch/status/{}", batch_id), Some(&token)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn test_batch_unknown_operation_type_rejected() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "badbatch@example.com").await?;

    let request = post_json(
        "/api/v1/batch/execute",
        Some(&token),
        &json!({
            "operations": [
                {"id": 1, "type": "drop_everything", "request": {}},
            ],
        }),
    );
    let response = app.oneshot(request).await?;
    // Unknown tags fail body deserialization before any scheduling
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    Ok(())
}

/// Receiver that records webhook deliveries for assertions
async fn spawn_webhook_receiver() -> Result<(String, tokio::sync::mpsc::UnboundedReceiver<(String, String)>)> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let handler = move |headers: axum::http::HeaderMap, body: String| {
        let tx = tx.clone();
        async move {
            let signature = headers
                .get("X-Hub-Signature-256")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let _ = tx.send((signature, body));
            StatusCode::OK.into_response()
        }
    };

    let receiver = Router::new().route("/hooks", post(handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, receiver).await.ok();
    });

    Ok((format!("http://{}/hooks", addr), rx))
}

#[tokio::test]
async fn test_webhook_lifecycle_register_test_list_delete() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "hooks@example.com").await?;
    let (url, mut deliveries) = spawn_webhook_receiver().await?;

    // Register
    let request = post_json(
        "/api/v1/webhooks",
        Some(&token),
        &json!({
            "url": url,
            "events": ["template.completed"],
            "secret": "test-secret",
        }),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await?;
    let webhook_id = body["webhook"]["id"].as_str().unwrap().to_string();

    // Test delivery hits the receiver and reports the status code
    let request = post_json(&format!("/api/v1/webhooks/{}/test", webhook_id), Some(&token), &json!({}));
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["data"]["status"], "sent");
    assert_eq!(body["data"]["response_code"], 200);

    let (signature, payload) = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
        .await?
        .expect("delivery received");
    assert!(signature.starts_with("sha256="));
    let event: Value = serde_json::from_str(&payload)?;
    assert_eq!(event["event_type"], "webhook.test");

    // List with active_only contains the webhook
    let response = app
        .clone()
        .oneshot(get_request("/api/v1/webhooks?active_only=true", Some(&token)))
        .await?;
    let body = body_json(response).await?;
    let listed: Vec<&str> = body["webhooks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["id"].as_str().unwrap())
        .collect();
    assert!(listed.contains(&webhook_id.as_str()));

    // Delivery audit shows the test delivery
    let response = app
        .clone()
        .oneshot(get_request(
            &format!("/api/v1/webhooks/{}/deliveries", webhook_id),
            Some(&token),
        ))
        .await?;
    let body = body_json(response).await?;
    assert!(!body["deliveries"].as_array().unwrap().is_empty());

    // Delete, then the id is gone and a second delete is 404
    let response = app
        .clone()
        .oneshot(delete_request(&format!("/api/v1/webhooks/{}", webhook_id), Some(&token)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get_request("/api/v1/webhooks", Some(&token)))
        .await?;
    let body = body_json(response).await?;
    assert!(body["webhooks"].as_array().unwrap().is_empty());

    let response = app
        .oneshot(delete_request(&format!("/api/v1/webhooks/{}", webhook_id), Some(&token)))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    Ok(())
}

#[tokio::test]
async fn test_execution_fires_completed_webhook() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "firing@example.com").await?;
    let (url, mut deliveries) = spawn_webhook_receiver().await?;

    let request = post_json(
        "/api/v1/webhooks",
        Some(&token),
        &json!({"url": url, "events": ["template.completed"]}),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::CREATED);

    let request = post_json(
        "/api/v1/templates/execute",
        Some(&token),
        &json!({"query": "купить ноутбук"}),
    );
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let (_, payload) = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
        .await?
        .expect("delivery received");
    let event: Value = serde_json::from_str(&payload)?;
    assert_eq!(event["event_type"], "template.completed");
    assert!(event["data"]["execution_id"].is_string());

    Ok(())
}

#[tokio::test]
async fn test_rate_limit_trip() -> Result<()> {
    let mut config = Config::default();
    config.rate_limit.requests_per_min = 5;
    let app = router(state_with(config).await);
    let token = access_token(&app, "ratelimit@example.com").await?;

    // Registration and login already used part of the budget; drain the rest
    let mut saw_429 = false;
    let mut retry_after = 0u64;
    for _ in 0..10 {
        let request = post_json(
            "/api/v1/templates/execute",
            Some(&token),
            &json!({"query": "купить ноутбук"}),
        );
        let response = app.clone().oneshot(request).await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            saw_429 = true;
            retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            assert_eq!(
                response.headers().get("X-RateLimit-Remaining").unwrap().to_str()?,
                "0"
            );
            break;
        }
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert!(saw_429, "rate limit never tripped");
    assert!(retry_after >= 1 && retry_after <= 60);

    Ok(())
}

#[tokio::test]
async fn test_conversation_flow() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "chat@example.com").await?;

    // Create with an initial message
    let request = post_json(
        "/api/v1/conversations",
        Some(&token),
        &json!({"title": "Ужин", "initial_message": "Расскажи рецепт борща"}),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await?;
    let conversation_id = body["conversation"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["conversation"]["message_count"], 2);

    // Send another message
    let request = post_json(
        &format!("/api/v1/conversations/{}/messages", conversation_id),
        Some(&token),
        &json!({"content": "Где купить свеклу?"}),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["message"]["role"], "assistant");

    // History pages oldest-first
    let response = app
        .clone()
        .oneshot(get_request(
            &format!("/api/v1/conversations/{}/history", conversation_id),
            Some(&token),
        ))
        .await?;
    let body = body_json(response).await?;
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "user");

    // Archive via DELETE
    let response = app
        .clone()
        .oneshot(delete_request(&format!("/api/v1/conversations/{}", conversation_id), Some(&token)))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["conversation"]["status"], "archived");

    // Archived conversations drop out of the default listing
    let response = app
        .oneshot(get_request("/api/v1/conversations", Some(&token)))
        .await?;
    let body = body_json(response).await?;
    assert!(body["conversations"].as_array().unwrap().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_conversation_ownership_isolated_between_users() -> Result<()> {
    let app = router(default_state().await);
    let owner_token = access_token(&app, "owner@example.com").await?;
    let other_token = access_token(&app, "other@example.com").await?;

    let request = post_json("/api/v1/conversations", Some(&owner_token), &json!({}));
    let response = app.clone().oneshot(request).await?;
    let body = body_json(response).await?;
    let conversation_id = body["conversation"]["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(get_request(&format!("/api/v1/conversations/{}", conversation_id), Some(&other_token)))
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await?;
    assert_eq!(body["error"]["type"], "AUTHORIZATION_ERROR");

    Ok(())
}

#[tokio::test]
async fn test_analytics_event_and_stats() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "analytics@example.com").await?;

    let request = post_json(
        "/api/v1/analytics/events",
        Some(&token),
        &json!({"event_type": "user.action", "event_data": {"action": "click"}}),
    );
    let response = app.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get_request("/api/v1/analytics/stats", Some(&token))).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert!(body["data"]["total_events"].as_i64().unwrap() >= 1);

    Ok(())
}

#[tokio::test]
async fn test_user_profile_round_trip() -> Result<()> {
    let app = router(default_state().await);
    let token = access_token(&app, "profile@example.com").await?;

    let response = app.clone().oneshot(get_request("/api/v1/users/profile", Some(&token))).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["user"]["email"], "profile@example.com");

    let request = Request::builder()
        .method("PUT")
        .uri("/api/v1/users/profile")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::from(json!({"first_name": "Renamed"}).to_string()))?;
    let response = app.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await?;
    assert_eq!(body["user"]["first_name"], "Renamed");

    Ok(())
}
