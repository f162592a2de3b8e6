//! # Webhook Registry and Dispatcher
//!
//! Subscription CRUD plus asynchronous event delivery. Every delivery POST
//! carries an HMAC-SHA256 signature of the raw body; failures retry with
//! exponential backoff per the subscription's policy. Delivery records are
//! updated on every attempt and kept for audit. Deliveries across distinct
//! subscriptions are independent; nothing serialises deliveries within one
//! subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::Sha256;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::error::ServiceError;
use crate::types::{
    DeliveryStatus, EventPayload, RegisterWebhookRequest, TestWebhookResponse, UpdateWebhookRequest,
    Webhook, WebhookDelivery, WebhookStats,
};
use crate::validation;

type HmacSha256 = Hmac<Sha256>;

/// Shared mutable state behind the service facade
struct Inner {
    client: reqwest::Client,
    config: WebhookConfig,
    webhooks: RwLock<HashMap<String, Webhook>>,
    deliveries: RwLock<HashMap<String, WebhookDelivery>>,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct WebhookService {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
}

impl WebhookService {
    pub fn new(config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                client,
                config,
                webhooks: RwLock::new(HashMap::new()),
                deliveries: RwLock::new(HashMap::new()),
                shutdown_rx,
            }),
            shutdown_tx,
        }
    }

    /// Cancels pending retries; their deliveries are marked failed with
    /// reason `shutdown`
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // -----------------------------------------------------------------------
    // Subscription CRUD
    // -----------------------------------------------------------------------

    /// Registers a new subscription. Identical `{url, events, secret}`
    /// tuples are allowed and produce distinct ids.
    pub async fn register_webhook(
        &self,
        user_id: &str,
        req: RegisterWebhookRequest,
    ) -> Result<Webhook, ServiceError> {
        validation::validate_register_webhook(&req)?;

        let now = Utc::now().timestamp();
        let webhook = Webhook {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            url: req.url,
            events: req.events,
            secret: req.secret.filter(|s| !s.is_empty()).unwrap_or_else(generate_secret),
            active: req.active.unwrap_or(true),
            headers: req.headers.unwrap_or_default(),
            retry_policy: req.retry_policy.unwrap_or_default(),
            description: req.description,
            success_count: 0,
            error_count: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        };

        info!(
            webhook_id = %webhook.id,
            user_id = %user_id,
            url = %webhook.url,
            events = ?webhook.events,
            "Webhook registered"
        );

        self.inner
            .webhooks
            .write()
            .await
            .insert(webhook.id.clone(), webhook.clone());
        Ok(webhook)
    }

    pub async fn get_webhook(&self, webhook_id: &str, user_id: &str) -> Result<Webhook, ServiceError> {
        let webhooks = self.inner.webhooks.read().await;
        let webhook = webhooks
            .get(webhook_id)
            .ok_or_else(|| ServiceError::not_found(format!("webhook '{}' not found", webhook_id)))?;
        if webhook.user_id != user_id {
            return Err(ServiceError::authorization("webhook belongs to a different user"));
        }
        Ok(webhook.clone())
    }

    pub async fn update_webhook(
        &self,
        webhook_id: &str,
        user_id: &str,
        updates: UpdateWebhookRequest,
    ) -> Result<Webhook, ServiceError> {
        if let Some(url) = &updates.url {
            validation::validate_webhook_url(url)?;
        }
        if let Some(events) = &updates.events {
            if events.is_empty() {
                return Err(ServiceError::validation_field(
                    "events",
                    "at least one event must be specified",
                ));
            }
        }

        let mut webhooks = self.inner.webhooks.write().await;
        let webhook = webhooks
            .get_mut(webhook_id)
            .ok_or_else(|| ServiceError::not_found(format!("webhook '{}' not found", webhook_id)))?;
        if webhook.user_id != user_id {
            return Err(ServiceError::authorization("webhook belongs to a different user"));
        }

        if let Some(url) = updates.url {
            webhook.url = url;
        }
        if let Some(events) = updates.events {
            webhook.events = events;
        }
        if let Some(active) = updates.active {
            webhook.active = active;
        }
        if let Some(headers) = updates.headers {
            webhook.headers = headers;
        }
        if let Some(policy) = updates.retry_policy {
            webhook.retry_policy = policy;
        }
        if let Some(description) = updates.description {
            webhook.description = Some(description);
        }
        webhook.updated_at = Utc::now().timestamp();

        info!(webhook_id = %webhook_id, "Webhook updated");
        Ok(webhook.clone())
    }

    /// Idempotent delete: removing an unknown id is a 404, never a mutation
    pub async fn delete_webhook(&self, webhook_id: &str, user_id: &str) -> Result<(), ServiceError> {
        let mut webhooks = self.inner.webhooks.write().await;
        match webhooks.get(webhook_id) {
            None => Err(ServiceError::not_found(format!("webhook '{}' not found", webhook_id))),
            Some(webhook) if webhook.user_id != user_id => {
                Err(ServiceError::authorization("webhook belongs to a different user"))
            }
            Some(_) => {
                webhooks.remove(webhook_id);
                info!(webhook_id = %webhook_id, user_id = %user_id, "Webhook deleted");
                Ok(())
            }
        }
    }

    pub async fn list_webhooks(&self, user_id: &str, active_only: bool) -> Vec<Webhook> {
        let webhooks = self.inner.webhooks.read().await;
        let mut list: Vec<Webhook> = webhooks
            .values()
            .filter(|w| w.user_id == user_id && (!active_only || w.active))
            .cloned()
            .collect();
        list.sort_by_key(|w| std::cmp::Reverse(w.created_at));
        list
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Fans an event out to every active subscription whose event set
    /// contains its type. Deliveries run on detached tasks.
    pub async fn fire_event(
        &self,
        event_type: &str,
        data: serde_json::Value,
        user_id: Option<String>,
        request_id: Option<String>,
    ) {
        let matched: Vec<Webhook> = {
            let webhooks = self.inner.webhooks.read().await;
            webhooks
                .values()
                .filter(|w| w.active && w.events.iter().any(|e| e == event_type))
                .cloned()
                .collect()
        };

        if matched.is_empty() {
            return;
        }

        debug!(event_type = %event_type, subscriptions = %matched.len(), "Dispatching event");

        for webhook in matched {
            let payload = EventPayload {
                event_id: Uuid::new_v4().to_string(),
                event_type: event_type.to_string(),
                timestamp: Utc::now().timestamp(),
                data: data.clone(),
                user_id: user_id.clone(),
                request_id: request_id.clone(),
            };
            let inner = self.inner.clone();
            tokio::spawn(async move {
                deliver(inner, webhook, payload).await;
            });
        }
    }

    /// Sends a synthetic `webhook.test` event through the delivery pipeline,
    /// bypassing event-type matching on the subscription under test.
    pub async fn test_webhook(
        &self,
        webhook_id: &str,
        user_id: &str,
    ) -> Result<TestWebhookResponse, ServiceError> {
        let webhook = self.get_webhook(webhook_id, user_id).await?;

        let payload = EventPayload {
            event_id: Uuid::new_v4().to_string(),
            event_type: "webhook.test".to_string(),
            timestamp: Utc::now().timestamp(),
            data: serde_json::json!({
                "message": "This is a test webhook delivery",
            }),
            user_id: Some(user_id.to_string()),
            request_id: None,
        };

        let started = Instant::now();
        let delivery = deliver(self.inner.clone(), webhook, payload).await;

        Ok(TestWebhookResponse {
            webhook_id: webhook_id.to_string(),
            status: if delivery.status == DeliveryStatus::Success {
                "sent".to_string()
            } else {
                "failed".to_string()
            },
            response_code: delivery.status_code,
            response_time_ms: started.elapsed().as_millis() as i32,
            error: delivery.error,
        })
    }

    /// Delivery audit for one subscription, newest first
    pub async fn get_deliveries(
        &self,
        webhook_id: &str,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<WebhookDelivery>, ServiceError> {
        self.get_webhook(webhook_id, user_id).await?;

        let deliveries = self.inner.deliveries.read().await;
        let mut list: Vec<WebhookDelivery> = deliveries
            .values()
            .filter(|d| d.webhook_id == webhook_id)
            .cloned()
            .collect();
        list.sort_by_key(|d| std::cmp::Reverse(d.created_at));
        Ok(list.into_iter().skip(offset).take(limit).collect())
    }

    pub async fn stats(&self, user_id: &str) -> WebhookStats {
        let webhooks = self.inner.webhooks.read().await;
        let owned: Vec<&Webhook> = webhooks.values().filter(|w| w.user_id == user_id).collect();
        let owned_ids: std::collections::HashSet<&str> =
            owned.iter().map(|w| w.id.as_str()).collect();

        let deliveries = self.inner.deliveries.read().await;
        let mut total_deliveries = 0i64;
        let mut successful = 0i64;
        let mut failed = 0i64;
        for delivery in deliveries.values() {
            if owned_ids.contains(delivery.webhook_id.as_str()) {
                match delivery.status {
                    DeliveryStatus::Success => {
                        total_deliveries += 1;
                        successful += 1;
                    }
                    DeliveryStatus::Failed => {
                        total_deliveries += 1;
                        failed += 1;
                    }
                    DeliveryStatus::Pending | DeliveryStatus::Retry => total_deliveries += 1,
                }
            }
        }

        WebhookStats {
            total_webhooks: owned.len() as i64,
            active_webhooks: owned.iter().filter(|w| w.active).count() as i64,
            total_deliveries,
            successful_deliveries: successful,
            failed_deliveries: failed,
            average_response_time_ms: 0,
        }
    }
}

/// Renders the `X-Hub-Signature-256` value for a payload
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

/// Delay before attempt n (1-based, n >= 2):
/// min(initial_delay * backoff_factor^(n-2), max_delay)
fn retry_delay(policy: &crate::types::WebhookRetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2) as f64;
    let delay_ms = (policy.initial_delay as f64 * policy.backoff_factor.powf(exponent))
        .min(policy.max_delay as f64);
    Duration::from_millis(delay_ms as u64)
}

/// Runs the full delivery attempt series for one subscription and returns
/// the terminal delivery record.
async fn deliver(inner: Arc<Inner>, webhook: Webhook, payload: EventPayload) -> WebhookDelivery {
    let body = match serde_json::to_vec(&payload) {
        Ok(body) => body,
        Err(err) => {
            error!(webhook_id = %webhook.id, error = %err, "Failed to serialize event payload");
            return WebhookDelivery {
                id: Uuid::new_v4().to_string(),
                webhook_id: webhook.id,
                event_type: payload.event_type,
                payload: String::new(),
                status: DeliveryStatus::Failed,
                status_code: None,
                error: Some("payload serialization failed".to_string()),
                attempt: 1,
                delivered_at: None,
                created_at: Utc::now().timestamp(),
            };
        }
    };

    let mut delivery = WebhookDelivery {
        id: Uuid::new_v4().to_string(),
        webhook_id: webhook.id.clone(),
        event_type: payload.event_type.clone(),
        payload: String::from_utf8_lossy(&body).to_string(),
        status: DeliveryStatus::Pending,
        status_code: None,
        error: None,
        attempt: 1,
        delivered_at: None,
        created_at: Utc::now().timestamp(),
    };

    info!(
        delivery_id = %delivery.id,
        webhook_id = %webhook.id,
        event_type = %payload.event_type,
        url = %webhook.url,
        "Delivering webhook"
    );

    let max_attempts = webhook.retry_policy.max_retries + 1;
    let mut shutdown_rx = inner.shutdown_rx.clone();

    for attempt in 1..=max_attempts {
        delivery.attempt = attempt;

        match attempt_delivery(&inner, &webhook, &body, &delivery).await {
            Ok(status_code) => {
                delivery.status = DeliveryStatus::Success;
                delivery.status_code = Some(status_code);
                delivery.error = None;
                delivery.delivered_at = Some(Utc::now().timestamp());
                break;
            }
            Err((status_code, message)) => {
                delivery.status_code = status_code;
                delivery.error = Some(message.clone());
                delivery.status = if attempt < max_attempts {
                    DeliveryStatus::Retry
                } else {
                    DeliveryStatus::Failed
                };

                warn!(
                    delivery_id = %delivery.id,
                    attempt = %attempt,
                    max_attempts = %max_attempts,
                    error = %message,
                    "Webhook delivery attempt failed"
                );
            }
        }

        store_delivery(&inner, &delivery).await;

        if delivery.status != DeliveryStatus::Retry {
            break;
        }

        let delay = retry_delay(&webhook.retry_policy, attempt + 1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                delivery.status = DeliveryStatus::Failed;
                delivery.error = Some("shutdown".to_string());
                break;
            }
        }
    }

    store_delivery(&inner, &delivery).await;

    // Terminal counters bump exactly once per delivery series
    {
        let mut webhooks = inner.webhooks.write().await;
        if let Some(stored) = webhooks.get_mut(&webhook.id) {
            match delivery.status {
                DeliveryStatus::Success => stored.success_count += 1,
                DeliveryStatus::Failed => stored.error_count += 1,
                _ => {}
            }
            stored.last_used_at = Some(Utc::now().timestamp());
        }
    }

    if delivery.status == DeliveryStatus::Failed {
        error!(
            delivery_id = %delivery.id,
            webhook_id = %webhook.id,
            error = ?delivery.error,
            "Webhook delivery failed permanently"
        );
    }

    delivery
}

/// One POST to the subscription URL. 2xx is success; anything else is a
/// failure carrying the status code.
async fn attempt_delivery(
    inner: &Inner,
    webhook: &Webhook,
    body: &[u8],
    delivery: &WebhookDelivery,
) -> Result<u16, (Option<u16>, String)> {
    let signature = sign_payload(&webhook.secret, body);

    let mut request = inner
        .client
        .post(&webhook.url)
        .header("Content-Type", "application/json")
        .header("User-Agent", inner.config.user_agent.as_str())
        .header("X-Webhook-Id", webhook.id.as_str())
        .header("X-Webhook-Event", delivery.event_type.as_str())
        .header("X-Webhook-Delivery", delivery.id.as_str())
        .header("X-Hub-Signature-256", signature)
        .body(body.to_vec());

    for (key, value) in &webhook.headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let response = request
        .send()
        .await
        .map_err(|err| (None, format!("request failed: {}", err)))?;

    let status = response.status();
    if status.is_success() {
        Ok(status.as_u16())
    } else {
        Err((Some(status.as_u16()), format!("webhook returned status {}", status.as_u16())))
    }
}

async fn store_delivery(inner: &Inner, delivery: &WebhookDelivery) {
    inner
        .deliveries
        .write()
        .await
        .insert(delivery.id.clone(), delivery.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::WebhookRetryPolicy;

    fn service() -> WebhookService {
        WebhookService::new(Config::default().webhook)
    }

    fn register_request(url: &str) -> RegisterWebhookRequest {
        RegisterWebhookRequest {
            url: url.to_string(),
            events: vec!["template.completed".to_string()],
            secret: None,
            active: None,
            headers: None,
            retry_policy: None,
            description: None,
            metadata: None,
        }
    }

    #[test]
    fn test_signature_is_reproducible() {
        let payload = br#"{"event_id":"e1","event_type":"webhook.test"}"#;
        let first = sign_payload("secret-key", payload);
        let second = sign_payload("secret-key", payload);
        assert_eq!(first, second);
        assert!(first.starts_with("sha256="));
        // 32-byte digest renders as 64 hex chars
        assert_eq!(first.len(), "sha256=".len() + 64);
    }

    #[test]
    fn test_signature_differs_by_secret() {
        let payload = b"body";
        assert_ne!(sign_payload("secret-a", payload), sign_payload("secret-b", payload));
    }

    #[test]
    fn test_retry_delay_schedule() {
        let policy = WebhookRetryPolicy {
            max_retries: 5,
            initial_delay: 1_000,
            max_delay: 30_000,
            backoff_factor: 2.0,
        };

        assert_eq!(retry_delay(&policy, 2), Duration::from_millis(1_000));
        assert_eq!(retry_delay(&policy, 3), Duration::from_millis(2_000));
        assert_eq!(retry_delay(&policy, 4), Duration::from_millis(4_000));
        // Capped at max_delay
        assert_eq!(retry_delay(&policy, 8), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_register_produces_distinct_ids() {
        let service = service();
        let a = service
            .register_webhook("user-1", register_request("https://app.example.com/hooks"))
            .await
            .unwrap();
        let b = service
            .register_webhook("user-1", register_request("https://app.example.com/hooks"))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_secret_generated_when_missing() {
        let service = service();
        let webhook = service
            .register_webhook("user-1", register_request("https://app.example.com/hooks"))
            .await
            .unwrap();
        assert_eq!(webhook.secret.len(), 48);
    }

    #[tokio::test]
    async fn test_double_delete() {
        let service = service();
        let webhook = service
            .register_webhook("user-1", register_request("https://app.example.com/hooks"))
            .await
            .unwrap();

        assert!(service.delete_webhook(&webhook.id, "user-1").await.is_ok());
        let err = service.delete_webhook(&webhook.id, "user-1").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_ownership_enforced() {
        let service = service();
        let webhook = service
            .register_webhook("user-1", register_request("https://app.example.com/hooks"))
            .await
            .unwrap();

        let err = service.delete_webhook(&webhook.id, "user-2").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Authorization);

        let err = service.get_webhook(&webhook.id, "user-2").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Authorization);
    }

    #[tokio::test]
    async fn test_list_active_only() {
        let service = service();
        let active = service
            .register_webhook("user-1", register_request("https://app.example.com/a"))
            .await
            .unwrap();
        let inactive = service
            .register_webhook(
                "user-1",
                RegisterWebhookRequest {
                    active: Some(false),
                    ..register_request("https://app.example.com/b")
                },
            )
            .await
            .unwrap();

        let all = service.list_webhooks("user-1", false).await;
        assert_eq!(all.len(), 2);

        let active_list = service.list_webhooks("user-1", true).await;
        assert_eq!(active_list.len(), 1);
        assert_eq!(active_list[0].id, active.id);
        assert_ne!(active_list[0].id, inactive.id);
    }

    #[tokio::test]
    async fn test_update_webhook_fields() {
        let service = service();
        let webhook = service
            .register_webhook("user-1", register_request("https://app.example.com/hooks"))
            .await
            .unwrap();

        let updated = service
            .update_webhook(
                &webhook.id,
                "user-1",
                UpdateWebhookRequest {
                    active: Some(false),
                    events: Some(vec!["batch.finished".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!updated.active);
        assert_eq!(updated.events, vec!["batch.finished"]);
    }

    #[tokio::test]
    async fn test_fire_event_matches_by_event_type() {
        // No listener at the URL: delivery fails, but matching still
        // creates an audit record for the subscribed hook only.
        let service = service();
        let subscribed = service
            .register_webhook(
                "user-1",
                RegisterWebhookRequest {
                    retry_policy: Some(WebhookRetryPolicy {
                        max_retries: 0,
                        initial_delay: 10,
                        max_delay: 10,
                        backoff_factor: 1.0,
                    }),
                    ..register_request("http://127.0.0.1:9/hooks")
                },
            )
            .await
            .unwrap();
        service
            .register_webhook(
                "user-1",
                RegisterWebhookRequest {
                    events: vec!["batch.finished".to_string()],
                    retry_policy: Some(WebhookRetryPolicy {
                        max_retries: 0,
                        initial_delay: 10,
                        max_delay: 10,
                        backoff_factor: 1.0,
                    }),
                    ..register_request("http://127.0.0.1:9/other")
                },
            )
            .await
            .unwrap();

        service
            .fire_event("template.completed", serde_json::json!({"ok": true}), None, None)
            .await;

        // Give the detached delivery task time to run its single attempt
        tokio::time::sleep(Duration::from_millis(500)).await;

        let deliveries = service.get_deliveries(&subscribed.id, "user-1", 10, 0).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
        assert_eq!(deliveries[0].attempt, 1);
    }
}
