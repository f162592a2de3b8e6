//! # Analytics Sink
//!
//! Append-only event log used by dashboards. This is the pure write side:
//! events are recorded and aggregated, never mutated.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::types::{
    AnalyticsEvent, AnalyticsEventRequest, AnalyticsStats, ExecuteTemplateRequest,
    ExecuteTemplateResponse,
};

pub struct AnalyticsService {
    events: RwLock<Vec<AnalyticsEvent>>,
}

impl AnalyticsService {
    pub fn new() -> Self {
        Self { events: RwLock::new(Vec::new()) }
    }

    /// Appends one event to the log and returns the stored record
    pub async fn log_event(
        &self,
        user_id: &str,
        req: AnalyticsEventRequest,
        request_id: Option<String>,
        tenant_id: Option<String>,
    ) -> AnalyticsEvent {
        let event = AnalyticsEvent {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            session_id: req.session_id,
            event_type: req.event_type,
            event_data: req.event_data,
            timestamp: Utc::now().timestamp(),
            request_id,
            tenant_id,
        };

        info!(
            event_id = %event.id,
            user_id = %event.user_id,
            event_type = %event.event_type,
            "Analytics event logged"
        );

        self.events.write().await.push(event.clone());
        event
    }

    /// Records a `template.execution` event for one engine run
    pub async fn log_template_execution(
        &self,
        user_id: &str,
        request_id: &str,
        request: &ExecuteTemplateRequest,
        response: &ExecuteTemplateResponse,
    ) {
        let domains: Vec<&str> = response.sections.iter().map(|s| s.domain_id.as_str()).collect();

        let mut event_data = HashMap::new();
        event_data.insert("query".to_string(), json!(request.query));
        event_data.insert("language".to_string(), json!(request.language));
        event_data.insert("execution_id".to_string(), json!(response.execution_id));
        event_data.insert("status".to_string(), json!(response.status));
        event_data.insert("processing_time_ms".to_string(), json!(response.processing_time_ms));
        event_data.insert("sections_count".to_string(), json!(response.sections.len()));
        event_data.insert("query_type".to_string(), json!(response.query_type));
        event_data.insert("domains".to_string(), json!(domains));

        self.log_event(
            user_id,
            AnalyticsEventRequest {
                event_type: "template.execution".to_string(),
                event_data,
                session_id: request.context.as_ref().and_then(|c| c.session_id.clone()),
                metadata: None,
            },
            Some(request_id.to_string()),
            request.context.as_ref().and_then(|c| c.tenant_id.clone()),
        )
        .await;
    }

    /// Records an error event
    pub async fn log_error(
        &self,
        user_id: &str,
        request_id: &str,
        error_type: &str,
        error_message: &str,
    ) {
        let mut event_data = HashMap::new();
        event_data.insert("error_type".to_string(), json!(error_type));
        event_data.insert("error_message".to_string(), json!(error_message));

        self.log_event(
            user_id,
            AnalyticsEventRequest {
                event_type: "error".to_string(),
                event_data,
                session_id: None,
                metadata: None,
            },
            Some(request_id.to_string()),
            None,
        )
        .await;
    }

    /// Aggregates over the whole log
    pub async fn stats(&self) -> AnalyticsStats {
        let events = self.events.read().await;

        let mut events_by_type: HashMap<String, i64> = HashMap::new();
        let mut users: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for event in events.iter() {
            *events_by_type.entry(event.event_type.clone()).or_insert(0) += 1;
            users.insert(event.user_id.as_str());
        }

        AnalyticsStats {
            total_events: events.len() as i64,
            events_by_type,
            unique_users: users.len() as i64,
        }
    }

    /// Recent events for a user, newest first
    pub async fn user_events(&self, user_id: &str, limit: usize) -> Vec<AnalyticsEvent> {
        let events = self.events.read().await;
        events
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit)
            .cloned()
            .collect()
    }
}

impl Default for AnalyticsService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_request(event_type: &str) -> AnalyticsEventRequest {
        AnalyticsEventRequest {
            event_type: event_type.to_string(),
            event_data: HashMap::new(),
            session_id: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_log_event_assigns_id_and_timestamp() {
        let service = AnalyticsService::new();
        let event = service.log_event("user-1", event_request("user.action"), None, None).await;
        assert!(!event.id.is_empty());
        assert!(event.timestamp > 0);
        assert_eq!(event.event_type, "user.action");
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let service = AnalyticsService::new();
        service.log_event("user-1", event_request("user.action"), None, None).await;
        service.log_event("user-1", event_request("user.action"), None, None).await;
        service.log_event("user-2", event_request("error"), None, None).await;

        let stats = service.stats().await;
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.unique_users, 2);
        assert_eq!(*stats.events_by_type.get("user.action").unwrap(), 2);
        assert_eq!(*stats.events_by_type.get("error").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_user_events_newest_first() {
        let service = AnalyticsService::new();
        service.log_event("user-1", event_request("first"), None, None).await;
        service.log_event("user-1", event_request("second"), None, None).await;
        service.log_event("user-2", event_request("other"), None, None).await;

        let events = service.user_events("user-1", 10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "second");
        assert_eq!(events[1].event_type, "first");
    }
}
