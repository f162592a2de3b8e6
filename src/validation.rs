//! # Request Validation
//!
//! Field-level validation for inbound request bodies. The first line of
//! defense after deserialization; every failure names the offending field.

use url::Url;

use crate::error::ServiceError;
use crate::types::{
    AdvancedFilters, AnalyticsEventRequest, BatchOptions, BatchRequest, ExecuteOptions,
    ExecuteTemplateRequest, Location, RegisterWebhookRequest, SendMessageRequest,
};

/// Maximum query length in characters
pub const MAX_QUERY_LENGTH: usize = 1000;
/// Maximum execution timeout in milliseconds
pub const MAX_TIMEOUT_MS: i32 = 120_000;
/// Maximum results requested per domain
pub const MAX_RESULTS_PER_DOMAIN: i32 = 50;
/// Maximum message content length
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

const ALLOWED_LANGUAGES: &[&str] = &["ru", "en"];

/// Validates a template execution request
pub fn validate_execute_request(req: &ExecuteTemplateRequest) -> Result<(), ServiceError> {
    if req.query.is_empty() {
        return Err(ServiceError::validation_field("query", "query cannot be empty"));
    }
    if req.query.chars().count() > MAX_QUERY_LENGTH {
        return Err(ServiceError::validation_field(
            "query",
            "query too long (max 1000 characters)",
        ));
    }
    if !ALLOWED_LANGUAGES.contains(&req.language.as_str()) {
        return Err(ServiceError::validation_field(
            "language",
            "invalid language (must be 'ru' or 'en')",
        ));
    }

    if let Some(options) = &req.options {
        validate_execute_options(options)?;
    }
    if let Some(filters) = &req.filters {
        validate_filters(filters)?;
    }
    if let Some(context) = &req.context {
        if let Some(location) = &context.location {
            validate_location(location)?;
        }
    }

    Ok(())
}

fn validate_execute_options(options: &ExecuteOptions) -> Result<(), ServiceError> {
    if let Some(timeout_ms) = options.timeout_ms {
        if timeout_ms < 0 || timeout_ms > MAX_TIMEOUT_MS {
            return Err(ServiceError::validation_field(
                "options.timeout_ms",
                "timeout_ms must be between 0 and 120000",
            ));
        }
    }
    if let Some(max_results) = options.max_results_per_domain {
        if max_results < 0 || max_results > MAX_RESULTS_PER_DOMAIN {
            return Err(ServiceError::validation_field(
                "options.max_results_per_domain",
                "max_results_per_domain must be between 0 and 50",
            ));
        }
    }
    Ok(())
}

fn validate_filters(filters: &AdvancedFilters) -> Result<(), ServiceError> {
    if let Some(min_relevance) = filters.min_relevance {
        if !(0.0..=1.0).contains(&min_relevance) {
            return Err(ServiceError::validation_field(
                "filters.min_relevance",
                "min_relevance must be between 0 and 1",
            ));
        }
    }
    if let Some(max_results) = filters.max_results {
        if max_results < 0 {
            return Err(ServiceError::validation_field(
                "filters.max_results",
                "max_results must be non-negative",
            ));
        }
    }
    if let Some(range) = &filters.date_range {
        if let (Some(from), Some(to)) = (range.from, range.to) {
            if from > to {
                return Err(ServiceError::validation_field(
                    "filters.date_range",
                    "date_range.from must not exceed date_range.to",
                ));
            }
        }
    }
    Ok(())
}

fn validate_location(location: &Location) -> Result<(), ServiceError> {
    if !(-90.0..=90.0).contains(&location.latitude) {
        return Err(ServiceError::validation_field(
            "context.location.latitude",
            "latitude must be between -90 and 90",
        ));
    }
    if !(-180.0..=180.0).contains(&location.longitude) {
        return Err(ServiceError::validation_field(
            "context.location.longitude",
            "longitude must be between -180 and 180",
        ));
    }
    Ok(())
}

/// Validates a batch request against the size limit and per-operation rules.
/// Operation bodies are checked up front so invalid operations fail before
/// any scheduling happens.
pub fn validate_batch_request(req: &BatchRequest, max_batch_size: usize) -> Result<(), ServiceError> {
    if req.operations.is_empty() {
        return Err(ServiceError::validation_field(
            "operations",
            "batch must contain at least one operation",
        ));
    }
    if req.operations.len() > max_batch_size {
        return Err(ServiceError::validation_field(
            "operations",
            format!(
                "batch size {} exceeds maximum allowed {}",
                req.operations.len(),
                max_batch_size
            ),
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for op in &req.operations {
        if !seen.insert(op.id) {
            return Err(ServiceError::validation_field(
                "operations",
                format!("duplicate operation id {}", op.id),
            ));
        }
    }

    if let Some(options) = &req.options {
        validate_batch_options(options)?;
    }

    Ok(())
}

fn validate_batch_options(options: &BatchOptions) -> Result<(), ServiceError> {
    if let Some(max_concurrency) = options.max_concurrency {
        if max_concurrency < 1 {
            return Err(ServiceError::validation_field(
                "options.max_concurrency",
                "max_concurrency must be at least 1",
            ));
        }
    }
    Ok(())
}

/// Validates a webhook registration request
pub fn validate_register_webhook(req: &RegisterWebhookRequest) -> Result<(), ServiceError> {
    if req.url.is_empty() {
        return Err(ServiceError::validation_field("url", "webhook URL is required"));
    }
    validate_webhook_url(&req.url)?;

    if req.events.is_empty() {
        return Err(ServiceError::validation_field(
            "events",
            "at least one event must be specified",
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for event in &req.events {
        if event.is_empty() {
            return Err(ServiceError::validation_field("events", "event type cannot be empty"));
        }
        if !seen.insert(event.as_str()) {
            return Err(ServiceError::validation_field(
                "events",
                format!("duplicate event type '{}'", event),
            ));
        }
    }

    if let Some(policy) = &req.retry_policy {
        if policy.backoff_factor < 1.0 {
            return Err(ServiceError::validation_field(
                "retry_policy.backoff_factor",
                "backoff_factor must be at least 1",
            ));
        }
        if policy.initial_delay > policy.max_delay {
            return Err(ServiceError::validation_field(
                "retry_policy.initial_delay",
                "initial_delay must not exceed max_delay",
            ));
        }
    }

    Ok(())
}

/// A webhook URL must be a well-formed absolute http(s) URL with a host
pub fn validate_webhook_url(url: &str) -> Result<(), ServiceError> {
    let parsed = Url::parse(url).map_err(|e| {
        ServiceError::validation_field("url", format!("invalid URL: {}", e))
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ServiceError::validation_field(
            "url",
            "webhook URL must use http or https",
        ));
    }
    if parsed.host_str().is_none() {
        return Err(ServiceError::validation_field("url", "webhook URL has no host"));
    }
    Ok(())
}

/// Validates a conversation message
pub fn validate_send_message(req: &SendMessageRequest) -> Result<(), ServiceError> {
    if req.content.is_empty() {
        return Err(ServiceError::validation_field(
            "content",
            "message content cannot be empty",
        ));
    }
    if req.content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ServiceError::validation_field(
            "content",
            "message content too long (max 10000 characters)",
        ));
    }
    Ok(())
}

/// Validates an analytics event submission
pub fn validate_analytics_event(req: &AnalyticsEventRequest) -> Result<(), ServiceError> {
    if req.event_type.is_empty() {
        return Err(ServiceError::validation_field(
            "event_type",
            "event_type is required",
        ));
    }
    if req.event_type.len() > 128 {
        return Err(ServiceError::validation_field(
            "event_type",
            "event_type too long (max 128 characters)",
        ));
    }
    Ok(())
}
