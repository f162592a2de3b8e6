//! # Error Taxonomy and Status Mapping
//!
//! Standardized error types for the Nexus Protocol server with a fixed
//! public taxonomy, HTTP status mapping and the wire error envelope.

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// A type alias for Result with the error type defaulting to our ServiceError
pub type Result<T, E = ServiceError> = std::result::Result<T, E>;

/// The public error taxonomy. Wire values are UPPER_SNAKE_CASE and each
/// kind has exactly one HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "AUTHENTICATION_ERROR")]
    Authentication,
    #[serde(rename = "AUTHORIZATION_ERROR")]
    Authorization,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "CONFLICT")]
    Conflict,
    #[serde(rename = "RATE_LIMIT_ERROR")]
    RateLimit,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
    #[serde(rename = "EXTERNAL_ERROR")]
    External,
    #[serde(rename = "PROTOCOL_VERSION_ERROR")]
    ProtocolVersion,
}

impl ErrorKind {
    /// Wire value carried as `error.type`
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Authentication => "AUTHENTICATION_ERROR",
            ErrorKind::Authorization => "AUTHORIZATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::RateLimit => "RATE_LIMIT_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
            ErrorKind::External => "EXTERNAL_ERROR",
            ErrorKind::ProtocolVersion => "PROTOCOL_VERSION_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::External => StatusCode::BAD_GATEWAY,
            ErrorKind::ProtocolVersion => StatusCode::UPGRADE_REQUIRED,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detailed error information carried inside the wire envelope.
///
/// `code` is a machine-readable UPPER_SNAKE_CASE string, `error_type` is one
/// of the taxonomy values. The deprecated `error_code`/`error_type` field
/// names of older clients are never emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    #[serde(rename = "type")]
    pub error_type: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<std::collections::HashMap<String, String>>,
}

/// Top-level error envelope: `{"error": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Core service error. Whole-request failures convert into the error
/// envelope with the status code of their kind; per-domain failures inside
/// the engine are contained as section errors instead and never reach this
/// path.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{kind}] {code}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub field: Option<String>,
    pub details: Option<String>,
    pub metadata: Option<std::collections::HashMap<String, String>>,
}

impl ServiceError {
    pub fn new<C: Into<String>, M: Into<String>>(kind: ErrorKind, code: C, message: M) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            field: None,
            details: None,
            metadata: None,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Validation, "VALIDATION_FAILED", message)
    }

    /// Per-field validation failure; populates `error.field`
    pub fn validation_field<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        let mut err = Self::validation(message);
        err.field = Some(field.into());
        err
    }

    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Authentication, "AUTHENTICATION_FAILED", message)
    }

    pub fn authorization<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Authorization, "ACCESS_DENIED", message)
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::NotFound, "NOT_FOUND", message)
    }

    pub fn conflict<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Conflict, "CONFLICT", message)
    }

    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::RateLimit, "RATE_LIMIT_EXCEEDED", message)
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Internal, "INTERNAL_ERROR", message)
    }

    pub fn external<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::External, "EXTERNAL_SERVICE_ERROR", message)
    }

    pub fn protocol_version<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::ProtocolVersion, "PROTOCOL_VERSION_MISMATCH", message)
    }

    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = code.into();
        self
    }

    pub fn details<S: Into<String>>(mut self, details: S) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn meta<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata
            .get_or_insert_with(std::collections::HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.kind.status_code()
    }

    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code.clone(),
            error_type: self.kind,
            message: self.message.clone(),
            field: self.field.clone(),
            details: self.details.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        ServiceError::internal(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::validation(format!("Invalid JSON: {}", err))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, Json(ErrorResponse { error: self.to_detail() })).into_response();

        // Retry-After accompanies every 429 so clients can back off precisely
        if self.kind == ErrorKind::RateLimit {
            let retry_after = self
                .metadata
                .as_ref()
                .and_then(|m| m.get("retry_after"))
                .cloned()
                .unwrap_or_else(|| "60".to_string());
            if let Ok(value) = retry_after.parse::<axum::http::HeaderValue>() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}
