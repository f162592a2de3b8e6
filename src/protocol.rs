//! # Protocol Envelope and Version Gate
//!
//! Request/response metadata, semver and UUID v4 validation, and the
//! protocol compatibility rule: client and server major must match and the
//! client minor must not exceed the server minor. Prerelease and build
//! metadata are ignored.

use std::collections::HashMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServiceError;

/// Protocol version spoken by this server
pub const PROTOCOL_VERSION: &str = "1.1.0";
/// Server build version
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

static VERSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(-[a-zA-Z0-9.-]+)?(\+[a-zA-Z0-9.-]+)?$").expect("version regex")
});

static UUID_V4_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("uuid regex")
});

/// Metadata attached by the client to every request. The server never
/// mutates it except to echo `request_id` back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestMetadata {
    pub request_id: String,
    pub protocol_version: String,
    pub client_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_headers: Option<HashMap<String, String>>,
}

impl RequestMetadata {
    /// Server-synthesised metadata for requests that omit it
    pub fn synthesize() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_version: SERVER_VERSION.to_string(),
            client_id: None,
            client_type: None,
            timestamp: Utc::now().timestamp(),
            custom_headers: None,
        }
    }
}

/// Rate limiting annotation on responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitInfo {
    pub limit: i32,
    pub remaining: i32,
    pub reset_at: i64,
}

/// Cache annotation on responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheInfo {
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<i32>,
}

/// Quota annotation on responses; its presence distinguishes quota
/// exhaustion from plain rate limiting on a 429
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaInfo {
    pub quota_used: i64,
    pub quota_limit: i64,
    pub quota_type: QuotaType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    Requests,
    Data,
    Storage,
    Bandwidth,
}

/// Metadata the server attaches to every response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub protocol_version: String,
    pub server_version: String,
    pub timestamp: i64,
    pub processing_time_ms: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_info: Option<RateLimitInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_info: Option<CacheInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_info: Option<QuotaInfo>,
}

impl ResponseMetadata {
    /// Fresh response metadata echoing the given request id. Processing
    /// time is a placeholder until envelope finalisation.
    pub fn for_request(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            server_version: SERVER_VERSION.to_string(),
            timestamp: Utc::now().timestamp(),
            processing_time_ms: 0,
            rate_limit_info: None,
            cache_info: None,
            quota_info: None,
        }
    }
}

/// Validates a semver string: MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]
pub fn validate_version(version: &str) -> Result<(), ServiceError> {
    if version.is_empty() {
        return Err(ServiceError::validation("version cannot be empty"));
    }
    if !VERSION_PATTERN.is_match(version) {
        return Err(ServiceError::validation(format!(
            "invalid version format: {} (expected MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD])",
            version
        )));
    }
    Ok(())
}

/// Validates a UUID v4 string
pub fn validate_uuid(value: &str) -> Result<(), ServiceError> {
    if value.is_empty() {
        return Err(ServiceError::validation("UUID cannot be empty"));
    }
    if !UUID_V4_PATTERN.is_match(&value.to_lowercase()) {
        return Err(ServiceError::validation(format!(
            "invalid UUID format: {} (expected UUID v4)",
            value
        )));
    }
    Ok(())
}

fn parse_major_minor(version: &str) -> Result<(u64, u64), ServiceError> {
    // Strip build metadata, then prerelease
    let core = version.split('+').next().unwrap_or(version);
    let core = core.split('-').next().unwrap_or(core);
    let mut parts = core.split('.');

    let major = parts
        .next()
        .and_then(|p| p.parse::<u64>().ok())
        .ok_or_else(|| ServiceError::validation(format!("invalid major version in {}", version)))?;
    let minor = parts
        .next()
        .and_then(|p| p.parse::<u64>().ok())
        .ok_or_else(|| ServiceError::validation(format!("invalid minor version in {}", version)))?;

    Ok((major, minor))
}

/// Protocol compatibility: majors equal and client minor <= server minor.
/// Patch, prerelease and build metadata never affect the outcome.
pub fn is_compatible(client_version: &str, server_version: &str) -> Result<bool, ServiceError> {
    validate_version(client_version)?;
    validate_version(server_version)?;

    let (client_major, client_minor) = parse_major_minor(client_version)?;
    let (server_major, server_minor) = parse_major_minor(server_version)?;

    Ok(client_major == server_major && client_minor <= server_minor)
}

/// Validates request metadata and enforces protocol compatibility against
/// this server. Returns the fresh response metadata on success.
pub fn validate_request_metadata(metadata: &RequestMetadata) -> Result<ResponseMetadata, ServiceError> {
    validate_uuid(&metadata.request_id)
        .map_err(|e| ServiceError::validation_field("metadata.request_id", e.message))?;
    validate_version(&metadata.protocol_version)
        .map_err(|e| ServiceError::validation_field("metadata.protocol_version", e.message))?;
    validate_version(&metadata.client_version)
        .map_err(|e| ServiceError::validation_field("metadata.client_version", e.message))?;
    if metadata.timestamp <= 0 {
        return Err(ServiceError::validation_field(
            "metadata.timestamp",
            "timestamp must be positive",
        ));
    }

    if !is_compatible(&metadata.protocol_version, PROTOCOL_VERSION)? {
        return Err(ServiceError::protocol_version(format!(
            "client protocol version {} is not compatible with server protocol version {}",
            metadata.protocol_version, PROTOCOL_VERSION
        )));
    }

    Ok(ResponseMetadata::for_request(&metadata.request_id))
}
