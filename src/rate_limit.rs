//! # Rate-Limit and Quota Gate
//!
//! Fixed-window request counting keyed by client identity: the
//! authenticated user id when present, the network address otherwise. The
//! counter lives behind the `CounterStore` seam; the in-memory store ships
//! with the server and an external counter store plugs in at deployment.
//! Quota is a second, long-window counter on the same seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{QuotaConfig, RateLimitConfig};
use crate::error::ServiceError;
use crate::protocol::{QuotaInfo, QuotaType, RateLimitInfo};

/// Atomic increment-with-TTL counter storage
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments the counter for `key`, starting the window on first hit.
    /// Returns the updated count and the remaining window in seconds.
    async fn increment(&self, key: &str, window: Duration) -> (u64, u64);
}

/// In-memory fixed-window counters
pub struct MemoryCounterStore {
    counters: RwLock<HashMap<String, (u64, Instant)>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self { counters: RwLock::new(HashMap::new()) }
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> (u64, u64) {
        let mut counters = self.counters.write().await;
        let now = Instant::now();

        let entry = counters.entry(key.to_string()).or_insert((0, now));
        if now.duration_since(entry.1) >= window {
            *entry = (0, now);
        }
        entry.0 += 1;

        let elapsed = now.duration_since(entry.1);
        let remaining_secs = window.saturating_sub(elapsed).as_secs().max(1);
        (entry.0, remaining_secs)
    }
}

/// Outcome of one gate check, carried into the response
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub rate_limit_info: RateLimitInfo,
    pub quota_info: Option<QuotaInfo>,
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    quota: QuotaConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig, quota: QuotaConfig) -> Self {
        Self { store, config, quota }
    }

    /// Increments both windows for the identity and rejects with 429 when
    /// either is exhausted. Quota rejections carry `quota_*` metadata so
    /// callers can tell them apart from plain rate limiting.
    pub async fn check(&self, identity: &str) -> Result<GateDecision, ServiceError> {
        if !self.config.enabled {
            return Ok(GateDecision {
                rate_limit_info: RateLimitInfo {
                    limit: self.config.requests_per_min as i32,
                    remaining: self.config.requests_per_min as i32,
                    reset_at: Utc::now().timestamp() + self.config.window_secs as i64,
                },
                quota_info: None,
            });
        }

        let window = Duration::from_secs(self.config.window_secs);
        let key = format!("rate_limit:{}", identity);
        let (count, ttl_secs) = self.store.increment(&key, window).await;

        let limit = self.config.requests_per_min as u64;
        let reset_at = Utc::now().timestamp() + ttl_secs as i64;

        if count > limit {
            debug!(identity = %identity, count = %count, limit = %limit, "Rate limit exceeded");
            return Err(ServiceError::rate_limited("Rate limit exceeded")
                .meta("retry_after", ttl_secs.to_string())
                .meta("limit", limit.to_string())
                .meta("reset_at", reset_at.to_string()));
        }

        let mut quota_info = None;
        if self.quota.enabled {
            let quota_window = Duration::from_secs(self.quota.window_secs);
            let quota_key = format!("quota:requests:{}", identity);
            let (used, quota_ttl) = self.store.increment(&quota_key, quota_window).await;

            if used > self.quota.requests_per_day {
                debug!(identity = %identity, used = %used, "Request quota exhausted");
                return Err(ServiceError::rate_limited("Request quota exhausted")
                    .code("QUOTA_EXCEEDED")
                    .meta("retry_after", quota_ttl.to_string())
                    .meta("quota_used", used.to_string())
                    .meta("quota_limit", self.quota.requests_per_day.to_string())
                    .meta("quota_type", "requests"));
            }

            quota_info = Some(QuotaInfo {
                quota_used: used as i64,
                quota_limit: self.quota.requests_per_day as i64,
                quota_type: QuotaType::Requests,
            });
        }

        Ok(GateDecision {
            rate_limit_info: RateLimitInfo {
                limit: limit as i32,
                remaining: (limit - count) as i32,
                reset_at,
            },
            quota_info,
        })
    }
}
