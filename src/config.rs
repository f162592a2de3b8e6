//! # Server Configuration
//!
//! Environment-driven configuration with typed sections and sane defaults.
//! All variables use the `NEXUS_` prefix. Loaded once at boot; the rest of
//! the process reads the immutable snapshot.

use std::env;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Missing required configuration: {0}")]
    Missing(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub quota: QuotaConfig,
    pub engine: EngineConfig,
    pub batch: BatchConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub max_payload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiry_secs: i64,
    pub refresh_expiry_secs: i64,
    pub issuer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_min: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub requests_per_day: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub ranking_relevance_weight: f32,
    pub ranking_confidence_weight: f32,
    pub fallback_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8080,
                host: "0.0.0.0".to_string(),
                max_payload_bytes: 1024 * 1024,
            },
            auth: AuthConfig {
                jwt_secret: "nexus-dev-secret".to_string(),
                jwt_expiry_secs: 24 * 3600,
                refresh_expiry_secs: 7 * 24 * 3600,
                issuer: "nexus-protocol".to_string(),
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                requests_per_min: 1000,
                window_secs: 60,
            },
            quota: QuotaConfig {
                enabled: false,
                requests_per_day: 100_000,
                window_secs: 24 * 3600,
            },
            engine: EngineConfig {
                default_timeout_ms: 30_000,
                max_timeout_ms: 120_000,
                ranking_relevance_weight: 0.6,
                ranking_confidence_weight: 0.4,
                fallback_domain: "commerce".to_string(),
            },
            batch: BatchConfig {
                max_batch_size: 100,
                max_concurrency: 10,
            },
            webhook: WebhookConfig {
                request_timeout_secs: 30,
                user_agent: "Nexus-Webhook/1.0".to_string(),
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(value) => value.parse::<T>().unwrap_or_else(|_| {
            tracing::warn!(variable = %name, "Invalid value, using default");
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from `NEXUS_*` environment variables, falling
    /// back to defaults
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                port: env_parse("NEXUS_SERVER_PORT", defaults.server.port),
                host: env::var("NEXUS_SERVER_HOST").unwrap_or(defaults.server.host),
                max_payload_bytes: env_parse("NEXUS_MAX_PAYLOAD_BYTES", defaults.server.max_payload_bytes),
            },
            auth: AuthConfig {
                jwt_secret: env::var("NEXUS_JWT_SECRET").unwrap_or(defaults.auth.jwt_secret),
                jwt_expiry_secs: env_parse("NEXUS_JWT_EXPIRY_SECS", defaults.auth.jwt_expiry_secs),
                refresh_expiry_secs: env_parse("NEXUS_REFRESH_EXPIRY_SECS", defaults.auth.refresh_expiry_secs),
                issuer: defaults.auth.issuer,
            },
            rate_limit: RateLimitConfig {
                enabled: env_parse("NEXUS_RATE_LIMIT_ENABLED", defaults.rate_limit.enabled),
                requests_per_min: env_parse("NEXUS_RATE_LIMIT_RPM", defaults.rate_limit.requests_per_min),
                window_secs: defaults.rate_limit.window_secs,
            },
            quota: QuotaConfig {
                enabled: env_parse("NEXUS_QUOTA_ENABLED", defaults.quota.enabled),
                requests_per_day: env_parse("NEXUS_QUOTA_REQUESTS_PER_DAY", defaults.quota.requests_per_day),
                window_secs: defaults.quota.window_secs,
            },
            engine: EngineConfig {
                default_timeout_ms: env_parse("NEXUS_ENGINE_TIMEOUT_MS", defaults.engine.default_timeout_ms),
                max_timeout_ms: defaults.engine.max_timeout_ms,
                ranking_relevance_weight: env_parse(
                    "NEXUS_RANKING_RELEVANCE_WEIGHT",
                    defaults.engine.ranking_relevance_weight,
                ),
                ranking_confidence_weight: env_parse(
                    "NEXUS_RANKING_CONFIDENCE_WEIGHT",
                    defaults.engine.ranking_confidence_weight,
                ),
                fallback_domain: env::var("NEXUS_FALLBACK_DOMAIN").unwrap_or(defaults.engine.fallback_domain),
            },
            batch: BatchConfig {
                max_batch_size: env_parse("NEXUS_BATCH_MAX_SIZE", defaults.batch.max_batch_size),
                max_concurrency: env_parse("NEXUS_BATCH_MAX_CONCURRENCY", defaults.batch.max_concurrency),
            },
            webhook: WebhookConfig {
                request_timeout_secs: env_parse(
                    "NEXUS_WEBHOOK_TIMEOUT_SECS",
                    defaults.webhook.request_timeout_secs,
                ),
                user_agent: defaults.webhook.user_agent,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.is_empty() {
            return Err(ConfigError::Missing("NEXUS_JWT_SECRET".to_string()));
        }
        if self.batch.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "NEXUS_BATCH_MAX_CONCURRENCY".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let weight_sum = self.engine.ranking_relevance_weight + self.engine.ranking_confidence_weight;
        if !(0.0..=2.0).contains(&weight_sum) || weight_sum <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "NEXUS_RANKING_*_WEIGHT".to_string(),
                "ranking weights must sum to a positive value".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> SocketAddr {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.server.port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.rate_limit.requests_per_min, 1000);
        assert_eq!(config.batch.max_batch_size, 100);
        assert!((config.engine.ranking_relevance_weight - 0.6).abs() < f32::EPSILON);
        assert!((config.engine.ranking_confidence_weight - 0.4).abs() < f32::EPSILON);
        assert_eq!(config.auth.issuer, "nexus-protocol");
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.batch.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_address() {
        let config = Config::default();
        assert_eq!(config.bind_address().port(), 8080);
    }
}
