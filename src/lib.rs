//! # Nexus Protocol Server
//!
//! Multi-tenant request-dispatch service: classifies a natural-language
//! query, fans it out to domain executors, ranks the merged results and
//! returns a single envelope. Batched execution, signed webhooks, rate
//! limiting, protocol-version negotiation and a conversation store sit
//! around the core.

pub mod analytics;
pub mod api;
pub mod auth;
pub mod auth_middleware;
pub mod batch;
pub mod classifier;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod types;
pub mod validation;
pub mod webhook;

pub use api::{router, AppState};
pub use config::Config;
pub use error::{ErrorKind, Result, ServiceError};
