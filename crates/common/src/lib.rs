//! RiskVet Common Library
//!
//! Shared code for the RiskVet services including:
//! - Database models and storage backends
//! - Evaluation lifecycle engine
//! - Quota gate and per-key rate limiting
//! - Notification delivery queue
//! - Error types and handling
//! - Configuration management
//! - Authentication utilities
//! - Metrics and observability

pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod notify;
pub mod quota;
pub mod ratelimit;
pub mod store;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::PgStore;
pub use engine::{CompletionOutcome, EvaluationEngine};
pub use errors::{AppError, Result};
pub use notify::Dispatcher;
pub use ratelimit::KeyRateLimiter;
pub use store::{MemStore, Store};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
