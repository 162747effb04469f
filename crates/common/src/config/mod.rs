//! Configuration management for RiskVet services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Authentication configuration
    pub auth: AuthConfig,

    /// Evaluation lifecycle configuration
    pub evaluation: EvaluationConfig,

    /// Notification dispatch configuration
    pub notifications: NotificationConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// JWT secret for user session tokens
    pub jwt_secret: Option<String>,

    /// JWT expiration in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_secs: u64,

    /// API key header name
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Request ID header name
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EvaluationConfig {
    /// Seconds after which an in_progress evaluation with no terminal
    /// transition is swept to failed
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Maximum delivery attempts before a notification stays failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Notifications pulled per dispatch cycle
    #[serde(default = "default_dispatch_batch_size")]
    pub batch_size: u64,

    /// Seconds between dispatch cycles
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_secs: u64,

    /// Dispatch cycles between stale-evaluation sweeps
    #[serde(default = "default_sweep_every")]
    pub sweep_every_cycles: u64,

    /// Transport timeout in seconds
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_secs: u64,

    /// Seconds before an unfinished in_flight claim becomes claimable again
    #[serde(default = "default_in_flight_timeout")]
    pub in_flight_timeout_secs: u64,

    /// Email relay endpoint (HTTP API)
    pub email_relay_url: Option<String>,

    /// Channels to notify on evaluation outcome
    #[serde(default = "default_outcome_channels")]
    pub outcome_channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Global requests per second across all keys (gateway front guard)
    #[serde(default = "default_global_rps")]
    pub global_requests_per_second: u32,

    /// Global burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> u64 {
    30
}
fn default_shutdown_timeout() -> u64 {
    30
}
fn default_max_connections() -> u32 {
    50
}
fn default_min_connections() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_jwt_expiration() -> u64 {
    3600
}
fn default_api_key_header() -> String {
    "Authorization".to_string()
}
fn default_request_id_header() -> String {
    "X-Request-ID".to_string()
}
fn default_stale_timeout() -> u64 {
    3600
}
fn default_max_attempts() -> i32 {
    3
}
fn default_dispatch_batch_size() -> u64 {
    25
}
fn default_dispatch_interval() -> u64 {
    10
}
fn default_sweep_every() -> u64 {
    30
}
fn default_transport_timeout() -> u64 {
    10
}
fn default_in_flight_timeout() -> u64 {
    300
}
fn default_outcome_channels() -> Vec<String> {
    vec!["email".to_string()]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_json_logging() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_service_name() -> String {
    "riskvet".to_string()
}
fn default_global_rps() -> u32 {
    50
}
fn default_burst() -> u32 {
    100
}
fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the stale-evaluation cutoff as Duration
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation.stale_timeout_secs)
    }

    /// Get the dispatch cycle interval as Duration
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.notifications.dispatch_interval_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database
            .read_url
            .as_deref()
            .unwrap_or(&self.database.url)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                request_timeout_secs: default_request_timeout(),
                shutdown_timeout_secs: default_shutdown_timeout(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/riskvet".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            auth: AuthConfig {
                jwt_secret: None,
                jwt_expiration_secs: default_jwt_expiration(),
                api_key_header: default_api_key_header(),
                request_id_header: default_request_id_header(),
            },
            evaluation: EvaluationConfig {
                stale_timeout_secs: default_stale_timeout(),
            },
            notifications: NotificationConfig {
                max_attempts: default_max_attempts(),
                batch_size: default_dispatch_batch_size(),
                dispatch_interval_secs: default_dispatch_interval(),
                sweep_every_cycles: default_sweep_every(),
                transport_timeout_secs: default_transport_timeout(),
                in_flight_timeout_secs: default_in_flight_timeout(),
                email_relay_url: None,
                outcome_channels: default_outcome_channels(),
            },
            observability: ObservabilityConfig {
                log_level: default_log_level(),
                json_logging: default_json_logging(),
                metrics_port: default_metrics_port(),
                service_name: default_service_name(),
            },
            rate_limit: RateLimitConfig {
                global_requests_per_second: default_global_rps(),
                burst: default_burst(),
                enabled: default_enabled(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.notifications.max_attempts, 3);
        assert_eq!(config.notifications.in_flight_timeout_secs, 300);
        assert_eq!(config.evaluation.stale_timeout_secs, 3600);
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/riskvet");
    }
}
