//! Error types for RiskVet services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling
//!
//! Quota and rate-limit denials carry their own codes so callers can
//! distinguish them from validation failures and implement backoff.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,
    InvalidFormat,

    // Authentication errors (2xxx)
    Unauthorized,
    InvalidApiKey,
    ExpiredApiKey,
    ExpiredToken,

    // Authorization errors (3xxx)
    Forbidden,
    CrossTenantViolation,

    // Resource errors (4xxx)
    NotFound,

    // Conflict errors (5xxx)
    Conflict,
    InvalidTransition,
    IncompleteResult,
    AlreadyFinalized,
    InvalidState,
    ConcurrentModification,

    // Throttling (6xxx)
    RateLimited,
    QuotaExceeded,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    TransportFailure,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,
            ErrorCode::InvalidFormat => 1003,

            // Auth (2xxx)
            ErrorCode::Unauthorized => 2001,
            ErrorCode::InvalidApiKey => 2002,
            ErrorCode::ExpiredApiKey => 2003,
            ErrorCode::ExpiredToken => 2004,

            // Authz (3xxx)
            ErrorCode::Forbidden => 3001,
            ErrorCode::CrossTenantViolation => 3002,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,

            // Conflicts / state machine (5xxx)
            ErrorCode::Conflict => 5001,
            ErrorCode::InvalidTransition => 5002,
            ErrorCode::IncompleteResult => 5003,
            ErrorCode::AlreadyFinalized => 5004,
            ErrorCode::InvalidState => 5005,
            ErrorCode::ConcurrentModification => 5006,

            // Throttling (6xxx)
            ErrorCode::RateLimited => 6001,
            ErrorCode::QuotaExceeded => 6002,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // External (8xxx)
            ErrorCode::TransportFailure => 8001,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    // Authentication errors
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("API key expired")]
    ExpiredApiKey,

    #[error("Token expired")]
    ExpiredToken,

    // Authorization errors
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Cross-tenant violation: {message}")]
    CrossTenantViolation { message: String },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    // Conflict errors
    #[error("Duplicate resource: {message}")]
    Duplicate { message: String },

    // Evaluation state machine errors
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Incomplete result: {message}")]
    IncompleteResult { message: String },

    #[error("Evaluation already finalized with a different outcome")]
    AlreadyFinalized,

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Concurrent modification, re-read and retry")]
    ConcurrentModification,

    // Throttling
    #[error("Rate limit exceeded: {limit} requests per minute")]
    RateLimited { limit: u32 },

    #[error("Quota exceeded: {scope} limit of {limit} reached")]
    QuotaExceeded { scope: String, limit: i32 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // Notification transport errors (recorded, never surfaced to engine callers)
    #[error("Transport failure on {channel}: {message}")]
    TransportFailure { channel: String, message: String },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::Unauthorized { .. } => ErrorCode::Unauthorized,
            AppError::InvalidApiKey => ErrorCode::InvalidApiKey,
            AppError::ExpiredApiKey => ErrorCode::ExpiredApiKey,
            AppError::ExpiredToken => ErrorCode::ExpiredToken,
            AppError::Forbidden { .. } => ErrorCode::Forbidden,
            AppError::CrossTenantViolation { .. } => ErrorCode::CrossTenantViolation,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::Duplicate { .. } => ErrorCode::Conflict,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::IncompleteResult { .. } => ErrorCode::IncompleteResult,
            AppError::AlreadyFinalized => ErrorCode::AlreadyFinalized,
            AppError::InvalidState { .. } => ErrorCode::InvalidState,
            AppError::ConcurrentModification => ErrorCode::ConcurrentModification,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::TransportFailure { .. } => ErrorCode::TransportFailure,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::MissingField { .. }
            | AppError::InvalidFormat { .. } => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::Unauthorized { .. }
            | AppError::InvalidApiKey
            | AppError::ExpiredApiKey
            | AppError::ExpiredToken => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            AppError::Forbidden { .. } | AppError::CrossTenantViolation { .. } => {
                StatusCode::FORBIDDEN
            }

            // 404 Not Found
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::Duplicate { .. }
            | AppError::InvalidTransition { .. }
            | AppError::AlreadyFinalized
            | AppError::InvalidState { .. }
            | AppError::ConcurrentModification => StatusCode::CONFLICT,

            // 422 Unprocessable Entity
            AppError::IncompleteResult { .. } => StatusCode::UNPROCESSABLE_ENTITY,

            // 429 Too Many Requests
            AppError::RateLimited { .. } | AppError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::TransportFailure { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                details: None,
                request_id: None, // Should be filled by middleware
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::TransportFailure {
            channel: "http".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::NotFound {
            resource_type: "evaluation".into(),
            id: "test".into(),
        };
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_quota_distinguishable_from_validation() {
        let quota = AppError::QuotaExceeded {
            scope: "evaluation".into(),
            limit: 10,
        };
        let validation = AppError::Validation {
            message: "bad input".into(),
            field: None,
        };
        assert_ne!(quota.code(), validation.code());
        assert_eq!(quota.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(validation.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_transition_errors_conflict() {
        let err = AppError::InvalidTransition {
            from: "completed".into(),
            to: "pending".into(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(err.is_client_error());

        assert_eq!(
            AppError::AlreadyFinalized.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::ConcurrentModification.status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_server_error() {
        let err = AppError::Internal {
            message: "Something went wrong".into(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_server_error());
    }
}
