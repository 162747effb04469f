//! Authentication and authorization utilities
//!
//! Provides:
//! - API key hashing and validation
//! - JWT token generation and validation for user sessions
//! - Tenant context extraction

use crate::errors::{AppError, Result};
use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Extracted authentication context available to handlers
///
/// Inserted into request extensions by the gateway auth middleware after the
/// API key has been resolved and rate-limit admission has passed.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Tenant ID the credential belongs to
    pub tenant_id: Uuid,

    /// API key ID (if authenticated via API key)
    pub api_key_id: Option<Uuid>,

    /// User ID (if authenticated via JWT session)
    pub user_id: Option<Uuid>,

    /// Request ID for tracing
    pub request_id: String,
}

impl AuthContext {
    /// Reject access to a resource owned by a different tenant
    pub fn require_tenant(&self, tenant_id: Uuid) -> Result<()> {
        if self.tenant_id == tenant_id {
            Ok(())
        } else {
            Err(AppError::CrossTenantViolation {
                message: "resource belongs to a different tenant".to_string(),
            })
        }
    }
}

/// JWT claims structure for user sessions
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: String,

    /// Tenant ID
    pub tenant_id: String,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// User role
    #[serde(default)]
    pub role: String,
}

/// JWT token manager
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiration_secs: i64,
}

impl JwtManager {
    /// Create a new JWT manager with the given secret
    pub fn new(secret: &str, expiration_secs: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiration_secs: expiration_secs as i64,
        }
    }

    /// Generate a new session token
    pub fn generate_token(&self, user_id: Uuid, tenant_id: Uuid, role: &str) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.expiration_secs);

        let claims = JwtClaims {
            sub: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            role: role.to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| AppError::Internal {
            message: format!("Failed to generate token: {}", e),
        })
    }

    /// Validate and decode a session token
    pub fn validate_token(&self, token: &str) -> Result<JwtClaims> {
        decode::<JwtClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AppError::ExpiredToken,
                _ => AppError::Unauthorized {
                    message: "invalid session token".to_string(),
                },
            })
    }
}

/// Hash an API key for storage
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate an API key against a stored hash
pub fn validate_api_key(api_key: &str, stored_hash: &str) -> bool {
    hash_api_key(api_key) == stored_hash
}

/// Generate a new API key
pub fn generate_api_key() -> String {
    let random_bytes: [u8; 32] = rand::random();
    format!("rk_{}", hex::encode(random_bytes))
}

/// Extract API key from Authorization header
pub fn extract_api_key(auth_header: &str) -> Option<&str> {
    auth_header.strip_prefix("Bearer ")
}

/// Axum extractor for AuthContext (set by the gateway auth middleware)
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized {
                message: "missing authentication context".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_api_key() {
        let key = "rk_test_12345";
        let hash = hash_api_key(key);
        assert!(validate_api_key(key, &hash));
        assert!(!validate_api_key("wrong_key", &hash));
    }

    #[test]
    fn test_generate_api_key() {
        let key = generate_api_key();
        assert!(key.starts_with("rk_"));
        assert!(key.len() > 10);
    }

    #[test]
    fn test_extract_api_key() {
        assert_eq!(extract_api_key("Bearer rk_123"), Some("rk_123"));
        assert_eq!(extract_api_key("rk_123"), None);
        assert_eq!(extract_api_key("Basic abc"), None);
    }

    #[test]
    fn test_jwt_roundtrip() {
        let manager = JwtManager::new("test_secret", 3600);

        let user_id = Uuid::new_v4();
        let tenant_id = Uuid::new_v4();

        let token = manager
            .generate_token(user_id, tenant_id, "analyst")
            .unwrap();
        let claims = manager.validate_token(&token).unwrap();

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.tenant_id, tenant_id.to_string());
        assert_eq!(claims.role, "analyst");
    }

    #[test]
    fn test_require_tenant() {
        let tenant_id = Uuid::new_v4();
        let ctx = AuthContext {
            tenant_id,
            api_key_id: Some(Uuid::new_v4()),
            user_id: None,
            request_id: "req-1".to_string(),
        };
        assert!(ctx.require_tenant(tenant_id).is_ok());
        assert!(ctx.require_tenant(Uuid::new_v4()).is_err());
    }
}
