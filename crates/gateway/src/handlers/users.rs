//! User and API key handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use riskvet_common::{
    auth::{self, AuthContext},
    db::models::{User, UserRole},
    errors::{AppError, Result},
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(email)]
    pub email: String,

    #[validate(length(min = 1, max = 200))]
    pub full_name: String,

    pub role: UserRole,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateApiKeyRequest {
    #[validate(length(min = 1, max = 200))]
    pub label: String,

    pub rate_limit_per_minute: i32,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub full_name: String,
    pub role: String,
    pub is_active: bool,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            email: u.email,
            full_name: u.full_name,
            role: u.role,
            is_active: u.is_active,
            created_at: u.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: Uuid,
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub token: String,
    pub expires_in_secs: u64,
}

/// Response when creating an API key; the plaintext key appears exactly once
#[derive(Serialize)]
pub struct CreateApiKeyResponse {
    pub id: Uuid,
    pub label: String,
    pub api_key: String,
    pub rate_limit_per_minute: i32,
    pub expires_at: Option<String>,
}

/// Create a user in the caller's tenant, subject to the max_users quota
pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let user = state
        .store
        .create_user(
            auth.tenant_id,
            request.email,
            request.full_name,
            request.role,
        )
        .await?;

    tracing::info!(
        user_id = %user.id,
        tenant_id = %auth.tenant_id,
        "User created"
    );

    Ok((StatusCode::CREATED, Json(user.into())))
}

/// Get a user by ID
pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<UserResponse>> {
    let user = state
        .store
        .find_user(id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "user".to_string(),
            id: id.to_string(),
        })?;

    auth.require_tenant(user.tenant_id)?;
    Ok(Json(user.into()))
}

/// Issue a JWT session token for an active user in the caller's tenant
pub async fn create_session(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>)> {
    let jwt = state.jwt.as_ref().ok_or_else(|| AppError::Unauthorized {
        message: "session tokens are not enabled".to_string(),
    })?;

    let user = state
        .store
        .find_user(request.user_id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "user".to_string(),
            id: request.user_id.to_string(),
        })?;

    auth.require_tenant(user.tenant_id)?;

    if !user.is_active {
        return Err(AppError::InvalidState {
            message: "cannot issue a session for a deactivated user".to_string(),
        });
    }

    let token = jwt.generate_token(user.id, user.tenant_id, &user.role)?;

    tracing::info!(user_id = %user.id, tenant_id = %user.tenant_id, "Session issued");

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            token,
            expires_in_secs: state.config.auth.jwt_expiration_secs,
        }),
    ))
}

/// Mint a new API key for the caller's tenant.
///
/// Only the SHA-256 hash is stored; the plaintext key in the response cannot
/// be recovered later.
pub async fn create_api_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<CreateApiKeyResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let plaintext = auth::generate_api_key();
    let key = state
        .store
        .create_api_key(
            auth.tenant_id,
            auth::hash_api_key(&plaintext),
            request.label,
            request.rate_limit_per_minute,
            request.expires_at,
        )
        .await?;

    tracing::info!(
        api_key_id = %key.id,
        tenant_id = %auth.tenant_id,
        label = %key.label,
        "API key created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            id: key.id,
            label: key.label,
            api_key: plaintext,
            rate_limit_per_minute: key.rate_limit_per_minute,
            expires_at: key.expires_at.map(|dt| dt.to_rfc3339()),
        }),
    ))
}
