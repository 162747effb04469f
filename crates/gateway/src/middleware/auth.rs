//! Authentication middleware
//!
//! Accepts two bearer credential forms: API keys (`rk_` prefix) resolved to a
//! key row with fail-closed usability checks and the per-key fixed-window
//! rate limit, and JWT session tokens for human users. Either path stashes an
//! `AuthContext` in request extensions for handlers to extract.

use crate::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use riskvet_common::{
    auth::{extract_api_key, hash_api_key, AuthContext},
    errors::AppError,
};
use uuid::Uuid;

pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized {
            message: "missing Authorization header".to_string(),
        })?;

    let credential = extract_api_key(header).ok_or_else(|| AppError::Unauthorized {
        message: "expected 'Bearer <credential>'".to_string(),
    })?;

    let context = if credential.starts_with("rk_") {
        authenticate_api_key(&state, credential).await?
    } else {
        authenticate_session(&state, credential).await?
    };

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    request.extensions_mut().insert(AuthContext {
        request_id,
        ..context
    });

    Ok(next.run(request).await)
}

async fn authenticate_api_key(state: &AppState, api_key: &str) -> Result<AuthContext, AppError> {
    let key = state
        .store
        .find_api_key_by_hash(&hash_api_key(api_key))
        .await?
        .ok_or(AppError::InvalidApiKey)?;

    // Fail-closed usability checks and the window quota in one step
    if let Err(e) = state.key_limiter.admit(&key, Utc::now()) {
        if matches!(e, AppError::RateLimited { .. }) {
            metrics::counter!("riskvet_rate_limited_total").increment(1);
        }
        return Err(e);
    }

    Ok(AuthContext {
        tenant_id: key.tenant_id,
        api_key_id: Some(key.id),
        user_id: None,
        request_id: String::new(),
    })
}

async fn authenticate_session(state: &AppState, token: &str) -> Result<AuthContext, AppError> {
    let jwt = state.jwt.as_ref().ok_or_else(|| AppError::Unauthorized {
        message: "session tokens are not enabled".to_string(),
    })?;

    let claims = jwt.validate_token(token)?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized {
        message: "invalid session token".to_string(),
    })?;

    // Deactivated users lose access even while their token is still valid
    let user = state
        .store
        .find_user(user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or_else(|| AppError::Unauthorized {
            message: "user is not active".to_string(),
        })?;

    Ok(AuthContext {
        tenant_id: user.tenant_id,
        api_key_id: None,
        user_id: Some(user.id),
        request_id: String::new(),
    })
}
