//! Tenant administration handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use riskvet_common::{
    auth::AuthContext,
    db::models::Tenant,
    errors::{AppError, Result},
    quota,
};

#[derive(Serialize)]
pub struct TenantResponse {
    pub id: Uuid,
    pub name: String,
    pub tier: String,
    pub max_users: i32,
    pub max_evaluations_per_month: i32,
    pub evaluations_this_month: u64,
    pub active_users: u64,
    pub is_active: bool,
    pub created_at: String,
}

/// Get the caller's tenant with current quota usage
pub async fn get_tenant(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<TenantResponse>> {
    auth.require_tenant(id)?;

    let tenant: Tenant = state
        .store
        .find_tenant(id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "tenant".to_string(),
            id: id.to_string(),
        })?;

    let month_start = quota::month_start(chrono::Utc::now());
    let evaluations_this_month = state
        .store
        .count_monthly_evaluations(id, month_start)
        .await?;
    let active_users = state.store.count_active_users(id).await?;

    Ok(Json(TenantResponse {
        id: tenant.id,
        name: tenant.name,
        tier: tenant.tier,
        max_users: tenant.max_users,
        max_evaluations_per_month: tenant.max_evaluations_per_month,
        evaluations_this_month,
        active_users,
        is_active: tenant.is_active,
        created_at: tenant.created_at.to_rfc3339(),
    }))
}

/// Delete the caller's tenant and all rows it owns
pub async fn delete_tenant(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    auth.require_tenant(id)?;

    state.store.delete_tenant(id).await?;

    tracing::info!(tenant_id = %id, "Tenant deleted");

    Ok(StatusCode::NO_CONTENT)
}
