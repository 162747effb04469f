//! Evaluation lifecycle handlers
//!
//! Workers drive the state machine through `/start`, `/complete`, `/fail`,
//! and `/usage`. Conflicting writes surface as 409s with distinct codes so
//! callers can tell a lost race (`CONCURRENT_MODIFICATION`) from a replayed
//! terminal event (`ALREADY_FINALIZED`).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use riskvet_common::{
    auth::AuthContext,
    db::models::{Evaluation, Notification},
    engine::CompletionOutcome,
    errors::{AppError, Result},
};

/// Request to create a new evaluation
#[derive(Debug, Deserialize)]
pub struct CreateEvaluationRequest {
    pub supplier_id: Uuid,
    pub user_id: Uuid,
}

/// Completion payload reported by the evaluation worker
#[derive(Debug, Deserialize, Validate)]
pub struct CompleteRequest {
    #[validate(length(min = 1, max = 32))]
    pub risk_level: String,

    pub confidence_score: Decimal,

    #[validate(length(min = 1, max = 50000))]
    pub reasoning: String,

    #[serde(default)]
    pub recommended_actions: Option<serde_json::Value>,

    pub agent_outputs: serde_json::Value,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FailRequest {
    #[validate(length(min = 1, max = 10000))]
    pub error_message: String,
}

#[derive(Debug, Deserialize)]
pub struct UsageRequest {
    pub api_calls: i32,
    pub cost_delta: Decimal,
}

#[derive(Serialize)]
pub struct EvaluationResponse {
    pub id: Uuid,
    pub supplier_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub risk_level: Option<String>,
    pub confidence_score: Option<Decimal>,
    pub reasoning: Option<String>,
    pub recommended_actions: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub api_call_count: i32,
    pub cost: Decimal,
    pub version: i32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl From<Evaluation> for EvaluationResponse {
    fn from(e: Evaluation) -> Self {
        Self {
            id: e.id,
            supplier_id: e.supplier_id,
            user_id: e.user_id,
            status: e.status,
            risk_level: e.risk_level,
            confidence_score: e.confidence_score,
            reasoning: e.reasoning,
            recommended_actions: e.recommended_actions,
            error_message: e.error_message,
            api_call_count: e.api_call_count,
            cost: e.cost,
            version: e.version,
            created_at: e.created_at.to_rfc3339(),
            started_at: e.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: e.completed_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

#[derive(Serialize)]
pub struct NotificationResponse {
    pub id: Uuid,
    pub channel: String,
    pub recipient: String,
    pub subject: String,
    pub status: String,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub sent_at: Option<String>,
}

impl From<Notification> for NotificationResponse {
    fn from(n: Notification) -> Self {
        Self {
            id: n.id,
            channel: n.channel,
            recipient: n.recipient,
            subject: n.subject,
            status: n.status,
            attempt_count: n.attempt_count,
            last_error: n.last_error,
            sent_at: n.sent_at.map(|dt| dt.to_rfc3339()),
        }
    }
}

/// Load an evaluation and verify it belongs to the caller's tenant
async fn load_scoped(state: &AppState, auth: &AuthContext, id: Uuid) -> Result<Evaluation> {
    let evaluation = state
        .store
        .find_evaluation(id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "evaluation".to_string(),
            id: id.to_string(),
        })?;

    auth.require_tenant(evaluation.tenant_id)?;
    Ok(evaluation)
}

/// Create a new evaluation in pending
pub async fn create_evaluation(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<CreateEvaluationRequest>,
) -> Result<(StatusCode, Json<EvaluationResponse>)> {
    let evaluation = state
        .engine
        .create(request.supplier_id, request.user_id, auth.tenant_id)
        .await?;

    metrics::counter!("riskvet_evaluations_created_total").increment(1);

    Ok((StatusCode::CREATED, Json(evaluation.into())))
}

/// Get an evaluation by ID
pub async fn get_evaluation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<EvaluationResponse>> {
    let evaluation = load_scoped(&state, &auth, id).await?;
    Ok(Json(evaluation.into()))
}

/// Move a pending evaluation to in_progress
pub async fn start_evaluation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<EvaluationResponse>> {
    load_scoped(&state, &auth, id).await?;

    let evaluation = state.engine.start(id).await?;
    Ok(Json(evaluation.into()))
}

/// Finalize an evaluation as completed
pub async fn complete_evaluation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<EvaluationResponse>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    load_scoped(&state, &auth, id).await?;

    let evaluation = state
        .engine
        .complete(
            id,
            CompletionOutcome {
                risk_level: request.risk_level,
                confidence_score: request.confidence_score,
                reasoning: request.reasoning,
                recommended_actions: request.recommended_actions,
                agent_outputs: request.agent_outputs,
            },
        )
        .await?;

    metrics::counter!("riskvet_evaluations_completed_total").increment(1);

    Ok(Json(evaluation.into()))
}

/// Finalize an evaluation as failed
pub async fn fail_evaluation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(request): Json<FailRequest>,
) -> Result<Json<EvaluationResponse>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    load_scoped(&state, &auth, id).await?;

    let evaluation = state.engine.fail(id, request.error_message).await?;

    metrics::counter!("riskvet_evaluations_failed_total").increment(1);

    Ok(Json(evaluation.into()))
}

/// Accumulate API call and cost counters for a running evaluation
pub async fn record_usage(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(request): Json<UsageRequest>,
) -> Result<Json<EvaluationResponse>> {
    load_scoped(&state, &auth, id).await?;

    let evaluation = state
        .engine
        .record_usage(id, request.api_calls, request.cost_delta)
        .await?;

    Ok(Json(evaluation.into()))
}

/// List outcome notifications for an evaluation
pub async fn list_notifications(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<NotificationResponse>>> {
    load_scoped(&state, &auth, id).await?;

    let rows = state.store.list_notifications_for_evaluation(id).await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// List the tenant's notifications that exhausted their retry budget
pub async fn list_failed_notifications(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Vec<NotificationResponse>>> {
    let rows = state
        .store
        .list_permanently_failed(auth.tenant_id, state.config.notifications.max_attempts)
        .await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// Delete an evaluation: notifications go with it, documents are detached
pub async fn delete_evaluation(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    load_scoped(&state, &auth, id).await?;

    state.store.delete_evaluation(id).await?;

    tracing::info!(
        evaluation_id = %id,
        tenant_id = %auth.tenant_id,
        "Evaluation deleted"
    );

    Ok(StatusCode::NO_CONTENT)
}
