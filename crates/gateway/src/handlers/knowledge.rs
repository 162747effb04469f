//! Shared knowledge base handlers
//!
//! RAG reference documents are tenant-independent: every tenant's
//! evaluations consult the same regulatory corpus, so these endpoints only
//! require a valid key, not tenant scoping.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use riskvet_common::{
    auth::AuthContext,
    db::models::RagDocument,
    errors::{AppError, Result},
};

#[derive(Debug, Deserialize, Validate)]
pub struct UpsertRagDocumentRequest {
    #[validate(length(min = 1, max = 500))]
    pub name: String,

    #[validate(length(min = 1, max = 100))]
    pub category: String,

    pub chunk_count: i32,

    pub version: i32,
}

#[derive(Serialize)]
pub struct RagDocumentResponse {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub chunk_count: i32,
    pub version: i32,
    pub updated_at: String,
}

impl From<RagDocument> for RagDocumentResponse {
    fn from(d: RagDocument) -> Self {
        Self {
            id: d.id,
            name: d.name,
            category: d.category,
            chunk_count: d.chunk_count,
            version: d.version,
            updated_at: d.updated_at.to_rfc3339(),
        }
    }
}

/// List the shared knowledge base entries
pub async fn list_rag_documents(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<Vec<RagDocumentResponse>>> {
    let documents = state.store.list_rag_documents().await?;
    Ok(Json(documents.into_iter().map(Into::into).collect()))
}

/// Insert or update a knowledge base entry by name
pub async fn upsert_rag_document(
    State(state): State<AppState>,
    _auth: AuthContext,
    Json(request): Json<UpsertRagDocumentRequest>,
) -> Result<(StatusCode, Json<RagDocumentResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let document = state
        .store
        .upsert_rag_document(
            request.name,
            request.category,
            request.chunk_count,
            request.version,
        )
        .await?;

    Ok((StatusCode::OK, Json(document.into())))
}
