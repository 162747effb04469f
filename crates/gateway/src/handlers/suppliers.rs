//! Supplier and document handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use riskvet_common::{
    auth::AuthContext,
    db::models::{Document, Supplier},
    errors::{AppError, Result},
    store::NewDocument,
};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSupplierRequest {
    #[validate(length(min = 1, max = 500))]
    pub name: String,

    #[validate(length(min = 2, max = 2))]
    pub country: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AttachDocumentRequest {
    #[serde(default)]
    pub evaluation_id: Option<Uuid>,

    #[validate(length(min = 1, max = 100))]
    pub doc_type: String,

    #[validate(length(min = 1, max = 2000))]
    pub file_ref: String,

    pub size_bytes: i64,

    #[serde(default)]
    pub extracted_data: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct SupplierResponse {
    pub id: Uuid,
    pub name: String,
    pub country: String,
    pub status: String,
    pub risk_level: Option<String>,
    pub last_evaluated_at: Option<String>,
    pub created_at: String,
}

impl From<Supplier> for SupplierResponse {
    fn from(s: Supplier) -> Self {
        Self {
            id: s.id,
            name: s.name,
            country: s.country,
            status: s.status,
            risk_level: s.risk_level,
            last_evaluated_at: s.last_evaluated_at.map(|dt| dt.to_rfc3339()),
            created_at: s.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub supplier_id: Uuid,
    pub evaluation_id: Option<Uuid>,
    pub doc_type: String,
    pub file_ref: String,
    pub size_bytes: i64,
    pub created_at: String,
}

impl From<Document> for DocumentResponse {
    fn from(d: Document) -> Self {
        Self {
            id: d.id,
            supplier_id: d.supplier_id,
            evaluation_id: d.evaluation_id,
            doc_type: d.doc_type,
            file_ref: d.file_ref,
            size_bytes: d.size_bytes,
            created_at: d.created_at.to_rfc3339(),
        }
    }
}

async fn load_scoped(state: &AppState, auth: &AuthContext, id: Uuid) -> Result<Supplier> {
    let supplier = state
        .store
        .find_supplier(id)
        .await?
        .ok_or_else(|| AppError::NotFound {
            resource_type: "supplier".to_string(),
            id: id.to_string(),
        })?;

    auth.require_tenant(supplier.tenant_id)?;
    Ok(supplier)
}

/// Register a new supplier for the caller's tenant
pub async fn create_supplier(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<CreateSupplierRequest>,
) -> Result<(StatusCode, Json<SupplierResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let supplier = state
        .store
        .create_supplier(auth.tenant_id, request.name, request.country)
        .await?;

    tracing::info!(
        supplier_id = %supplier.id,
        tenant_id = %auth.tenant_id,
        "Supplier registered"
    );

    Ok((StatusCode::CREATED, Json(supplier.into())))
}

/// List the caller's suppliers
pub async fn list_suppliers(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Vec<SupplierResponse>>> {
    let suppliers = state.store.list_suppliers(auth.tenant_id).await?;
    Ok(Json(suppliers.into_iter().map(Into::into).collect()))
}

/// Get a supplier by ID
pub async fn get_supplier(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<SupplierResponse>> {
    let supplier = load_scoped(&state, &auth, id).await?;
    Ok(Json(supplier.into()))
}

/// Attach a document reference to a supplier
pub async fn attach_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(request): Json<AttachDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentResponse>)> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    if request.size_bytes < 0 {
        return Err(AppError::Validation {
            message: "size_bytes must be non-negative".to_string(),
            field: Some("size_bytes".to_string()),
        });
    }

    load_scoped(&state, &auth, id).await?;

    let document = state
        .store
        .attach_document(NewDocument {
            supplier_id: id,
            evaluation_id: request.evaluation_id,
            doc_type: request.doc_type,
            file_ref: request.file_ref,
            size_bytes: request.size_bytes,
            extracted_data: request.extracted_data,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(document.into())))
}

/// List documents attached to a supplier
pub async fn list_documents(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DocumentResponse>>> {
    load_scoped(&state, &auth, id).await?;

    let documents = state.store.list_documents_for_supplier(id).await?;
    Ok(Json(documents.into_iter().map(Into::into).collect()))
}
