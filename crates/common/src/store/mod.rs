//! Storage abstraction for the evaluation lifecycle
//!
//! `Store` is the seam between domain logic (engine, quota gate, dispatcher)
//! and persistence. Two backends exist:
//! - [`crate::db::PgStore`]: SeaORM over Postgres, the production path
//! - [`MemStore`]: mutex-guarded in-memory backend for tests and local runs
//!
//! Multi-entity operations (create with quota check, terminal transition with
//! supplier update, cleanup routines) are atomic within one backend call: a
//! database transaction in Postgres, a single lock scope in memory.

mod memory;

pub use memory::MemStore;

use crate::db::models::*;
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Fields applied by a validated lifecycle transition
///
/// Built by the Evaluation Engine after state-machine validation; the store
/// applies it mechanically under an optimistic version check. When
/// `supplier_risk` is set, the supplier row is updated in the same
/// transaction as the evaluation.
#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub status: Option<EvaluationStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub risk_level: Option<String>,
    pub confidence_score: Option<Decimal>,
    pub reasoning: Option<String>,
    pub recommended_actions: Option<serde_json::Value>,
    pub agent_outputs: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub supplier_risk: Option<RiskLevel>,
}

/// Parameters for a new notification row
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub evaluation_id: Option<Uuid>,
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    /// When set, enqueueing the same key again returns the existing row
    pub dedupe_key: Option<String>,
}

/// Parameters for a new document reference
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub supplier_id: Uuid,
    pub evaluation_id: Option<Uuid>,
    pub doc_type: String,
    pub file_ref: String,
    pub size_bytes: i64,
    pub extracted_data: Option<serde_json::Value>,
}

/// Delivery outcome reported back by a dispatch cycle
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Sent,
    Failed { error: String },
}

/// Data access operations shared by all backends
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn ping(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Tenants
    // ------------------------------------------------------------------

    /// Create a tenant; name is unique across the system
    async fn create_tenant(
        &self,
        name: String,
        tier: TenantTier,
        max_users: i32,
        max_evaluations_per_month: i32,
    ) -> Result<Tenant>;

    async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>>;

    /// Ordered cleanup: notifications -> documents (detach) -> evaluations ->
    /// suppliers -> api keys -> users -> tenant, in one transaction
    async fn delete_tenant(&self, id: Uuid) -> Result<()>;

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    /// Create a user; enforces the tenant's max_users quota and global email
    /// uniqueness inside the same transaction
    async fn create_user(
        &self,
        tenant_id: Uuid,
        email: String,
        full_name: String,
        role: UserRole,
    ) -> Result<User>;

    async fn find_user(&self, id: Uuid) -> Result<Option<User>>;

    async fn count_active_users(&self, tenant_id: Uuid) -> Result<u64>;

    // ------------------------------------------------------------------
    // Suppliers
    // ------------------------------------------------------------------

    /// Create a supplier; (tenant_id, name, country) is unique
    async fn create_supplier(
        &self,
        tenant_id: Uuid,
        name: String,
        country: String,
    ) -> Result<Supplier>;

    async fn find_supplier(&self, id: Uuid) -> Result<Option<Supplier>>;

    async fn list_suppliers(&self, tenant_id: Uuid) -> Result<Vec<Supplier>>;

    // ------------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------------

    async fn create_api_key(
        &self,
        tenant_id: Uuid,
        key_hash: String,
        label: String,
        rate_limit_per_minute: i32,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey>;

    async fn find_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>>;

    // ------------------------------------------------------------------
    // Evaluations
    // ------------------------------------------------------------------

    /// Create an evaluation in `pending`. Cross-tenant validation and the
    /// monthly quota check run inside the same transaction as the insert.
    async fn create_evaluation(
        &self,
        supplier_id: Uuid,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Evaluation>;

    async fn find_evaluation(&self, id: Uuid) -> Result<Option<Evaluation>>;

    /// Apply a validated transition under an optimistic version check;
    /// fails with `ConcurrentModification` when the version moved
    async fn apply_transition(
        &self,
        id: Uuid,
        expected_version: i32,
        update: TransitionUpdate,
    ) -> Result<Evaluation>;

    /// Monotonically increase usage counters; fails with `InvalidState`
    /// once the evaluation is terminal
    async fn add_usage(&self, id: Uuid, api_calls: i32, cost_delta: Decimal)
        -> Result<Evaluation>;

    /// Count evaluations created since `month_start` that are not failed
    async fn count_monthly_evaluations(
        &self,
        tenant_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> Result<u64>;

    /// Fail in_progress evaluations started before `cutoff`; returns the
    /// swept rows so the caller can emit their outcome events
    async fn fail_stale_in_progress(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
    ) -> Result<Vec<Evaluation>>;

    /// Delete an evaluation: its notifications are deleted and its documents
    /// detached, in one transaction
    async fn delete_evaluation(&self, id: Uuid) -> Result<()>;

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Attach a document reference; the optional evaluation link must point
    /// at an evaluation on the same supplier
    async fn attach_document(&self, doc: NewDocument) -> Result<Document>;

    async fn list_documents_for_supplier(&self, supplier_id: Uuid) -> Result<Vec<Document>>;

    // ------------------------------------------------------------------
    // Shared knowledge base
    // ------------------------------------------------------------------

    /// Insert or update a knowledge-base entry by unique name
    async fn upsert_rag_document(
        &self,
        name: String,
        category: String,
        chunk_count: i32,
        version: i32,
    ) -> Result<RagDocument>;

    async fn list_rag_documents(&self) -> Result<Vec<RagDocument>>;

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Append a pending notification row; idempotent on dedupe_key
    async fn enqueue_notification(&self, new: NewNotification) -> Result<Notification>;

    /// Claim up to `batch` deliverable rows via status compare-and-set
    /// (pending or retryable-failed -> in_flight), bumping attempt_count.
    /// A row claimed by one cycle is invisible to concurrent cycles, except
    /// that an in_flight claim taken before `stuck_before` counts as
    /// abandoned and becomes claimable again.
    async fn claim_deliverable(
        &self,
        batch: u64,
        max_attempts: i32,
        stuck_before: DateTime<Utc>,
    ) -> Result<Vec<Notification>>;

    /// Record the delivery outcome of a claimed row
    async fn finish_delivery(&self, id: Uuid, outcome: DeliveryOutcome) -> Result<Notification>;

    async fn list_notifications_for_evaluation(
        &self,
        evaluation_id: Uuid,
    ) -> Result<Vec<Notification>>;

    /// Failed rows in the tenant that exhausted their retry budget, for
    /// manual inspection
    async fn list_permanently_failed(
        &self,
        tenant_id: Uuid,
        max_attempts: i32,
    ) -> Result<Vec<Notification>>;
}
