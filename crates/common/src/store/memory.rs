//! In-memory `Store` backend
//!
//! Holds the same SeaORM `Model` structs as the Postgres backend so there is
//! a single data representation. Every operation runs under one mutex guard,
//! which gives the same atomicity as a database transaction; no lock is held
//! across an await point.

use super::{DeliveryOutcome, NewDocument, NewNotification, Store, TransitionUpdate};
use crate::db::models::*;
use crate::errors::{AppError, Result};
use crate::quota;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    tenants: HashMap<Uuid, Tenant>,
    users: HashMap<Uuid, User>,
    suppliers: HashMap<Uuid, Supplier>,
    evaluations: HashMap<Uuid, Evaluation>,
    documents: HashMap<Uuid, Document>,
    rag_documents: HashMap<Uuid, RagDocument>,
    api_keys: HashMap<Uuid, ApiKey>,
    notifications: HashMap<Uuid, Notification>,
}

/// Mutex-guarded in-memory store for tests and local development
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panicking test; propagating the data is
        // still safe for reads and writes here.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn not_found(resource_type: &str, id: Uuid) -> AppError {
    AppError::NotFound {
        resource_type: resource_type.to_string(),
        id: id.to_string(),
    }
}

#[async_trait]
impl Store for MemStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_tenant(
        &self,
        name: String,
        tier: TenantTier,
        max_users: i32,
        max_evaluations_per_month: i32,
    ) -> Result<Tenant> {
        if max_users < 0 || max_evaluations_per_month < 0 {
            return Err(AppError::Validation {
                message: "tenant limits must be non-negative".to_string(),
                field: None,
            });
        }

        let mut inner = self.lock();
        if inner.tenants.values().any(|t| t.name == name) {
            return Err(AppError::Duplicate {
                message: format!("tenant name '{}' already exists", name),
            });
        }

        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name,
            tier: String::from(tier),
            max_users,
            max_evaluations_per_month,
            is_active: true,
            created_at: now.into(),
            updated_at: now.into(),
        };
        inner.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        Ok(self.lock().tenants.get(&id).cloned())
    }

    async fn delete_tenant(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        if !inner.tenants.contains_key(&id) {
            return Err(not_found("tenant", id));
        }

        let user_ids: Vec<Uuid> = inner
            .users
            .values()
            .filter(|u| u.tenant_id == id)
            .map(|u| u.id)
            .collect();
        let supplier_ids: Vec<Uuid> = inner
            .suppliers
            .values()
            .filter(|s| s.tenant_id == id)
            .map(|s| s.id)
            .collect();
        let evaluation_ids: Vec<Uuid> = inner
            .evaluations
            .values()
            .filter(|e| e.tenant_id == id)
            .map(|e| e.id)
            .collect();

        // Defined cleanup order: notifications, documents, evaluations,
        // suppliers, api keys, users, tenant.
        inner.notifications.retain(|_, n| {
            !user_ids.contains(&n.user_id)
                && !n
                    .evaluation_id
                    .map(|eid| evaluation_ids.contains(&eid))
                    .unwrap_or(false)
        });
        inner
            .documents
            .retain(|_, d| !supplier_ids.contains(&d.supplier_id));
        inner.evaluations.retain(|_, e| e.tenant_id != id);
        inner.suppliers.retain(|_, s| s.tenant_id != id);
        inner.api_keys.retain(|_, k| k.tenant_id != id);
        inner.users.retain(|_, u| u.tenant_id != id);
        inner.tenants.remove(&id);
        Ok(())
    }

    async fn create_user(
        &self,
        tenant_id: Uuid,
        email: String,
        full_name: String,
        role: UserRole,
    ) -> Result<User> {
        let mut inner = self.lock();
        let tenant = inner
            .tenants
            .get(&tenant_id)
            .ok_or_else(|| not_found("tenant", tenant_id))?
            .clone();

        if inner.users.values().any(|u| u.email == email) {
            return Err(AppError::Duplicate {
                message: format!("email '{}' already registered", email),
            });
        }

        let active = inner
            .users
            .values()
            .filter(|u| u.tenant_id == tenant_id && u.is_active)
            .count() as u64;
        quota::decide(active, tenant.max_users)
            .allow_or(AppError::QuotaExceeded {
                scope: "user".to_string(),
                limit: tenant.max_users,
            })?;

        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            tenant_id,
            email,
            full_name,
            role: String::from(role),
            is_active: true,
            created_at: now.into(),
            updated_at: now.into(),
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn count_active_users(&self, tenant_id: Uuid) -> Result<u64> {
        Ok(self
            .lock()
            .users
            .values()
            .filter(|u| u.tenant_id == tenant_id && u.is_active)
            .count() as u64)
    }

    async fn create_supplier(
        &self,
        tenant_id: Uuid,
        name: String,
        country: String,
    ) -> Result<Supplier> {
        let mut inner = self.lock();
        if !inner.tenants.contains_key(&tenant_id) {
            return Err(not_found("tenant", tenant_id));
        }
        if inner
            .suppliers
            .values()
            .any(|s| s.tenant_id == tenant_id && s.name == name && s.country == country)
        {
            return Err(AppError::Duplicate {
                message: format!("supplier '{}' ({}) already registered", name, country),
            });
        }

        let now = Utc::now();
        let supplier = Supplier {
            id: Uuid::new_v4(),
            tenant_id,
            name,
            country,
            status: String::from(SupplierStatus::Pending),
            risk_level: None,
            last_evaluated_at: None,
            created_at: now.into(),
            updated_at: now.into(),
        };
        inner.suppliers.insert(supplier.id, supplier.clone());
        Ok(supplier)
    }

    async fn find_supplier(&self, id: Uuid) -> Result<Option<Supplier>> {
        Ok(self.lock().suppliers.get(&id).cloned())
    }

    async fn list_suppliers(&self, tenant_id: Uuid) -> Result<Vec<Supplier>> {
        let mut suppliers: Vec<Supplier> = self
            .lock()
            .suppliers
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        suppliers.sort_by_key(|s| s.created_at);
        Ok(suppliers)
    }

    async fn create_api_key(
        &self,
        tenant_id: Uuid,
        key_hash: String,
        label: String,
        rate_limit_per_minute: i32,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey> {
        if rate_limit_per_minute <= 0 {
            return Err(AppError::Validation {
                message: "rate_limit_per_minute must be positive".to_string(),
                field: Some("rate_limit_per_minute".to_string()),
            });
        }

        let mut inner = self.lock();
        if !inner.tenants.contains_key(&tenant_id) {
            return Err(not_found("tenant", tenant_id));
        }
        if inner.api_keys.values().any(|k| k.key_hash == key_hash) {
            return Err(AppError::Duplicate {
                message: "api key already registered".to_string(),
            });
        }

        let key = ApiKey {
            id: Uuid::new_v4(),
            tenant_id,
            key_hash,
            label,
            rate_limit_per_minute,
            is_active: true,
            expires_at: expires_at.map(Into::into),
            created_at: Utc::now().into(),
        };
        inner.api_keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn find_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>> {
        Ok(self
            .lock()
            .api_keys
            .values()
            .find(|k| k.key_hash == hash)
            .cloned())
    }

    async fn create_evaluation(
        &self,
        supplier_id: Uuid,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Evaluation> {
        let mut inner = self.lock();
        let tenant = inner
            .tenants
            .get(&tenant_id)
            .ok_or_else(|| not_found("tenant", tenant_id))?
            .clone();
        let supplier = inner
            .suppliers
            .get(&supplier_id)
            .ok_or_else(|| not_found("supplier", supplier_id))?;
        let user = inner
            .users
            .get(&user_id)
            .ok_or_else(|| not_found("user", user_id))?;

        if supplier.tenant_id != tenant_id || user.tenant_id != tenant_id {
            return Err(AppError::CrossTenantViolation {
                message: "supplier and user must belong to the evaluation's tenant".to_string(),
            });
        }

        let month_start: sea_orm::prelude::DateTimeWithTimeZone =
            quota::month_start(Utc::now()).into();
        let used = inner
            .evaluations
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.created_at >= month_start
                    && e.evaluation_status() != EvaluationStatus::Failed
            })
            .count() as u64;
        quota::decide(used, tenant.max_evaluations_per_month).allow_or(AppError::QuotaExceeded {
            scope: "evaluation".to_string(),
            limit: tenant.max_evaluations_per_month,
        })?;

        let evaluation = Evaluation {
            id: Uuid::new_v4(),
            tenant_id,
            supplier_id,
            user_id,
            status: String::from(EvaluationStatus::Pending),
            risk_level: None,
            confidence_score: None,
            reasoning: None,
            recommended_actions: None,
            agent_outputs: None,
            error_message: None,
            api_call_count: 0,
            cost: Decimal::ZERO,
            version: 1,
            created_at: Utc::now().into(),
            started_at: None,
            completed_at: None,
        };
        inner.evaluations.insert(evaluation.id, evaluation.clone());
        Ok(evaluation)
    }

    async fn find_evaluation(&self, id: Uuid) -> Result<Option<Evaluation>> {
        Ok(self.lock().evaluations.get(&id).cloned())
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        expected_version: i32,
        update: TransitionUpdate,
    ) -> Result<Evaluation> {
        let mut inner = self.lock();

        // Validate the supplier before mutating anything, so a failure
        // leaves the evaluation untouched (transaction semantics)
        if update.supplier_risk.is_some() {
            let supplier_id = inner
                .evaluations
                .get(&id)
                .ok_or_else(|| not_found("evaluation", id))?
                .supplier_id;
            if !inner.suppliers.contains_key(&supplier_id) {
                return Err(not_found("supplier", supplier_id));
            }
        }

        let eval = {
            let eval = inner
                .evaluations
                .get_mut(&id)
                .ok_or_else(|| not_found("evaluation", id))?;

            if eval.version != expected_version {
                return Err(AppError::ConcurrentModification);
            }

            if let Some(status) = update.status {
                eval.status = String::from(status);
            }
            if let Some(ts) = update.started_at {
                eval.started_at = Some(ts.into());
            }
            if let Some(ts) = update.completed_at {
                eval.completed_at = Some(ts.into());
            }
            if let Some(risk) = update.risk_level {
                eval.risk_level = Some(risk);
            }
            if let Some(score) = update.confidence_score {
                eval.confidence_score = Some(score);
            }
            if let Some(reasoning) = update.reasoning {
                eval.reasoning = Some(reasoning);
            }
            if let Some(actions) = update.recommended_actions {
                eval.recommended_actions = Some(actions);
            }
            if let Some(outputs) = update.agent_outputs {
                eval.agent_outputs = Some(outputs);
            }
            if let Some(message) = update.error_message {
                eval.error_message = Some(message);
            }
            eval.version += 1;
            eval.clone()
        };

        // Supplier risk update commits in the same lock scope as the
        // evaluation write, both or neither.
        if let Some(risk) = update.supplier_risk {
            if let Some(supplier) = inner.suppliers.get_mut(&eval.supplier_id) {
                supplier.risk_level = Some(risk.as_str().to_string());
                supplier.last_evaluated_at = eval.completed_at;
                supplier.updated_at = Utc::now().into();
            }
        }

        Ok(eval)
    }

    async fn add_usage(
        &self,
        id: Uuid,
        api_calls: i32,
        cost_delta: Decimal,
    ) -> Result<Evaluation> {
        let mut inner = self.lock();
        let eval = inner
            .evaluations
            .get_mut(&id)
            .ok_or_else(|| not_found("evaluation", id))?;

        if eval.is_terminal() {
            return Err(AppError::InvalidState {
                message: "usage window closed: evaluation is terminal".to_string(),
            });
        }

        eval.api_call_count += api_calls;
        eval.cost += cost_delta;
        eval.version += 1;
        Ok(eval.clone())
    }

    async fn count_monthly_evaluations(
        &self,
        tenant_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> Result<u64> {
        let month_start: sea_orm::prelude::DateTimeWithTimeZone = month_start.into();
        Ok(self
            .lock()
            .evaluations
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id
                    && e.created_at >= month_start
                    && e.evaluation_status() != EvaluationStatus::Failed
            })
            .count() as u64)
    }

    async fn fail_stale_in_progress(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
    ) -> Result<Vec<Evaluation>> {
        let cutoff: sea_orm::prelude::DateTimeWithTimeZone = cutoff.into();
        let now = Utc::now();
        let mut swept = Vec::new();

        let mut inner = self.lock();
        for eval in inner.evaluations.values_mut() {
            if eval.evaluation_status() == EvaluationStatus::InProgress
                && eval.started_at.map(|ts| ts < cutoff).unwrap_or(false)
            {
                eval.status = String::from(EvaluationStatus::Failed);
                eval.error_message = Some(error_message.to_string());
                eval.completed_at = Some(now.into());
                eval.version += 1;
                swept.push(eval.clone());
            }
        }
        Ok(swept)
    }

    async fn delete_evaluation(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        if !inner.evaluations.contains_key(&id) {
            return Err(not_found("evaluation", id));
        }

        // Notifications cascade, documents detach.
        inner.notifications.retain(|_, n| n.evaluation_id != Some(id));
        for doc in inner.documents.values_mut() {
            if doc.evaluation_id == Some(id) {
                doc.evaluation_id = None;
            }
        }
        inner.evaluations.remove(&id);
        Ok(())
    }

    async fn attach_document(&self, doc: NewDocument) -> Result<Document> {
        let mut inner = self.lock();
        if !inner.suppliers.contains_key(&doc.supplier_id) {
            return Err(not_found("supplier", doc.supplier_id));
        }
        if let Some(eval_id) = doc.evaluation_id {
            let eval = inner
                .evaluations
                .get(&eval_id)
                .ok_or_else(|| not_found("evaluation", eval_id))?;
            if eval.supplier_id != doc.supplier_id {
                return Err(AppError::Validation {
                    message: "document evaluation must reference the same supplier".to_string(),
                    field: Some("evaluation_id".to_string()),
                });
            }
        }

        let document = Document {
            id: Uuid::new_v4(),
            supplier_id: doc.supplier_id,
            evaluation_id: doc.evaluation_id,
            doc_type: doc.doc_type,
            file_ref: doc.file_ref,
            size_bytes: doc.size_bytes,
            extracted_data: doc.extracted_data,
            created_at: Utc::now().into(),
        };
        inner.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn list_documents_for_supplier(&self, supplier_id: Uuid) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .lock()
            .documents
            .values()
            .filter(|d| d.supplier_id == supplier_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn upsert_rag_document(
        &self,
        name: String,
        category: String,
        chunk_count: i32,
        version: i32,
    ) -> Result<RagDocument> {
        if chunk_count < 0 {
            return Err(AppError::Validation {
                message: "chunk_count must be non-negative".to_string(),
                field: Some("chunk_count".to_string()),
            });
        }

        let mut inner = self.lock();
        let now = Utc::now();

        if let Some(existing) = inner.rag_documents.values_mut().find(|d| d.name == name) {
            existing.category = category;
            existing.chunk_count = chunk_count;
            existing.version = version;
            existing.updated_at = now.into();
            return Ok(existing.clone());
        }

        let doc = RagDocument {
            id: Uuid::new_v4(),
            name,
            category,
            chunk_count,
            version,
            created_at: now.into(),
            updated_at: now.into(),
        };
        inner.rag_documents.insert(doc.id, doc.clone());
        Ok(doc)
    }

    async fn list_rag_documents(&self) -> Result<Vec<RagDocument>> {
        let mut docs: Vec<RagDocument> = self.lock().rag_documents.values().cloned().collect();
        docs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(docs)
    }

    async fn enqueue_notification(&self, new: NewNotification) -> Result<Notification> {
        let mut inner = self.lock();

        if let Some(ref key) = new.dedupe_key {
            if let Some(existing) = inner
                .notifications
                .values()
                .find(|n| n.dedupe_key.as_deref() == Some(key))
            {
                return Ok(existing.clone());
            }
        }

        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            evaluation_id: new.evaluation_id,
            channel: new.channel.as_str().to_string(),
            recipient: new.recipient,
            subject: new.subject,
            body: new.body,
            status: String::from(NotificationStatus::Pending),
            dedupe_key: new.dedupe_key,
            attempt_count: 0,
            last_error: None,
            sent_at: None,
            claimed_at: None,
            created_at: Utc::now().into(),
        };
        inner
            .notifications
            .insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn claim_deliverable(
        &self,
        batch: u64,
        max_attempts: i32,
        stuck_before: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        let stuck_before: sea_orm::prelude::DateTimeWithTimeZone = stuck_before.into();
        let now = Utc::now();
        let mut inner = self.lock();

        let mut candidates: Vec<_> = inner
            .notifications
            .values()
            .filter(|n| {
                n.is_deliverable(max_attempts)
                    || (n.notification_status() == NotificationStatus::InFlight
                        && n.attempt_count < max_attempts
                        && n.claimed_at.map(|ts| ts < stuck_before).unwrap_or(false))
            })
            .map(|n| (n.created_at, n.id))
            .collect();
        candidates.sort();
        let candidates: Vec<Uuid> = candidates
            .into_iter()
            .take(batch as usize)
            .map(|(_, id)| id)
            .collect();

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(n) = inner.notifications.get_mut(&id) {
                n.status = String::from(NotificationStatus::InFlight);
                n.attempt_count += 1;
                n.claimed_at = Some(now.into());
                claimed.push(n.clone());
            }
        }
        Ok(claimed)
    }

    async fn finish_delivery(&self, id: Uuid, outcome: DeliveryOutcome) -> Result<Notification> {
        let mut inner = self.lock();
        let n = inner
            .notifications
            .get_mut(&id)
            .ok_or_else(|| not_found("notification", id))?;

        match outcome {
            DeliveryOutcome::Sent => {
                n.status = String::from(NotificationStatus::Sent);
                n.sent_at = Some(Utc::now().into());
                n.last_error = None;
            }
            DeliveryOutcome::Failed { error } => {
                n.status = String::from(NotificationStatus::Failed);
                n.last_error = Some(error);
            }
        }
        n.claimed_at = None;
        Ok(n.clone())
    }

    async fn list_notifications_for_evaluation(
        &self,
        evaluation_id: Uuid,
    ) -> Result<Vec<Notification>> {
        let mut rows: Vec<Notification> = self
            .lock()
            .notifications
            .values()
            .filter(|n| n.evaluation_id == Some(evaluation_id))
            .cloned()
            .collect();
        rows.sort_by_key(|n| n.created_at);
        Ok(rows)
    }

    async fn list_permanently_failed(
        &self,
        tenant_id: Uuid,
        max_attempts: i32,
    ) -> Result<Vec<Notification>> {
        let inner = self.lock();
        let mut rows: Vec<Notification> = inner
            .notifications
            .values()
            .filter(|n| {
                n.notification_status() == NotificationStatus::Failed
                    && n.attempt_count >= max_attempts
                    && inner
                        .users
                        .get(&n.user_id)
                        .is_some_and(|u| u.tenant_id == tenant_id)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|n| n.created_at);
        Ok(rows)
    }
}
