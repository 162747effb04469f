//! Postgres `Store` backend
//!
//! SeaORM over the connection pool. Multi-entity invariants (quota checks,
//! terminal transitions with supplier updates, cleanup routines) run inside
//! explicit transactions; the optimistic version check and the notification
//! claim use guarded UPDATEs so concurrent writers cannot both commit.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::quota;
use crate::store::{DeliveryOutcome, NewDocument, NewNotification, Store, TransitionUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::{Expr, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbBackend,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, Statement, TransactionTrait,
};
use uuid::Uuid;

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    /// Create a new store over the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    /// Lock the tenant row for the duration of the transaction so that
    /// quota check plus insert observe a stable count
    async fn lock_tenant(&self, txn: &DatabaseTransaction, tenant_id: Uuid) -> Result<Tenant> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "SELECT * FROM tenants WHERE id = $1 FOR UPDATE",
            vec![tenant_id.into()],
        );

        TenantEntity::find()
            .from_raw_sql(stmt)
            .one(txn)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "tenant".to_string(),
                id: tenant_id.to_string(),
            })
    }
}

#[async_trait]
impl Store for PgStore {
    // ========================================================================
    // Health
    // ========================================================================

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    // ========================================================================
    // Tenants
    // ========================================================================

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

        let txn = self.write_conn().begin().await?;

        let existing = TenantEntity::find()
            .filter(TenantColumn::Name.eq(name.clone()))
            .one(&txn)
            .await?;
        if existing.is_some() {
            return Err(AppError::Duplicate {
                message: format!("tenant name '{}' already exists", name),
            });
        }

        let now = Utc::now();
        let tenant = TenantActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name),
            tier: Set(String::from(tier)),
            max_users: Set(max_users),
            max_evaluations_per_month: Set(max_evaluations_per_month),
            is_active: Set(true),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        let tenant = tenant.insert(&txn).await?;
        txn.commit().await?;
        Ok(tenant)
    }

    async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        TenantEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn delete_tenant(&self, id: Uuid) -> Result<()> {
        let txn = self.write_conn().begin().await?;

        if TenantEntity::find_by_id(id).one(&txn).await?.is_none() {
            return Err(AppError::NotFound {
                resource_type: "tenant".to_string(),
                id: id.to_string(),
            });
        }

        let user_ids: Vec<Uuid> = UserEntity::find()
            .filter(UserColumn::TenantId.eq(id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();

        let supplier_ids: Vec<Uuid> = SupplierEntity::find()
            .filter(SupplierColumn::TenantId.eq(id))
            .all(&txn)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        // Defined cleanup order: notifications, documents, evaluations,
        // suppliers, api keys, users, tenant.
        if !user_ids.is_empty() {
            NotificationEntity::delete_many()
                .filter(NotificationColumn::UserId.is_in(user_ids.clone()))
                .exec(&txn)
                .await?;
        }

        if !supplier_ids.is_empty() {
            DocumentEntity::delete_many()
                .filter(DocumentColumn::SupplierId.is_in(supplier_ids.clone()))
                .exec(&txn)
                .await?;
        }

        EvaluationEntity::delete_many()
            .filter(EvaluationColumn::TenantId.eq(id))
            .exec(&txn)
            .await?;

        SupplierEntity::delete_many()
            .filter(SupplierColumn::TenantId.eq(id))
            .exec(&txn)
            .await?;

        ApiKeyEntity::delete_many()
            .filter(ApiKeyColumn::TenantId.eq(id))
            .exec(&txn)
            .await?;

        UserEntity::delete_many()
            .filter(UserColumn::TenantId.eq(id))
            .exec(&txn)
            .await?;

        TenantEntity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Users
    // ========================================================================

    async fn create_user(
        &self,
        tenant_id: Uuid,
        email: String,
        full_name: String,
        role: UserRole,
    ) -> Result<User> {
        let txn = self.write_conn().begin().await?;

        let tenant = self.lock_tenant(&txn, tenant_id).await?;

        let existing = UserEntity::find()
            .filter(UserColumn::Email.eq(email.clone()))
            .one(&txn)
            .await?;
        if existing.is_some() {
            return Err(AppError::Duplicate {
                message: format!("email '{}' already registered", email),
            });
        }

        let active = UserEntity::find()
            .filter(UserColumn::TenantId.eq(tenant_id))
            .filter(UserColumn::IsActive.eq(true))
            .count(&txn)
            .await?;

        quota::decide(active, tenant.max_users).allow_or(AppError::QuotaExceeded {
            scope: "user".to_string(),
            limit: tenant.max_users,
        })?;

        let now = Utc::now();
        let user = UserActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            email: Set(email),
            full_name: Set(full_name),
            role: Set(String::from(role)),
            is_active: Set(true),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        let user = user.insert(&txn).await?;
        txn.commit().await?;
        Ok(user)
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        UserEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn count_active_users(&self, tenant_id: Uuid) -> Result<u64> {
        UserEntity::find()
            .filter(UserColumn::TenantId.eq(tenant_id))
            .filter(UserColumn::IsActive.eq(true))
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Suppliers
    // ========================================================================

    async fn create_supplier(
        &self,
        tenant_id: Uuid,
        name: String,
        country: String,
    ) -> Result<Supplier> {
        let txn = self.write_conn().begin().await?;

        if TenantEntity::find_by_id(tenant_id).one(&txn).await?.is_none() {
            return Err(AppError::NotFound {
                resource_type: "tenant".to_string(),
                id: tenant_id.to_string(),
            });
        }

        let existing = SupplierEntity::find()
            .filter(SupplierColumn::TenantId.eq(tenant_id))
            .filter(SupplierColumn::Name.eq(name.clone()))
            .filter(SupplierColumn::Country.eq(country.clone()))
            .one(&txn)
            .await?;
        if existing.is_some() {
            return Err(AppError::Duplicate {
                message: format!("supplier '{}' ({}) already registered", name, country),
            });
        }

        let now = Utc::now();
        let supplier = SupplierActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            name: Set(name),
            country: Set(country),
            status: Set(String::from(SupplierStatus::Pending)),
            risk_level: Set(None),
            last_evaluated_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        let supplier = supplier.insert(&txn).await?;
        txn.commit().await?;
        Ok(supplier)
    }

    async fn find_supplier(&self, id: Uuid) -> Result<Option<Supplier>> {
        SupplierEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn list_suppliers(&self, tenant_id: Uuid) -> Result<Vec<Supplier>> {
        SupplierEntity::find()
            .filter(SupplierColumn::TenantId.eq(tenant_id))
            .order_by_asc(SupplierColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // API keys
    // ========================================================================

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

        let txn = self.write_conn().begin().await?;

        if TenantEntity::find_by_id(tenant_id).one(&txn).await?.is_none() {
            return Err(AppError::NotFound {
                resource_type: "tenant".to_string(),
                id: tenant_id.to_string(),
            });
        }

        let existing = ApiKeyEntity::find()
            .filter(ApiKeyColumn::KeyHash.eq(key_hash.clone()))
            .one(&txn)
            .await?;
        if existing.is_some() {
            return Err(AppError::Duplicate {
                message: "api key already registered".to_string(),
            });
        }

        let key = ApiKeyActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            key_hash: Set(key_hash),
            label: Set(label),
            rate_limit_per_minute: Set(rate_limit_per_minute),
            is_active: Set(true),
            expires_at: Set(expires_at.map(Into::into)),
            created_at: Set(Utc::now().into()),
        };

        let key = key.insert(&txn).await?;
        txn.commit().await?;
        Ok(key)
    }

    async fn find_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>> {
        ApiKeyEntity::find()
            .filter(ApiKeyColumn::KeyHash.eq(hash))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Evaluations
    // ========================================================================

    async fn create_evaluation(
        &self,
        supplier_id: Uuid,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Evaluation> {
        let txn = self.write_conn().begin().await?;

        let tenant = self.lock_tenant(&txn, tenant_id).await?;

        let supplier = SupplierEntity::find_by_id(supplier_id)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "supplier".to_string(),
                id: supplier_id.to_string(),
            })?;

        let user = UserEntity::find_by_id(user_id)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "user".to_string(),
                id: user_id.to_string(),
            })?;

        if supplier.tenant_id != tenant_id || user.tenant_id != tenant_id {
            return Err(AppError::CrossTenantViolation {
                message: "supplier and user must belong to the evaluation's tenant".to_string(),
            });
        }

        let month_start = quota::month_start(Utc::now());
        let used = EvaluationEntity::find()
            .filter(EvaluationColumn::TenantId.eq(tenant_id))
            .filter(EvaluationColumn::CreatedAt.gte(month_start))
            .filter(EvaluationColumn::Status.ne(String::from(EvaluationStatus::Failed)))
            .count(&txn)
            .await?;

        quota::decide(used, tenant.max_evaluations_per_month).allow_or(
            AppError::QuotaExceeded {
                scope: "evaluation".to_string(),
                limit: tenant.max_evaluations_per_month,
            },
        )?;

        let evaluation = EvaluationActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(tenant_id),
            supplier_id: Set(supplier_id),
            user_id: Set(user_id),
            status: Set(String::from(EvaluationStatus::Pending)),
            risk_level: Set(None),
            confidence_score: Set(None),
            reasoning: Set(None),
            recommended_actions: Set(None),
            agent_outputs: Set(None),
            error_message: Set(None),
            api_call_count: Set(0),
            cost: Set(Decimal::ZERO),
            version: Set(1),
            created_at: Set(Utc::now().into()),
            started_at: Set(None),
            completed_at: Set(None),
        };

        let evaluation = evaluation.insert(&txn).await?;
        txn.commit().await?;
        Ok(evaluation)
    }

    async fn find_evaluation(&self, id: Uuid) -> Result<Option<Evaluation>> {
        EvaluationEntity::find_by_id(id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        expected_version: i32,
        update: TransitionUpdate,
    ) -> Result<Evaluation> {
        let txn = self.write_conn().begin().await?;

        // Guarded UPDATE: the version filter means at most one concurrent
        // writer sees rows_affected = 1.
        let mut query = EvaluationEntity::update_many()
            .filter(EvaluationColumn::Id.eq(id))
            .filter(EvaluationColumn::Version.eq(expected_version))
            .col_expr(
                EvaluationColumn::Version,
                Expr::col(EvaluationColumn::Version).add(1),
            );

        if let Some(status) = update.status {
            query = query.col_expr(EvaluationColumn::Status, Expr::value(String::from(status)));
        }
        if let Some(ts) = update.started_at {
            let ts: sea_orm::prelude::DateTimeWithTimeZone = ts.into();
            query = query.col_expr(EvaluationColumn::StartedAt, Expr::value(ts));
        }
        if let Some(ts) = update.completed_at {
            let ts: sea_orm::prelude::DateTimeWithTimeZone = ts.into();
            query = query.col_expr(EvaluationColumn::CompletedAt, Expr::value(ts));
        }
        if let Some(ref risk) = update.risk_level {
            query = query.col_expr(EvaluationColumn::RiskLevel, Expr::value(risk.clone()));
        }
        if let Some(score) = update.confidence_score {
            query = query.col_expr(EvaluationColumn::ConfidenceScore, Expr::value(score));
        }
        if let Some(ref reasoning) = update.reasoning {
            query = query.col_expr(EvaluationColumn::Reasoning, Expr::value(reasoning.clone()));
        }
        if let Some(ref actions) = update.recommended_actions {
            query = query.col_expr(
                EvaluationColumn::RecommendedActions,
                Expr::value(actions.clone()),
            );
        }
        if let Some(ref outputs) = update.agent_outputs {
            query = query.col_expr(EvaluationColumn::AgentOutputs, Expr::value(outputs.clone()));
        }
        if let Some(ref message) = update.error_message {
            query = query.col_expr(EvaluationColumn::ErrorMessage, Expr::value(message.clone()));
        }

        let result = query.exec(&txn).await?;

        if result.rows_affected == 0 {
            let exists = EvaluationEntity::find_by_id(id).one(&txn).await?.is_some();
            txn.rollback().await?;
            return if exists {
                Err(AppError::ConcurrentModification)
            } else {
                Err(AppError::NotFound {
                    resource_type: "evaluation".to_string(),
                    id: id.to_string(),
                })
            };
        }

        let evaluation = EvaluationEntity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "evaluation".to_string(),
                id: id.to_string(),
            })?;

        // Supplier risk commits with the evaluation or not at all
        if let Some(risk) = update.supplier_risk {
            SupplierEntity::update_many()
                .filter(SupplierColumn::Id.eq(evaluation.supplier_id))
                .col_expr(
                    SupplierColumn::RiskLevel,
                    Expr::value(risk.as_str().to_string()),
                )
                .col_expr(
                    SupplierColumn::LastEvaluatedAt,
                    Expr::value(evaluation.completed_at),
                )
                .col_expr(
                    SupplierColumn::UpdatedAt,
                    Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(Utc::now())),
                )
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(evaluation)
    }

    async fn add_usage(
        &self,
        id: Uuid,
        api_calls: i32,
        cost_delta: Decimal,
    ) -> Result<Evaluation> {
        let txn = self.write_conn().begin().await?;

        let terminal = vec![
            String::from(EvaluationStatus::Completed),
            String::from(EvaluationStatus::Failed),
        ];

        let result = EvaluationEntity::update_many()
            .filter(EvaluationColumn::Id.eq(id))
            .filter(EvaluationColumn::Status.is_not_in(terminal))
            .col_expr(
                EvaluationColumn::ApiCallCount,
                Expr::col(EvaluationColumn::ApiCallCount).add(api_calls),
            )
            .col_expr(
                EvaluationColumn::Cost,
                Expr::col(EvaluationColumn::Cost).add(cost_delta),
            )
            .col_expr(
                EvaluationColumn::Version,
                Expr::col(EvaluationColumn::Version).add(1),
            )
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            let exists = EvaluationEntity::find_by_id(id).one(&txn).await?.is_some();
            txn.rollback().await?;
            return if exists {
                Err(AppError::InvalidState {
                    message: "usage window closed: evaluation is terminal".to_string(),
                })
            } else {
                Err(AppError::NotFound {
                    resource_type: "evaluation".to_string(),
                    id: id.to_string(),
                })
            };
        }

        let evaluation = EvaluationEntity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "evaluation".to_string(),
                id: id.to_string(),
            })?;

        txn.commit().await?;
        Ok(evaluation)
    }

    async fn count_monthly_evaluations(
        &self,
        tenant_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> Result<u64> {
        EvaluationEntity::find()
            .filter(EvaluationColumn::TenantId.eq(tenant_id))
            .filter(EvaluationColumn::CreatedAt.gte(month_start))
            .filter(EvaluationColumn::Status.ne(String::from(EvaluationStatus::Failed)))
            .count(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn fail_stale_in_progress(
        &self,
        cutoff: DateTime<Utc>,
        error_message: &str,
    ) -> Result<Vec<Evaluation>> {
        // RETURNING hands the swept rows back so the engine can enqueue
        // their failure outcomes
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE evaluations
            SET status = 'failed',
                error_message = $1,
                completed_at = NOW(),
                version = version + 1
            WHERE status = 'in_progress' AND started_at < $2
            RETURNING *
            "#,
            vec![error_message.into(), cutoff.into()],
        );

        EvaluationEntity::find()
            .from_raw_sql(stmt)
            .all(self.write_conn())
            .await
            .map_err(Into::into)
    }

    async fn delete_evaluation(&self, id: Uuid) -> Result<()> {
        let txn = self.write_conn().begin().await?;

        if EvaluationEntity::find_by_id(id).one(&txn).await?.is_none() {
            return Err(AppError::NotFound {
                resource_type: "evaluation".to_string(),
                id: id.to_string(),
            });
        }

        // Notifications cascade, documents detach
        NotificationEntity::delete_many()
            .filter(NotificationColumn::EvaluationId.eq(id))
            .exec(&txn)
            .await?;

        DocumentEntity::update_many()
            .filter(DocumentColumn::EvaluationId.eq(id))
            .col_expr(DocumentColumn::EvaluationId, Expr::value(Option::<Uuid>::None))
            .exec(&txn)
            .await?;

        EvaluationEntity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        Ok(())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    async fn attach_document(&self, doc: NewDocument) -> Result<Document> {
        let txn = self.write_conn().begin().await?;

        if SupplierEntity::find_by_id(doc.supplier_id)
            .one(&txn)
            .await?
            .is_none()
        {
            return Err(AppError::NotFound {
                resource_type: "supplier".to_string(),
                id: doc.supplier_id.to_string(),
            });
        }

        if let Some(eval_id) = doc.evaluation_id {
            let evaluation = EvaluationEntity::find_by_id(eval_id)
                .one(&txn)
                .await?
                .ok_or_else(|| AppError::NotFound {
                    resource_type: "evaluation".to_string(),
                    id: eval_id.to_string(),
                })?;

            if evaluation.supplier_id != doc.supplier_id {
                return Err(AppError::Validation {
                    message: "document evaluation must reference the same supplier".to_string(),
                    field: Some("evaluation_id".to_string()),
                });
            }
        }

        let document = DocumentActiveModel {
            id: Set(Uuid::new_v4()),
            supplier_id: Set(doc.supplier_id),
            evaluation_id: Set(doc.evaluation_id),
            doc_type: Set(doc.doc_type),
            file_ref: Set(doc.file_ref),
            size_bytes: Set(doc.size_bytes),
            extracted_data: Set(doc.extracted_data),
            created_at: Set(Utc::now().into()),
        };

        let document = document.insert(&txn).await?;
        txn.commit().await?;
        Ok(document)
    }

    async fn list_documents_for_supplier(&self, supplier_id: Uuid) -> Result<Vec<Document>> {
        DocumentEntity::find()
            .filter(DocumentColumn::SupplierId.eq(supplier_id))
            .order_by_asc(DocumentColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Shared knowledge base
    // ========================================================================

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

        let now = Utc::now();
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            INSERT INTO rag_documents (id, name, category, chunk_count, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (name) DO UPDATE SET
                category = EXCLUDED.category,
                chunk_count = EXCLUDED.chunk_count,
                version = EXCLUDED.version,
                updated_at = EXCLUDED.updated_at
            RETURNING *
            "#,
            vec![
                Uuid::new_v4().into(),
                name.into(),
                category.into(),
                chunk_count.into(),
                version.into(),
                now.into(),
            ],
        );

        RagDocumentEntity::find()
            .from_raw_sql(stmt)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::Internal {
                message: "rag document upsert returned no row".to_string(),
            })
    }

    async fn list_rag_documents(&self) -> Result<Vec<RagDocument>> {
        RagDocumentEntity::find()
            .order_by_asc(RagDocumentColumn::Name)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    async fn enqueue_notification(&self, new: NewNotification) -> Result<Notification> {
        let txn = self.write_conn().begin().await?;

        if let Some(ref key) = new.dedupe_key {
            let existing = NotificationEntity::find()
                .filter(NotificationColumn::DedupeKey.eq(key.clone()))
                .one(&txn)
                .await?;
            if let Some(existing) = existing {
                txn.rollback().await?;
                return Ok(existing);
            }
        }

        let notification = NotificationActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(new.user_id),
            evaluation_id: Set(new.evaluation_id),
            channel: Set(new.channel.as_str().to_string()),
            recipient: Set(new.recipient),
            subject: Set(new.subject),
            body: Set(new.body),
            status: Set(String::from(NotificationStatus::Pending)),
            dedupe_key: Set(new.dedupe_key),
            attempt_count: Set(0),
            last_error: Set(None),
            sent_at: Set(None),
            claimed_at: Set(None),
            created_at: Set(Utc::now().into()),
        };

        let notification = notification.insert(&txn).await?;
        txn.commit().await?;
        Ok(notification)
    }

    async fn claim_deliverable(
        &self,
        batch: u64,
        max_attempts: i32,
        stuck_before: DateTime<Utc>,
    ) -> Result<Vec<Notification>> {
        // SKIP LOCKED keeps concurrent dispatch cycles from claiming the
        // same rows; the status flip makes the claim visible after commit.
        // Claims held past `stuck_before` belong to a dead cycle and are
        // taken over.
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE notifications
            SET status = 'in_flight',
                attempt_count = attempt_count + 1,
                claimed_at = NOW()
            WHERE id IN (
                SELECT id FROM notifications
                WHERE status = 'pending'
                   OR (status = 'failed' AND attempt_count < $1)
                   OR (status = 'in_flight' AND attempt_count < $1 AND claimed_at < $2)
                ORDER BY created_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
            vec![
                max_attempts.into(),
                stuck_before.into(),
                (batch as i64).into(),
            ],
        );

        NotificationEntity::find()
            .from_raw_sql(stmt)
            .all(self.write_conn())
            .await
            .map_err(Into::into)
    }

    async fn finish_delivery(&self, id: Uuid, outcome: DeliveryOutcome) -> Result<Notification> {
        let mut row: NotificationActiveModel = NotificationEntity::find_by_id(id)
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "notification".to_string(),
                id: id.to_string(),
            })?
            .into();

        match outcome {
            DeliveryOutcome::Sent => {
                row.status = Set(String::from(NotificationStatus::Sent));
                row.sent_at = Set(Some(Utc::now().into()));
                row.last_error = Set(None);
            }
            DeliveryOutcome::Failed { error } => {
                row.status = Set(String::from(NotificationStatus::Failed));
                row.last_error = Set(Some(error));
            }
        }
        row.claimed_at = Set(None);

        row.update(self.write_conn()).await.map_err(Into::into)
    }

    async fn list_notifications_for_evaluation(
        &self,
        evaluation_id: Uuid,
    ) -> Result<Vec<Notification>> {
        NotificationEntity::find()
            .filter(NotificationColumn::EvaluationId.eq(evaluation_id))
            .order_by_asc(NotificationColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn list_permanently_failed(
        &self,
        tenant_id: Uuid,
        max_attempts: i32,
    ) -> Result<Vec<Notification>> {
        NotificationEntity::find()
            .filter(NotificationColumn::Status.eq(String::from(NotificationStatus::Failed)))
            .filter(NotificationColumn::AttemptCount.gte(max_attempts))
            .filter(
                NotificationColumn::UserId.in_subquery(
                    Query::select()
                        .column(UserColumn::Id)
                        .from(UserEntity)
                        .and_where(Expr::col(UserColumn::TenantId).eq(tenant_id))
                        .to_owned(),
                ),
            )
            .order_by_asc(NotificationColumn::CreatedAt)
            .all(self.read_conn())
            .await
            .map_err(Into::into)
    }
}
