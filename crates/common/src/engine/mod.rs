//! Evaluation lifecycle engine
//!
//! Owns the state machine rules: which edges are legal, what a completion
//! payload must carry, and how terminal re-invocations behave. The engine
//! validates, then hands the store an already-checked `TransitionUpdate` to
//! apply under the optimistic version check. Terminal transitions also
//! enqueue outcome notifications, deduplicated per (evaluation, status,
//! recipient) so replayed lifecycle events never double-notify.

use crate::db::models::{
    Channel, Evaluation, EvaluationStatus, NotificationStatus, RiskLevel,
};
use crate::errors::{AppError, Result};
use crate::store::{NewNotification, Store, TransitionUpdate};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Payload for completing an evaluation
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub risk_level: String,
    pub confidence_score: Decimal,
    pub reasoning: String,
    pub recommended_actions: Option<serde_json::Value>,
    pub agent_outputs: serde_json::Value,
}

/// Lifecycle orchestrator over a storage backend
pub struct EvaluationEngine {
    store: Arc<dyn Store>,
    outcome_channels: Vec<Channel>,
}

impl EvaluationEngine {
    pub fn new(store: Arc<dyn Store>, outcome_channels: Vec<Channel>) -> Self {
        Self {
            store,
            outcome_channels,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Create a new evaluation in `pending`.
    ///
    /// Cross-tenant and monthly-quota checks run atomically with the insert
    /// inside the store.
    pub async fn create(
        &self,
        supplier_id: Uuid,
        user_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<Evaluation> {
        let evaluation = self
            .store
            .create_evaluation(supplier_id, user_id, tenant_id)
            .await?;

        info!(
            evaluation_id = %evaluation.id,
            tenant_id = %tenant_id,
            supplier_id = %supplier_id,
            "Evaluation created"
        );

        Ok(evaluation)
    }

    /// Move a pending evaluation to `in_progress`, stamping `started_at`
    pub async fn start(&self, id: Uuid) -> Result<Evaluation> {
        let current = self.load(id).await?;
        self.check_edge(&current, EvaluationStatus::InProgress)?;

        let update = TransitionUpdate {
            status: Some(EvaluationStatus::InProgress),
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        self.store
            .apply_transition(id, current.version, update)
            .await
    }

    /// Finalize an evaluation as `completed`.
    ///
    /// The payload is validated first: a parseable risk level, a confidence
    /// score in [0, 1], non-empty reasoning and agent outputs. Re-completing
    /// with an identical payload is a no-op; any other write against a
    /// terminal evaluation fails with `AlreadyFinalized`.
    pub async fn complete(&self, id: Uuid, outcome: CompletionOutcome) -> Result<Evaluation> {
        let risk = validate_completion(&outcome)?;
        let current = self.load(id).await?;

        if current.is_terminal() {
            if !same_completion(&current, &outcome) {
                return Err(AppError::AlreadyFinalized);
            }
            // A replay re-enqueues the outcome event: if the outbox insert
            // failed after the transition committed, the retry repairs it.
            // Dedupe keys keep it at one row per recipient.
            self.enqueue_outcome(&current).await?;
            return Ok(current);
        }
        self.check_edge(&current, EvaluationStatus::Completed)?;

        let update = TransitionUpdate {
            status: Some(EvaluationStatus::Completed),
            completed_at: Some(Utc::now()),
            risk_level: Some(risk.as_str().to_string()),
            confidence_score: Some(outcome.confidence_score),
            reasoning: Some(outcome.reasoning),
            recommended_actions: outcome.recommended_actions,
            agent_outputs: Some(outcome.agent_outputs),
            supplier_risk: Some(risk),
            ..Default::default()
        };

        let evaluation = self
            .store
            .apply_transition(id, current.version, update)
            .await?;

        info!(
            evaluation_id = %id,
            risk_level = %risk.as_str(),
            "Evaluation completed"
        );

        self.enqueue_outcome(&evaluation).await?;
        Ok(evaluation)
    }

    /// Finalize an evaluation as `failed`, from `pending` or `in_progress`
    pub async fn fail(&self, id: Uuid, error_message: String) -> Result<Evaluation> {
        let current = self.load(id).await?;

        if current.is_terminal() {
            let same = current.evaluation_status() == EvaluationStatus::Failed
                && current.error_message.as_deref() == Some(error_message.as_str());
            if !same {
                return Err(AppError::AlreadyFinalized);
            }
            // Replays repair a lost outbox insert, same as in `complete`
            self.enqueue_outcome(&current).await?;
            return Ok(current);
        }
        self.check_edge(&current, EvaluationStatus::Failed)?;

        let update = TransitionUpdate {
            status: Some(EvaluationStatus::Failed),
            completed_at: Some(Utc::now()),
            error_message: Some(error_message),
            ..Default::default()
        };

        let evaluation = self
            .store
            .apply_transition(id, current.version, update)
            .await?;

        warn!(
            evaluation_id = %id,
            error = %evaluation.error_message.as_deref().unwrap_or(""),
            "Evaluation failed"
        );

        self.enqueue_outcome(&evaluation).await?;
        Ok(evaluation)
    }

    /// Accumulate API call and cost counters for a running evaluation.
    ///
    /// Counters only grow; the usage window closes when the evaluation
    /// reaches a terminal state.
    pub async fn record_usage(
        &self,
        id: Uuid,
        api_calls: i32,
        cost_delta: Decimal,
    ) -> Result<Evaluation> {
        if api_calls < 0 || cost_delta < Decimal::ZERO {
            return Err(AppError::Validation {
                message: "usage deltas must be non-negative".to_string(),
                field: None,
            });
        }

        self.store.add_usage(id, api_calls, cost_delta).await
    }

    /// Fail `in_progress` evaluations whose worker went silent for longer
    /// than `stale_after`. Returns the number swept.
    ///
    /// Sweeping is a terminal transition like any other: each swept
    /// evaluation gets its failure outcome enqueued.
    pub async fn fail_stale(&self, stale_after: Duration) -> Result<u64> {
        let cutoff = Utc::now() - stale_after;
        let swept = self
            .store
            .fail_stale_in_progress(cutoff, "evaluation timed out: no progress from worker")
            .await?;

        for evaluation in &swept {
            self.enqueue_outcome(evaluation).await?;
        }

        if !swept.is_empty() {
            warn!(count = swept.len(), "Swept stale in_progress evaluations");
        }
        Ok(swept.len() as u64)
    }

    async fn load(&self, id: Uuid) -> Result<Evaluation> {
        self.store
            .find_evaluation(id)
            .await?
            .ok_or_else(|| AppError::NotFound {
                resource_type: "evaluation".to_string(),
                id: id.to_string(),
            })
    }

    fn check_edge(&self, current: &Evaluation, next: EvaluationStatus) -> Result<()> {
        let from = current.evaluation_status();
        if !from.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: String::from(from),
                to: String::from(next),
            });
        }
        Ok(())
    }

    /// Enqueue outcome notifications for a freshly terminal evaluation.
    ///
    /// The dedupe key makes this idempotent: a replayed terminal event finds
    /// the existing rows instead of inserting new ones.
    async fn enqueue_outcome(&self, evaluation: &Evaluation) -> Result<()> {
        let Some(user) = self.store.find_user(evaluation.user_id).await? else {
            warn!(
                evaluation_id = %evaluation.id,
                user_id = %evaluation.user_id,
                "Requesting user no longer exists, skipping outcome notification"
            );
            return Ok(());
        };

        let status = evaluation.evaluation_status();
        let (subject, body) = match status {
            EvaluationStatus::Completed => (
                format!(
                    "Supplier evaluation completed: {} risk",
                    evaluation.risk_level.as_deref().unwrap_or("unknown")
                ),
                format!(
                    "Evaluation {} finished with risk level {} (confidence {}).",
                    evaluation.id,
                    evaluation.risk_level.as_deref().unwrap_or("unknown"),
                    evaluation
                        .confidence_score
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "n/a".to_string()),
                ),
            ),
            EvaluationStatus::Failed => (
                "Supplier evaluation failed".to_string(),
                format!(
                    "Evaluation {} failed: {}",
                    evaluation.id,
                    evaluation.error_message.as_deref().unwrap_or("unknown error"),
                ),
            ),
            _ => return Ok(()),
        };

        for channel in &self.outcome_channels {
            let dedupe_key = format!(
                "{}:{}:{}:{}",
                evaluation.id,
                String::from(status),
                channel.as_str(),
                user.email
            );

            self.store
                .enqueue_notification(NewNotification {
                    user_id: user.id,
                    evaluation_id: Some(evaluation.id),
                    channel: *channel,
                    recipient: user.email.clone(),
                    subject: subject.clone(),
                    body: body.clone(),
                    dedupe_key: Some(dedupe_key),
                })
                .await?;
        }

        Ok(())
    }
}

fn validate_completion(outcome: &CompletionOutcome) -> Result<RiskLevel> {
    let risk = RiskLevel::parse(&outcome.risk_level).ok_or_else(|| AppError::IncompleteResult {
        message: format!("unrecognized risk level '{}'", outcome.risk_level),
    })?;

    if outcome.confidence_score < Decimal::ZERO || outcome.confidence_score > Decimal::ONE {
        return Err(AppError::IncompleteResult {
            message: "confidence_score must be within [0, 1]".to_string(),
        });
    }

    if outcome.reasoning.trim().is_empty() {
        return Err(AppError::IncompleteResult {
            message: "reasoning must not be empty".to_string(),
        });
    }

    if outcome.agent_outputs.is_null() {
        return Err(AppError::IncompleteResult {
            message: "agent_outputs must be present".to_string(),
        });
    }

    Ok(risk)
}

/// Whether a terminal evaluation already carries exactly this outcome
fn same_completion(current: &Evaluation, outcome: &CompletionOutcome) -> bool {
    if current.evaluation_status() != EvaluationStatus::Completed {
        return false;
    }

    let risk_matches = match RiskLevel::parse(&outcome.risk_level) {
        Some(risk) => current.risk_level.as_deref() == Some(risk.as_str()),
        None => false,
    };

    risk_matches
        && current.confidence_score == Some(outcome.confidence_score)
        && current.reasoning.as_deref() == Some(outcome.reasoning.as_str())
        && current.recommended_actions == outcome.recommended_actions
        && current.agent_outputs.as_ref() == Some(&outcome.agent_outputs)
}

/// Dispatch-eligible rows for one evaluation, used by tests and handlers
pub fn pending_notifications(rows: &[crate::db::models::Notification]) -> usize {
    rows.iter()
        .filter(|n| n.notification_status() == NotificationStatus::Pending)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        ApiKey, Document, Notification, RagDocument, Supplier, Tenant, TenantTier, User, UserRole,
    };
    use crate::store::{DeliveryOutcome, MemStore, NewDocument};
    use async_trait::async_trait;
    use chrono::DateTime;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Delegates to `MemStore` but fails the first N outbox inserts
    struct FlakyOutboxStore {
        inner: Arc<MemStore>,
        enqueue_failures: AtomicUsize,
    }

    #[async_trait]
    impl Store for FlakyOutboxStore {
        async fn ping(&self) -> Result<()> {
            self.inner.ping().await
        }

        async fn create_tenant(
            &self,
            name: String,
            tier: TenantTier,
            max_users: i32,
            max_evaluations_per_month: i32,
        ) -> Result<Tenant> {
            self.inner
                .create_tenant(name, tier, max_users, max_evaluations_per_month)
                .await
        }

        async fn find_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
            self.inner.find_tenant(id).await
        }

        async fn delete_tenant(&self, id: Uuid) -> Result<()> {
            self.inner.delete_tenant(id).await
        }

        async fn create_user(
            &self,
            tenant_id: Uuid,
            email: String,
            full_name: String,
            role: UserRole,
        ) -> Result<User> {
            self.inner.create_user(tenant_id, email, full_name, role).await
        }

        async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
            self.inner.find_user(id).await
        }

        async fn count_active_users(&self, tenant_id: Uuid) -> Result<u64> {
            self.inner.count_active_users(tenant_id).await
        }

        async fn create_supplier(
            &self,
            tenant_id: Uuid,
            name: String,
            country: String,
        ) -> Result<Supplier> {
            self.inner.create_supplier(tenant_id, name, country).await
        }

        async fn find_supplier(&self, id: Uuid) -> Result<Option<Supplier>> {
            self.inner.find_supplier(id).await
        }

        async fn list_suppliers(&self, tenant_id: Uuid) -> Result<Vec<Supplier>> {
            self.inner.list_suppliers(tenant_id).await
        }

        async fn create_api_key(
            &self,
            tenant_id: Uuid,
            key_hash: String,
            label: String,
            rate_limit_per_minute: i32,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<ApiKey> {
            self.inner
                .create_api_key(tenant_id, key_hash, label, rate_limit_per_minute, expires_at)
                .await
        }

        async fn find_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>> {
            self.inner.find_api_key_by_hash(hash).await
        }

        async fn create_evaluation(
            &self,
            supplier_id: Uuid,
            user_id: Uuid,
            tenant_id: Uuid,
        ) -> Result<Evaluation> {
            self.inner
                .create_evaluation(supplier_id, user_id, tenant_id)
                .await
        }

        async fn find_evaluation(&self, id: Uuid) -> Result<Option<Evaluation>> {
            self.inner.find_evaluation(id).await
        }

        async fn apply_transition(
            &self,
            id: Uuid,
            expected_version: i32,
            update: TransitionUpdate,
        ) -> Result<Evaluation> {
            self.inner.apply_transition(id, expected_version, update).await
        }

        async fn add_usage(
            &self,
            id: Uuid,
            api_calls: i32,
            cost_delta: Decimal,
        ) -> Result<Evaluation> {
            self.inner.add_usage(id, api_calls, cost_delta).await
        }

        async fn count_monthly_evaluations(
            &self,
            tenant_id: Uuid,
            month_start: DateTime<Utc>,
        ) -> Result<u64> {
            self.inner
                .count_monthly_evaluations(tenant_id, month_start)
                .await
        }

        async fn fail_stale_in_progress(
            &self,
            cutoff: DateTime<Utc>,
            error_message: &str,
        ) -> Result<Vec<Evaluation>> {
            self.inner.fail_stale_in_progress(cutoff, error_message).await
        }

        async fn delete_evaluation(&self, id: Uuid) -> Result<()> {
            self.inner.delete_evaluation(id).await
        }

        async fn attach_document(&self, doc: NewDocument) -> Result<Document> {
            self.inner.attach_document(doc).await
        }

        async fn list_documents_for_supplier(&self, supplier_id: Uuid) -> Result<Vec<Document>> {
            self.inner.list_documents_for_supplier(supplier_id).await
        }

        async fn upsert_rag_document(
            &self,
            name: String,
            category: String,
            chunk_count: i32,
            version: i32,
        ) -> Result<RagDocument> {
            self.inner
                .upsert_rag_document(name, category, chunk_count, version)
                .await
        }

        async fn list_rag_documents(&self) -> Result<Vec<RagDocument>> {
            self.inner.list_rag_documents().await
        }

        async fn enqueue_notification(&self, new: NewNotification) -> Result<Notification> {
            if self
                .enqueue_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::DatabaseConnection {
                    message: "connection reset".to_string(),
                });
            }
            self.inner.enqueue_notification(new).await
        }

        async fn claim_deliverable(
            &self,
            batch: u64,
            max_attempts: i32,
            stuck_before: DateTime<Utc>,
        ) -> Result<Vec<Notification>> {
            self.inner
                .claim_deliverable(batch, max_attempts, stuck_before)
                .await
        }

        async fn finish_delivery(&self, id: Uuid, outcome: DeliveryOutcome) -> Result<Notification> {
            self.inner.finish_delivery(id, outcome).await
        }

        async fn list_notifications_for_evaluation(
            &self,
            evaluation_id: Uuid,
        ) -> Result<Vec<Notification>> {
            self.inner
                .list_notifications_for_evaluation(evaluation_id)
                .await
        }

        async fn list_permanently_failed(
            &self,
            tenant_id: Uuid,
            max_attempts: i32,
        ) -> Result<Vec<Notification>> {
            self.inner
                .list_permanently_failed(tenant_id, max_attempts)
                .await
        }
    }

    struct Fixture {
        engine: EvaluationEngine,
        store: Arc<MemStore>,
        tenant_id: Uuid,
        supplier_id: Uuid,
        user_id: Uuid,
    }

    async fn fixture_with_quota(max_evaluations: i32) -> Fixture {
        let store = Arc::new(MemStore::new());
        let engine = EvaluationEngine::new(store.clone(), vec![Channel::Email]);

        let tenant = store
            .create_tenant(
                "acme-supply".to_string(),
                TenantTier::Standard,
                10,
                max_evaluations,
            )
            .await
            .unwrap();
        let user = store
            .create_user(
                tenant.id,
                "analyst@acme.example".to_string(),
                "Ana Lyst".to_string(),
                UserRole::Analyst,
            )
            .await
            .unwrap();
        let supplier = store
            .create_supplier(tenant.id, "Widget Works".to_string(), "DE".to_string())
            .await
            .unwrap();

        Fixture {
            engine,
            store,
            tenant_id: tenant.id,
            supplier_id: supplier.id,
            user_id: user.id,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_quota(100).await
    }

    fn outcome() -> CompletionOutcome {
        CompletionOutcome {
            risk_level: "Low".to_string(),
            confidence_score: dec!(0.9200),
            reasoning: "Stable financials, clean compliance record".to_string(),
            recommended_actions: Some(json!(["approve", "annual re-check"])),
            agent_outputs: json!({"document": {}, "compliance": {}, "decision": {}}),
        }
    }

    #[tokio::test]
    async fn test_create_starts_pending_at_version_one() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        assert_eq!(eval.evaluation_status(), EvaluationStatus::Pending);
        assert_eq!(eval.version, 1);
        assert_eq!(eval.cost, Decimal::ZERO);
        assert_eq!(eval.api_call_count, 0);
    }

    #[tokio::test]
    async fn test_happy_path_updates_supplier_risk() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        let started = f.engine.start(eval.id).await.unwrap();
        assert_eq!(started.evaluation_status(), EvaluationStatus::InProgress);
        assert!(started.started_at.is_some());

        let done = f.engine.complete(eval.id, outcome()).await.unwrap();
        assert_eq!(done.evaluation_status(), EvaluationStatus::Completed);
        assert_eq!(done.risk_level.as_deref(), Some("Low"));
        assert!(done.completed_at.is_some());

        let supplier = f.store.find_supplier(f.supplier_id).await.unwrap().unwrap();
        assert_eq!(supplier.risk_level.as_deref(), Some("Low"));
        assert!(supplier.last_evaluated_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_cannot_complete_directly() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        let err = f.engine.complete(eval.id, outcome()).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_pending_can_abort_to_failed() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        let failed = f
            .engine
            .fail(eval.id, "aborted before start".to_string())
            .await
            .unwrap();
        assert_eq!(failed.evaluation_status(), EvaluationStatus::Failed);
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_incomplete_results_rejected() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(eval.id).await.unwrap();

        let mut bad_risk = outcome();
        bad_risk.risk_level = "Catastrophic".to_string();
        assert!(matches!(
            f.engine.complete(eval.id, bad_risk).await.unwrap_err(),
            AppError::IncompleteResult { .. }
        ));

        let mut bad_score = outcome();
        bad_score.confidence_score = dec!(1.5);
        assert!(matches!(
            f.engine.complete(eval.id, bad_score).await.unwrap_err(),
            AppError::IncompleteResult { .. }
        ));

        let mut empty_reasoning = outcome();
        empty_reasoning.reasoning = "   ".to_string();
        assert!(matches!(
            f.engine
                .complete(eval.id, empty_reasoning)
                .await
                .unwrap_err(),
            AppError::IncompleteResult { .. }
        ));

        let mut no_outputs = outcome();
        no_outputs.agent_outputs = serde_json::Value::Null;
        assert!(matches!(
            f.engine.complete(eval.id, no_outputs).await.unwrap_err(),
            AppError::IncompleteResult { .. }
        ));

        // A rejected payload must not have moved the state machine
        let still_running = f.store.find_evaluation(eval.id).await.unwrap().unwrap();
        assert_eq!(
            still_running.evaluation_status(),
            EvaluationStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_terminal_replay_is_idempotent() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(eval.id).await.unwrap();

        let first = f.engine.complete(eval.id, outcome()).await.unwrap();
        let replay = f.engine.complete(eval.id, outcome()).await.unwrap();
        assert_eq!(first.version, replay.version);

        let mut different = outcome();
        different.risk_level = "High".to_string();
        assert!(matches!(
            f.engine.complete(eval.id, different).await.unwrap_err(),
            AppError::AlreadyFinalized
        ));

        assert!(matches!(
            f.engine
                .fail(eval.id, "late failure".to_string())
                .await
                .unwrap_err(),
            AppError::AlreadyFinalized
        ));
    }

    #[tokio::test]
    async fn test_failed_replay_is_idempotent() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(eval.id).await.unwrap();
        f.engine
            .fail(eval.id, "worker crashed".to_string())
            .await
            .unwrap();

        // Same message replays cleanly, different message conflicts
        assert!(f
            .engine
            .fail(eval.id, "worker crashed".to_string())
            .await
            .is_ok());
        assert!(matches!(
            f.engine
                .fail(eval.id, "other reason".to_string())
                .await
                .unwrap_err(),
            AppError::AlreadyFinalized
        ));
    }

    #[tokio::test]
    async fn test_concurrent_finalization_commits_exactly_once() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(eval.id).await.unwrap();

        let mut high = outcome();
        high.risk_level = "High".to_string();

        let (a, b) = tokio::join!(
            f.engine.complete(eval.id, outcome()),
            f.engine.complete(eval.id, high),
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);

        let final_state = f.store.find_evaluation(eval.id).await.unwrap().unwrap();
        assert_eq!(final_state.evaluation_status(), EvaluationStatus::Completed);
    }

    #[tokio::test]
    async fn test_version_check_rejects_stale_writer() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        let update = TransitionUpdate {
            status: Some(EvaluationStatus::InProgress),
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        f.store
            .apply_transition(eval.id, eval.version, update.clone())
            .await
            .unwrap();

        // Same expected version again: the row moved on
        let err = f
            .store
            .apply_transition(eval.id, eval.version, update)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConcurrentModification));
    }

    #[tokio::test]
    async fn test_quota_counts_pending_and_blocks_at_limit() {
        let f = fixture_with_quota(2).await;

        f.engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        let err = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::QuotaExceeded { limit: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_failed_evaluations_release_quota() {
        let f = fixture_with_quota(1).await;

        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        assert!(f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .is_err());

        f.engine.fail(eval.id, "gave up".to_string()).await.unwrap();

        // The failed slot no longer counts toward the monthly quota
        assert!(f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cross_tenant_references_rejected() {
        let f = fixture().await;
        let other = f
            .store
            .create_tenant("rival-corp".to_string(), TenantTier::Free, 5, 5)
            .await
            .unwrap();
        let foreign_supplier = f
            .store
            .create_supplier(other.id, "Foreign Parts".to_string(), "JP".to_string())
            .await
            .unwrap();

        let err = f
            .engine
            .create(foreign_supplier.id, f.user_id, f.tenant_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CrossTenantViolation { .. }));
    }

    #[tokio::test]
    async fn test_usage_accumulates_then_window_closes() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(eval.id).await.unwrap();

        f.engine
            .record_usage(eval.id, 3, dec!(0.014500))
            .await
            .unwrap();
        let running = f
            .engine
            .record_usage(eval.id, 2, dec!(0.010000))
            .await
            .unwrap();
        assert_eq!(running.api_call_count, 5);
        assert_eq!(running.cost, dec!(0.024500));

        f.engine.complete(eval.id, outcome()).await.unwrap();

        let err = f
            .engine
            .record_usage(eval.id, 1, dec!(0.001000))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_negative_usage_rejected() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        assert!(f
            .engine
            .record_usage(eval.id, -1, Decimal::ZERO)
            .await
            .is_err());
        assert!(f
            .engine
            .record_usage(eval.id, 1, dec!(-0.5))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_terminal_transition_enqueues_deduped_notification() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(eval.id).await.unwrap();
        f.engine.complete(eval.id, outcome()).await.unwrap();

        let rows = f
            .store
            .list_notifications_for_evaluation(eval.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recipient, "analyst@acme.example");
        assert_eq!(pending_notifications(&rows), 1);

        // Idempotent replay of the terminal event adds nothing
        f.engine.complete(eval.id, outcome()).await.unwrap();
        let rows = f
            .store
            .list_notifications_for_evaluation(eval.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_sweep_only_hits_old_in_progress() {
        let f = fixture().await;

        let stale = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(stale.id).await.unwrap();

        let fresh_pending = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        // Zero timeout: anything started before "now" is stale
        let swept = f.engine.fail_stale(Duration::zero()).await.unwrap();
        assert_eq!(swept, 1);

        let swept_eval = f.store.find_evaluation(stale.id).await.unwrap().unwrap();
        assert_eq!(swept_eval.evaluation_status(), EvaluationStatus::Failed);
        assert!(swept_eval.error_message.is_some());

        let untouched = f
            .store
            .find_evaluation(fresh_pending.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.evaluation_status(), EvaluationStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_sweep_enqueues_failure_outcome() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(eval.id).await.unwrap();

        assert_eq!(f.engine.fail_stale(Duration::zero()).await.unwrap(), 1);

        let rows = f
            .store
            .list_notifications_for_evaluation(eval.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject, "Supplier evaluation failed");
        assert!(rows[0].dedupe_key.is_some());

        // A later sweep finds nothing and adds nothing
        assert_eq!(f.engine.fail_stale(Duration::zero()).await.unwrap(), 0);
        let rows = f
            .store
            .list_notifications_for_evaluation(eval.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_replay_repairs_lost_outcome_event() {
        let mem = Arc::new(MemStore::new());
        let tenant = mem
            .create_tenant("acme-supply".to_string(), TenantTier::Standard, 10, 100)
            .await
            .unwrap();
        let user = mem
            .create_user(
                tenant.id,
                "analyst@acme.example".to_string(),
                "Ana Lyst".to_string(),
                UserRole::Analyst,
            )
            .await
            .unwrap();
        let supplier = mem
            .create_supplier(tenant.id, "Widget Works".to_string(), "DE".to_string())
            .await
            .unwrap();

        let flaky = Arc::new(FlakyOutboxStore {
            inner: mem.clone(),
            enqueue_failures: AtomicUsize::new(1),
        });
        let engine = EvaluationEngine::new(flaky.clone(), vec![Channel::Email]);

        let eval = engine.create(supplier.id, user.id, tenant.id).await.unwrap();
        engine.start(eval.id).await.unwrap();

        // The transition commits but the outbox insert fails
        assert!(engine.complete(eval.id, outcome()).await.is_err());
        let committed = mem.find_evaluation(eval.id).await.unwrap().unwrap();
        assert_eq!(committed.evaluation_status(), EvaluationStatus::Completed);
        assert!(mem
            .list_notifications_for_evaluation(eval.id)
            .await
            .unwrap()
            .is_empty());

        // The orchestrator's identical retry repairs the lost event
        engine.complete(eval.id, outcome()).await.unwrap();
        let rows = mem
            .list_notifications_for_evaluation(eval.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        // Same repair on the failed path
        let second = engine.create(supplier.id, user.id, tenant.id).await.unwrap();
        flaky.enqueue_failures.store(1, Ordering::SeqCst);
        assert!(engine
            .fail(second.id, "worker crashed".to_string())
            .await
            .is_err());
        engine
            .fail(second.id, "worker crashed".to_string())
            .await
            .unwrap();
        let rows = mem
            .list_notifications_for_evaluation(second.id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_user_quota_enforced() {
        let store = Arc::new(MemStore::new());
        let tenant = store
            .create_tenant("tiny".to_string(), TenantTier::Free, 1, 10)
            .await
            .unwrap();

        store
            .create_user(
                tenant.id,
                "one@tiny.example".to_string(),
                "One".to_string(),
                UserRole::Admin,
            )
            .await
            .unwrap();

        let err = store
            .create_user(
                tenant.id,
                "two@tiny.example".to_string(),
                "Two".to_string(),
                UserRole::Viewer,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded { limit: 1, .. }));
    }

    #[tokio::test]
    async fn test_delete_evaluation_detaches_documents() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();

        let doc = f
            .store
            .attach_document(crate::store::NewDocument {
                supplier_id: f.supplier_id,
                evaluation_id: Some(eval.id),
                doc_type: "financial_statement".to_string(),
                file_ref: "s3://docs/ws-2025.pdf".to_string(),
                size_bytes: 52_431,
                extracted_data: None,
            })
            .await
            .unwrap();

        f.engine.start(eval.id).await.unwrap();
        f.engine.complete(eval.id, outcome()).await.unwrap();
        f.store.delete_evaluation(eval.id).await.unwrap();

        assert!(f.store.find_evaluation(eval.id).await.unwrap().is_none());
        assert!(f
            .store
            .list_notifications_for_evaluation(eval.id)
            .await
            .unwrap()
            .is_empty());

        let docs = f
            .store
            .list_documents_for_supplier(f.supplier_id)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, doc.id);
        assert!(docs[0].evaluation_id.is_none());
    }

    #[tokio::test]
    async fn test_delete_tenant_removes_owned_rows() {
        let f = fixture().await;
        let eval = f
            .engine
            .create(f.supplier_id, f.user_id, f.tenant_id)
            .await
            .unwrap();
        f.engine.start(eval.id).await.unwrap();
        f.engine.complete(eval.id, outcome()).await.unwrap();

        f.store.delete_tenant(f.tenant_id).await.unwrap();

        assert!(f.store.find_tenant(f.tenant_id).await.unwrap().is_none());
        assert!(f.store.find_user(f.user_id).await.unwrap().is_none());
        assert!(f.store.find_supplier(f.supplier_id).await.unwrap().is_none());
        assert!(f.store.find_evaluation(eval.id).await.unwrap().is_none());
        assert!(f
            .store
            .list_notifications_for_evaluation(eval.id)
            .await
            .unwrap()
            .is_empty());
    }
}
