//! Evaluation entity and lifecycle state machine
//!
//! An evaluation is created `pending` by the orchestrator, moves to
//! `in_progress` when agent work begins, and reaches exactly one terminal
//! state (`completed` or `failed`). Terminal states are immutable except for
//! supplementary fields owned by other entities.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Evaluation lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl EvaluationStatus {
    /// Whether no further transition is permitted from this status
    pub fn is_terminal(&self) -> bool {
        matches!(self, EvaluationStatus::Completed | EvaluationStatus::Failed)
    }

    /// Allowed lifecycle edges:
    /// pending -> in_progress, in_progress -> completed,
    /// in_progress -> failed, pending -> failed (abort before start)
    pub fn can_transition_to(&self, next: EvaluationStatus) -> bool {
        matches!(
            (self, next),
            (EvaluationStatus::Pending, EvaluationStatus::InProgress)
                | (EvaluationStatus::Pending, EvaluationStatus::Failed)
                | (EvaluationStatus::InProgress, EvaluationStatus::Completed)
                | (EvaluationStatus::InProgress, EvaluationStatus::Failed)
        )
    }
}

impl From<String> for EvaluationStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "in_progress" => EvaluationStatus::InProgress,
            "completed" => EvaluationStatus::Completed,
            "failed" => EvaluationStatus::Failed,
            _ => EvaluationStatus::Pending,
        }
    }
}

impl From<EvaluationStatus> for String {
    fn from(status: EvaluationStatus) -> Self {
        match status {
            EvaluationStatus::Pending => "pending".to_string(),
            EvaluationStatus::InProgress => "in_progress".to_string(),
            EvaluationStatus::Completed => "completed".to_string(),
            EvaluationStatus::Failed => "failed".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "evaluations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    pub supplier_id: Uuid,

    pub user_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    /// Required iff status = completed
    #[sea_orm(column_type = "Text", nullable)]
    pub risk_level: Option<String>,

    /// Fixed-precision, in [0, 1]; required iff status = completed
    #[sea_orm(column_type = "Decimal(Some((5, 4)))", nullable)]
    pub confidence_score: Option<Decimal>,

    #[sea_orm(column_type = "Text", nullable)]
    pub reasoning: Option<String>,

    pub recommended_actions: Option<Json>,

    pub agent_outputs: Option<Json>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub api_call_count: i32,

    /// Fixed-precision cost accounting, never floating point
    #[sea_orm(column_type = "Decimal(Some((12, 6)))")]
    pub cost: Decimal,

    /// Optimistic concurrency token, bumped on every committed write
    pub version: i32,

    pub created_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

impl Model {
    /// Get the status as an enum
    pub fn evaluation_status(&self) -> EvaluationStatus {
        EvaluationStatus::from(self.status.clone())
    }

    /// Check if the evaluation is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.evaluation_status().is_terminal()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tenant::Entity",
        from = "Column::TenantId",
        to = "super::tenant::Column::Id"
    )]
    Tenant,

    #[sea_orm(
        belongs_to = "super::supplier::Entity",
        from = "Column::SupplierId",
        to = "super::supplier::Column::Id"
    )]
    Supplier,

    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,

    #[sea_orm(has_many = "super::notification::Entity")]
    Notifications,
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl Related<super::supplier::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Supplier.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::notification::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Notifications.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use EvaluationStatus::*;

        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(InProgress));
    }

    #[test]
    fn test_terminal_states() {
        assert!(EvaluationStatus::Completed.is_terminal());
        assert!(EvaluationStatus::Failed.is_terminal());
        assert!(!EvaluationStatus::Pending.is_terminal());
        assert!(!EvaluationStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            EvaluationStatus::Pending,
            EvaluationStatus::InProgress,
            EvaluationStatus::Completed,
            EvaluationStatus::Failed,
        ] {
            let s: String = status.into();
            assert_eq!(EvaluationStatus::from(s), status);
        }
    }
}
