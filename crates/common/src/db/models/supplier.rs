//! Supplier entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Supplier onboarding status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierStatus {
    Pending,
    Approved,
    Rejected,
    UnderReview,
}

impl From<String> for SupplierStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "approved" => SupplierStatus::Approved,
            "rejected" => SupplierStatus::Rejected,
            "under_review" => SupplierStatus::UnderReview,
            _ => SupplierStatus::Pending,
        }
    }
}

impl From<SupplierStatus> for String {
    fn from(status: SupplierStatus) -> Self {
        match status {
            SupplierStatus::Pending => "pending".to_string(),
            SupplierStatus::Approved => "approved".to_string(),
            SupplierStatus::Rejected => "rejected".to_string(),
            SupplierStatus::UnderReview => "under_review".to_string(),
        }
    }
}

/// Risk classification produced by a completed evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Parse the canonical "Low" / "Medium" / "High" spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Low" => Some(RiskLevel::Low),
            "Medium" => Some(RiskLevel::Medium),
            "High" => Some(RiskLevel::High),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "suppliers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub name: String,

    #[sea_orm(column_type = "Text")]
    pub country: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    /// Set only by a completed evaluation, never by direct writes
    #[sea_orm(column_type = "Text", nullable)]
    pub risk_level: Option<String>,

    pub last_evaluated_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the status as an enum
    pub fn supplier_status(&self) -> SupplierStatus {
        SupplierStatus::from(self.status.clone())
    }

    /// Get the risk level as an enum, if assigned
    pub fn risk(&self) -> Option<RiskLevel> {
        self.risk_level.as_deref().and_then(RiskLevel::parse)
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

    #[sea_orm(has_many = "super::evaluation::Entity")]
    Evaluations,

    #[sea_orm(has_many = "super::document::Entity")]
    Documents,
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl Related<super::evaluation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Evaluations.def()
    }
}

impl Related<super::document::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Documents.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_parse() {
        assert_eq!(RiskLevel::parse("High"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::parse("high"), None);
        assert_eq!(RiskLevel::parse("Critical"), None);
        assert_eq!(RiskLevel::Medium.as_str(), "Medium");
    }
}
