//! Tenant entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Subscription tier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantTier {
    Free,
    Standard,
    Enterprise,
}

impl From<String> for TenantTier {
    fn from(s: String) -> Self {
        match s.as_str() {
            "standard" => TenantTier::Standard,
            "enterprise" => TenantTier::Enterprise,
            _ => TenantTier::Free,
        }
    }
}

impl From<TenantTier> for String {
    fn from(tier: TenantTier) -> Self {
        match tier {
            TenantTier::Free => "free".to_string(),
            TenantTier::Standard => "standard".to_string(),
            TenantTier::Enterprise => "enterprise".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tenants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text", unique)]
    pub name: String,

    #[sea_orm(column_type = "Text")]
    pub tier: String,

    pub max_users: i32,

    pub max_evaluations_per_month: i32,

    pub is_active: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the tier as an enum
    pub fn tenant_tier(&self) -> TenantTier {
        TenantTier::from(self.tier.clone())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user::Entity")]
    Users,

    #[sea_orm(has_many = "super::supplier::Entity")]
    Suppliers,

    #[sea_orm(has_many = "super::evaluation::Entity")]
    Evaluations,

    #[sea_orm(has_many = "super::api_key::Entity")]
    ApiKeys,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl Related<super::supplier::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Suppliers.def()
    }
}

impl Related<super::evaluation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Evaluations.def()
    }
}

impl Related<super::api_key::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ApiKeys.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
