//! API key entity

use chrono::Utc;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tenant_id: Uuid,

    /// SHA-256 of the raw key; the raw key is never stored
    #[sea_orm(column_type = "Text", unique)]
    pub key_hash: String,

    #[sea_orm(column_type = "Text")]
    pub label: String,

    pub rate_limit_per_minute: i32,

    pub is_active: bool,

    pub expires_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    /// Revoked or expired keys reject all calls
    pub fn is_usable_at(&self, now: chrono::DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
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
}

impl Related<super::tenant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tenant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(is_active: bool, expires_at: Option<DateTimeWithTimeZone>) -> Model {
        let now = Utc::now();
        Model {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            key_hash: "hash".to_string(),
            label: "ci".to_string(),
            rate_limit_per_minute: 60,
            is_active,
            expires_at,
            created_at: now.into(),
        }
    }

    #[test]
    fn test_usable_key() {
        let now = Utc::now();
        assert!(key(true, None).is_usable_at(now));
        assert!(key(true, Some((now + Duration::hours(1)).into())).is_usable_at(now));
    }

    #[test]
    fn test_revoked_and_expired_fail_closed() {
        let now = Utc::now();
        assert!(!key(false, None).is_usable_at(now));
        assert!(!key(true, Some((now - Duration::seconds(1)).into())).is_usable_at(now));
    }
}
