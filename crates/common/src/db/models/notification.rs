//! Notification entity for at-least-once outcome delivery
//!
//! Rows double as the delivery queue: terminal evaluation transitions insert
//! pending rows, and the dispatcher claims them with a status compare-and-set
//! so concurrent cycles never double-process one notification.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Delivery channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Webhook,
    Slack,
}

impl Channel {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "webhook" => Some(Channel::Webhook),
            "slack" => Some(Channel::Slack),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Webhook => "webhook",
            Channel::Slack => "slack",
        }
    }
}

/// Delivery status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    /// Claimed by a running dispatch cycle
    InFlight,
    Sent,
    Failed,
}

impl From<String> for NotificationStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "in_flight" => NotificationStatus::InFlight,
            "sent" => NotificationStatus::Sent,
            "failed" => NotificationStatus::Failed,
            _ => NotificationStatus::Pending,
        }
    }
}

impl From<NotificationStatus> for String {
    fn from(status: NotificationStatus) -> Self {
        match status {
            NotificationStatus::Pending => "pending".to_string(),
            NotificationStatus::InFlight => "in_flight".to_string(),
            NotificationStatus::Sent => "sent".to_string(),
            NotificationStatus::Failed => "failed".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "notifications")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub user_id: Uuid,

    pub evaluation_id: Option<Uuid>,

    #[sea_orm(column_type = "Text")]
    pub channel: String,

    #[sea_orm(column_type = "Text")]
    pub recipient: String,

    #[sea_orm(column_type = "Text")]
    pub subject: String,

    #[sea_orm(column_type = "Text")]
    pub body: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    /// Makes duplicate lifecycle events idempotent
    /// (evaluation_id:terminal_status:recipient)
    #[sea_orm(column_type = "Text", nullable, unique)]
    pub dedupe_key: Option<String>,

    pub attempt_count: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,

    /// Set only when status = sent
    pub sent_at: Option<DateTimeWithTimeZone>,

    /// Set while a dispatch cycle holds the in_flight claim
    pub claimed_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the delivery status as an enum
    pub fn notification_status(&self) -> NotificationStatus {
        NotificationStatus::from(self.status.clone())
    }

    /// Get the channel as an enum, defaulting to email for unknown values
    pub fn delivery_channel(&self) -> Channel {
        Channel::parse(&self.channel).unwrap_or(Channel::Email)
    }

    /// Whether this row may be picked up by a dispatch cycle
    pub fn is_deliverable(&self, max_attempts: i32) -> bool {
        match self.notification_status() {
            NotificationStatus::Pending => true,
            NotificationStatus::Failed => self.attempt_count < max_attempts,
            NotificationStatus::InFlight | NotificationStatus::Sent => false,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,

    #[sea_orm(
        belongs_to = "super::evaluation::Entity",
        from = "Column::EvaluationId",
        to = "super::evaluation::Column::Id"
    )]
    Evaluation,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::evaluation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Evaluation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(status: NotificationStatus, attempts: i32) -> Model {
        Model {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            evaluation_id: None,
            channel: "email".to_string(),
            recipient: "ops@example.com".to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
            status: String::from(status),
            dedupe_key: None,
            attempt_count: attempts,
            last_error: None,
            sent_at: None,
            claimed_at: None,
            created_at: Utc::now().into(),
        }
    }

    #[test]
    fn test_channel_keys_a_map() {
        let mut transports = std::collections::HashMap::new();
        transports.insert(Channel::Email, "relay");
        transports.insert(Channel::Slack, "hook");
        assert_eq!(transports.get(&Channel::Email), Some(&"relay"));
        assert_eq!(transports.get(&Channel::Webhook), None);
    }

    #[test]
    fn test_deliverable() {
        assert!(row(NotificationStatus::Pending, 0).is_deliverable(3));
        assert!(row(NotificationStatus::Failed, 2).is_deliverable(3));
        assert!(!row(NotificationStatus::Failed, 3).is_deliverable(3));
        assert!(!row(NotificationStatus::Sent, 1).is_deliverable(3));
        assert!(!row(NotificationStatus::InFlight, 0).is_deliverable(3));
    }
}
