//! SeaORM entity models
//!
//! Database entities for RiskVet

mod api_key;
mod document;
mod evaluation;
mod notification;
mod rag_document;
mod supplier;
mod tenant;
mod user;

pub use tenant::{
    ActiveModel as TenantActiveModel, Column as TenantColumn, Entity as TenantEntity,
    Model as Tenant, TenantTier,
};

pub use user::{
    ActiveModel as UserActiveModel, Column as UserColumn, Entity as UserEntity, Model as User,
    UserRole,
};

pub use supplier::{
    ActiveModel as SupplierActiveModel, Column as SupplierColumn, Entity as SupplierEntity,
    Model as Supplier, RiskLevel, SupplierStatus,
};

pub use evaluation::{
    ActiveModel as EvaluationActiveModel, Column as EvaluationColumn, Entity as EvaluationEntity,
    EvaluationStatus, Model as Evaluation,
};

pub use document::{
    ActiveModel as DocumentActiveModel, Column as DocumentColumn, Entity as DocumentEntity,
    Model as Document,
};

pub use rag_document::{
    ActiveModel as RagDocumentActiveModel, Column as RagDocumentColumn,
    Entity as RagDocumentEntity, Model as RagDocument,
};

pub use api_key::{
    ActiveModel as ApiKeyActiveModel, Column as ApiKeyColumn, Entity as ApiKeyEntity,
    Model as ApiKey,
};

pub use notification::{
    ActiveModel as NotificationActiveModel, Channel, Column as NotificationColumn,
    Entity as NotificationEntity, Model as Notification, NotificationStatus,
};
