//! Supporting document entity
//!
//! Documents belong to a supplier; an optional evaluation link must reference
//! an evaluation on the same supplier. File bytes live in the external
//! document store, only the reference is persisted here.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub supplier_id: Uuid,

    /// Detached (set to None), not deleted, when the evaluation is removed
    pub evaluation_id: Option<Uuid>,

    #[sea_orm(column_type = "Text")]
    pub doc_type: String,

    /// Reference into the external document store
    #[sea_orm(column_type = "Text")]
    pub file_ref: String,

    pub size_bytes: i64,

    pub extracted_data: Option<Json>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::supplier::Entity",
        from = "Column::SupplierId",
        to = "super::supplier::Column::Id"
    )]
    Supplier,

    #[sea_orm(
        belongs_to = "super::evaluation::Entity",
        from = "Column::EvaluationId",
        to = "super::evaluation::Column::Id"
    )]
    Evaluation,
}

impl Related<super::supplier::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Supplier.def()
    }
}

impl Related<super::evaluation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Evaluation.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
