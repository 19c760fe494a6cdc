use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "remittance_status_history")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub remittance_id: Uuid,
    #[sea_orm(nullable)]
    pub previous_status: Option<String>,
    pub new_status: String,
    #[sea_orm(nullable)]
    pub changed_by: Option<Uuid>,
    #[sea_orm(nullable)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::remittance::Entity",
        from = "Column::RemittanceId",
        to = "super::remittance::Column::Id",
        on_delete = "Cascade"
    )]
    Remittance,
}

impl Related<super::remittance::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Remittance.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
