//! plans entity
//! Plan artifacts submitted alongside states

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "plans")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub lineage_id: i64,
    pub tf_version: String,
    pub git_remote: String,
    pub git_commit: String,
    pub ci_url: String,
    pub source: String,
    #[sea_orm(column_type = "Text")]
    pub plan_json: String, // opaque plan payload
    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::lineages::Entity",
        from = "Column::LineageId",
        to = "super::lineages::Column::Id"
    )]
    Lineage,
}

impl Related<super::lineages::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lineage.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
