//! states entity
//! One row per ingested (path, version_id) document

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "states")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub path: String,       // backend-scoped logical key
    pub version_id: String, // backend version token, "current" when unversioned
    pub tf_version: String,
    pub serial: i64,
    pub lineage_id: i64,
    pub last_modified: DateTimeUtc, // backend-reported modification time
    pub fetched_at: DateTimeUtc,
    pub checksum: String, // SHA-256 of the normalized document
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::lineages::Entity",
        from = "Column::LineageId",
        to = "super::lineages::Column::Id"
    )]
    Lineage,
    #[sea_orm(has_many = "super::modules::Entity")]
    Modules,
}

impl Related<super::lineages::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lineage.def()
    }
}

impl Related<super::modules::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Modules.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
