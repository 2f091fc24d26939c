//! Database connection and operations for the state index.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Index, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database as SeaOrmDatabase,
    DatabaseConnection, DbErr, EntityTrait, FromQueryResult, JoinType, Order, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, RelationTrait, Schema, Set, TransactionTrait,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use statefile::{Attribute, Document, Module, Resource};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::entity::{attributes, lineages, modules, plans, resources, states};

pub const PAGE_SIZE: u64 = 20;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of an ingest attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Inserted,
    /// The `(path, version_id)` pair was already indexed; existing rows
    /// were left untouched.
    Skipped,
}

/// A fully reassembled state version.
#[derive(Debug, Clone, Serialize)]
pub struct StateRecord {
    pub path: String,
    pub version_id: String,
    pub tf_version: String,
    pub serial: i64,
    pub lineage: String,
    pub last_modified: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub document: Document,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateSummary {
    pub path: String,
    pub version_id: String,
    pub tf_version: String,
    pub serial: i64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionSummary {
    pub version_id: String,
    pub serial: i64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct StateFilter {
    pub path_contains: Option<String>,
    pub tf_version: Option<String>,
    /// Keep only states containing at least one resource of this type.
    pub resource_type: Option<String>,
}

/// Structured multi-field search; `exact` switches every populated
/// field from substring to equality matching.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub module_path: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub attribute_key: Option<String>,
    pub attribute_value: Option<String>,
    pub exact: bool,
}

#[derive(Debug, Clone, Serialize, FromQueryResult)]
pub struct SearchHit {
    pub path: String,
    pub version_id: String,
    pub tf_version: String,
    pub serial: i64,
    pub module_path: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub index: Option<String>,
    pub attribute_key: String,
    pub attribute_value: String,
    pub sensitive: bool,
}

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub lineage: String,
    pub tf_version: String,
    pub git_remote: String,
    pub git_commit: String,
    pub ci_url: String,
    pub source: String,
    pub plan_json: String,
}

#[derive(Debug, Clone, Serialize, FromQueryResult)]
pub struct PlanRecord {
    pub id: i64,
    pub lineage: String,
    pub tf_version: String,
    pub git_remote: String,
    pub git_commit: String,
    pub ci_url: String,
    pub source: String,
    pub plan_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromQueryResult)]
pub struct LineageStat {
    pub lineage: String,
    pub state_count: i64,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneralStats {
    pub lineages: u64,
    pub states: u64,
    pub resources: u64,
}

/// State index connection wrapper.
pub struct Database {
    connection: DatabaseConnection,
}

impl Database {
    /// Connect with pool settings tuned for the sync workload.
    pub async fn new(database_url: &str) -> Result<Self> {
        let mut opt = ConnectOptions::new(database_url.to_string());
        opt.max_connections(20)
            .min_connections(2)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(300))
            .sqlx_logging(false);

        Self::connect(opt).await
    }

    /// Connect with explicit options.
    pub async fn connect(options: ConnectOptions) -> Result<Self> {
        let mut attempts = 0;
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY: Duration = Duration::from_secs(2);

        loop {
            attempts += 1;
            match SeaOrmDatabase::connect(options.clone()).await {
                Ok(connection) => {
                    info!("Connected to the state index database");
                    return Ok(Self { connection });
                }
                Err(e) if attempts < MAX_ATTEMPTS => {
                    warn!(
                        "Database connection attempt {}/{} failed: {}",
                        attempts, MAX_ATTEMPTS, e
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Create the schema idempotently.
    pub async fn migrate(&self) -> Result<()> {
        let backend = self.connection.get_database_backend();
        let schema = Schema::new(backend);

        let mut tables = vec![
            schema.create_table_from_entity(lineages::Entity),
            schema.create_table_from_entity(states::Entity),
            schema.create_table_from_entity(modules::Entity),
            schema.create_table_from_entity(resources::Entity),
            schema.create_table_from_entity(attributes::Entity),
            schema.create_table_from_entity(plans::Entity),
        ];
        for table in &mut tables {
            self.connection
                .execute(backend.build(table.if_not_exists()))
                .await?;
        }

        // (path, version_id) uniqueness is what makes re-ingest a no-op.
        let mut index = Index::create();
        index
            .name("idx_states_path_version")
            .table(states::Entity)
            .col(states::Column::Path)
            .col(states::Column::VersionId)
            .unique()
            .if_not_exists();
        self.connection.execute(backend.build(&index)).await?;

        Ok(())
    }

    /// Ingest one state document atomically.
    ///
    /// A `(path, version_id)` pair that is already indexed is skipped;
    /// existing rows are never touched.
    pub async fn insert_state(
        &self,
        path: &str,
        version_id: &str,
        last_modified: DateTime<Utc>,
        doc: &Document,
    ) -> Result<Ingest> {
        let version_id = if version_id.is_empty() {
            "current"
        } else {
            version_id
        };

        let checksum = document_checksum(doc)?;
        let txn = self.connection.begin().await?;

        let existing = states::Entity::find()
            .filter(states::Column::Path.eq(path))
            .filter(states::Column::VersionId.eq(version_id))
            .one(&txn)
            .await?;
        if existing.is_some() {
            debug!(path, version_id, "State version already indexed, skipping");
            return Ok(Ingest::Skipped);
        }

        let lineage_id = find_or_create_lineage(&txn, &doc.lineage).await?;

        let state = states::ActiveModel {
            path: Set(path.to_string()),
            version_id: Set(version_id.to_string()),
            tf_version: Set(doc.tf_version.clone()),
            serial: Set(doc.serial),
            lineage_id: Set(lineage_id),
            last_modified: Set(last_modified),
            fetched_at: Set(Utc::now()),
            checksum: Set(checksum),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        for module in &doc.modules {
            let module_row = modules::ActiveModel {
                state_id: Set(state.id),
                path: Set(module.path.clone()),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            for resource in &module.resources {
                let resource_row = resources::ActiveModel {
                    module_id: Set(module_row.id),
                    kind: Set(resource.kind.clone()),
                    name: Set(resource.name.clone()),
                    mode: Set(resource.mode.clone()),
                    index: Set(resource.index.clone()),
                    provider: Set(resource.provider.clone()),
                    ..Default::default()
                }
                .insert(&txn)
                .await?;

                let rows: Vec<attributes::ActiveModel> = resource
                    .attributes
                    .iter()
                    .map(|attr| attributes::ActiveModel {
                        resource_id: Set(resource_row.id),
                        key: Set(attr.key.clone()),
                        value: Set(attr.value.clone()),
                        sensitive: Set(attr.sensitive),
                        ..Default::default()
                    })
                    .collect();
                if !rows.is_empty() {
                    attributes::Entity::insert_many(rows).exec(&txn).await?;
                }
            }
        }

        txn.commit().await?;
        info!(path, version_id, serial = doc.serial, "Indexed state version");
        Ok(Ingest::Inserted)
    }

    /// Version ids already indexed for a path.
    pub async fn known_versions(&self, path: &str) -> Result<HashSet<String>> {
        let rows: Vec<String> = states::Entity::find()
            .select_only()
            .column(states::Column::VersionId)
            .filter(states::Column::Path.eq(path))
            .into_tuple()
            .all(&self.connection)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Fetch one fully reassembled state version. An empty `version_id`
    /// resolves to the most recent version for the path.
    pub async fn get_state(&self, path: &str, version_id: &str) -> Result<Option<StateRecord>> {
        let mut query = states::Entity::find().filter(states::Column::Path.eq(path));
        if version_id.is_empty() {
            query = query
                .order_by_desc(states::Column::LastModified)
                .order_by_desc(states::Column::Serial);
        } else {
            query = query.filter(states::Column::VersionId.eq(version_id));
        }

        let Some(state) = query.one(&self.connection).await? else {
            return Ok(None);
        };

        let lineage = lineages::Entity::find_by_id(state.lineage_id)
            .one(&self.connection)
            .await?
            .map(|l| l.value)
            .unwrap_or_default();

        let module_rows = modules::Entity::find()
            .filter(modules::Column::StateId.eq(state.id))
            .order_by_asc(modules::Column::Id)
            .all(&self.connection)
            .await?;
        let module_ids: Vec<i64> = module_rows.iter().map(|m| m.id).collect();

        let resource_rows = resources::Entity::find()
            .filter(resources::Column::ModuleId.is_in(module_ids.clone()))
            .order_by_asc(resources::Column::Id)
            .all(&self.connection)
            .await?;
        let resource_ids: Vec<i64> = resource_rows.iter().map(|r| r.id).collect();

        let attribute_rows = attributes::Entity::find()
            .filter(attributes::Column::ResourceId.is_in(resource_ids))
            .order_by_asc(attributes::Column::Id)
            .all(&self.connection)
            .await?;

        let mut doc_modules = Vec::with_capacity(module_rows.len());
        for module in &module_rows {
            let mut doc_resources = Vec::new();
            for resource in resource_rows.iter().filter(|r| r.module_id == module.id) {
                let attrs: Vec<Attribute> = attribute_rows
                    .iter()
                    .filter(|a| a.resource_id == resource.id)
                    .map(|a| Attribute {
                        key: a.key.clone(),
                        value: a.value.clone(),
                        sensitive: a.sensitive,
                    })
                    .collect();
                doc_resources.push(Resource {
                    kind: resource.kind.clone(),
                    name: resource.name.clone(),
                    mode: resource.mode.clone(),
                    index: resource.index.clone(),
                    provider: resource.provider.clone(),
                    attributes: attrs,
                });
            }
            doc_modules.push(Module {
                path: module.path.clone(),
                resources: doc_resources,
            });
        }

        Ok(Some(StateRecord {
            path: state.path,
            version_id: state.version_id,
            tf_version: state.tf_version.clone(),
            serial: state.serial,
            lineage: lineage.clone(),
            last_modified: state.last_modified,
            fetched_at: state.fetched_at,
            document: Document {
                tf_version: state.tf_version,
                serial: state.serial,
                lineage,
                modules: doc_modules,
            },
        }))
    }

    /// List indexed state versions with optional filters; pages are
    /// `PAGE_SIZE` rows, `page` is zero-based.
    pub async fn list_states(
        &self,
        filter: &StateFilter,
        page: u64,
    ) -> Result<(Vec<StateSummary>, u64)> {
        let mut query = states::Entity::find();

        if let Some(fragment) = &filter.path_contains {
            query = query.filter(states::Column::Path.contains(fragment.as_str()));
        }
        if let Some(tf_version) = &filter.tf_version {
            query = query.filter(states::Column::TfVersion.eq(tf_version.as_str()));
        }
        if let Some(resource_type) = &filter.resource_type {
            let sub = Query::select()
                .column(modules::Column::StateId)
                .from(modules::Entity)
                .inner_join(
                    resources::Entity,
                    Expr::col((resources::Entity, resources::Column::ModuleId))
                        .equals((modules::Entity, modules::Column::Id)),
                )
                .and_where(
                    Expr::col((resources::Entity, resources::Column::Kind))
                        .eq(resource_type.as_str()),
                )
                .to_owned();
            query = query.filter(states::Column::Id.in_subquery(sub));
        }

        let paginator = query
            .order_by_asc(states::Column::Path)
            .order_by_desc(states::Column::LastModified)
            .paginate(&self.connection, PAGE_SIZE);

        let total = paginator.num_items().await?;
        let rows = paginator
            .fetch_page(page)
            .await?
            .into_iter()
            .map(|s| StateSummary {
                path: s.path,
                version_id: s.version_id,
                tf_version: s.tf_version,
                serial: s.serial,
                last_modified: s.last_modified,
            })
            .collect();

        Ok((rows, total))
    }

    /// Versions indexed for a path, most recent first (backend-reported
    /// modification time, then serial).
    pub async fn list_versions(&self, path: &str) -> Result<Vec<VersionSummary>> {
        let rows = states::Entity::find()
            .filter(states::Column::Path.eq(path))
            .order_by_desc(states::Column::LastModified)
            .order_by_desc(states::Column::Serial)
            .all(&self.connection)
            .await?;

        Ok(rows
            .into_iter()
            .map(|s| VersionSummary {
                version_id: s.version_id,
                serial: s.serial,
                last_modified: s.last_modified,
            })
            .collect())
    }

    /// Structured search across modules, resources and attributes.
    pub async fn search(&self, query: &SearchQuery, page: u64) -> Result<(Vec<SearchHit>, u64)> {
        let mut select = attributes::Entity::find()
            .join(JoinType::InnerJoin, attributes::Relation::Resource.def())
            .join(JoinType::InnerJoin, resources::Relation::Module.def())
            .join(JoinType::InnerJoin, modules::Relation::State.def())
            .select_only()
            .column_as(states::Column::Path, "path")
            .column_as(states::Column::VersionId, "version_id")
            .column_as(states::Column::TfVersion, "tf_version")
            .column_as(states::Column::Serial, "serial")
            .column_as(modules::Column::Path, "module_path")
            .column_as(resources::Column::Kind, "kind")
            .column_as(resources::Column::Name, "name")
            .column_as(resources::Column::Index, "index")
            .column_as(attributes::Column::Key, "attribute_key")
            .column_as(attributes::Column::Value, "attribute_value")
            .column_as(attributes::Column::Sensitive, "sensitive");

        select = apply_match(select, modules::Column::Path, &query.module_path, query.exact);
        select = apply_match(select, resources::Column::Kind, &query.kind, query.exact);
        select = apply_match(select, resources::Column::Name, &query.name, query.exact);
        select = apply_match(
            select,
            attributes::Column::Key,
            &query.attribute_key,
            query.exact,
        );
        select = apply_match(
            select,
            attributes::Column::Value,
            &query.attribute_value,
            query.exact,
        );

        let paginator = select
            .order_by(states::Column::Path, Order::Asc)
            .order_by(attributes::Column::Key, Order::Asc)
            .into_model::<SearchHit>()
            .paginate(&self.connection, PAGE_SIZE);

        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page).await?;
        Ok((rows, total))
    }

    /// Remove state versions whose path was not reported by any live
    /// provider and whose last fetch is older than the grace window.
    /// Returns the number of state versions removed.
    pub async fn delete_orphans(
        &self,
        live_paths: &HashSet<String>,
        grace: chrono::Duration,
    ) -> Result<u64> {
        let cutoff = Utc::now() - grace;
        let candidates = states::Entity::find()
            .filter(states::Column::FetchedAt.lt(cutoff))
            .all(&self.connection)
            .await?;

        let state_ids: Vec<i64> = candidates
            .iter()
            .filter(|s| !live_paths.contains(&s.path))
            .map(|s| s.id)
            .collect();
        if state_ids.is_empty() {
            return Ok(0);
        }

        let txn = self.connection.begin().await?;

        let module_sub = Query::select()
            .column(modules::Column::Id)
            .from(modules::Entity)
            .and_where(Expr::col(modules::Column::StateId).is_in(state_ids.clone()))
            .to_owned();
        let resource_sub = Query::select()
            .column(resources::Column::Id)
            .from(resources::Entity)
            .and_where(Expr::col(resources::Column::ModuleId).in_subquery(module_sub.clone()))
            .to_owned();

        attributes::Entity::delete_many()
            .filter(attributes::Column::ResourceId.in_subquery(resource_sub))
            .exec(&txn)
            .await?;
        resources::Entity::delete_many()
            .filter(resources::Column::ModuleId.in_subquery(module_sub))
            .exec(&txn)
            .await?;
        modules::Entity::delete_many()
            .filter(modules::Column::StateId.is_in(state_ids.clone()))
            .exec(&txn)
            .await?;
        let deleted = states::Entity::delete_many()
            .filter(states::Column::Id.is_in(state_ids))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        warn!(removed = deleted.rows_affected, "Removed orphaned state versions");
        Ok(deleted.rows_affected)
    }

    pub async fn insert_plan(&self, plan: &NewPlan) -> Result<i64> {
        let txn = self.connection.begin().await?;
        let lineage_id = find_or_create_lineage(&txn, &plan.lineage).await?;

        let row = plans::ActiveModel {
            lineage_id: Set(lineage_id),
            tf_version: Set(plan.tf_version.clone()),
            git_remote: Set(plan.git_remote.clone()),
            git_commit: Set(plan.git_commit.clone()),
            ci_url: Set(plan.ci_url.clone()),
            source: Set(plan.source.clone()),
            plan_json: Set(plan.plan_json.clone()),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(row.id)
    }

    pub async fn list_plans(
        &self,
        lineage: Option<&str>,
        page: u64,
    ) -> Result<(Vec<PlanRecord>, u64)> {
        let mut select = plans::Entity::find()
            .join(JoinType::InnerJoin, plans::Relation::Lineage.def())
            .select_only()
            .column(plans::Column::Id)
            .column_as(lineages::Column::Value, "lineage")
            .column(plans::Column::TfVersion)
            .column(plans::Column::GitRemote)
            .column(plans::Column::GitCommit)
            .column(plans::Column::CiUrl)
            .column(plans::Column::Source)
            .column(plans::Column::PlanJson)
            .column(plans::Column::CreatedAt);

        if let Some(lineage) = lineage {
            select = select.filter(lineages::Column::Value.eq(lineage));
        }

        let paginator = select
            .order_by_desc(plans::Column::CreatedAt)
            .into_model::<PlanRecord>()
            .paginate(&self.connection, PAGE_SIZE);

        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page).await?;
        Ok((rows, total))
    }

    /// Per-lineage version counts and most recent activity.
    pub async fn lineage_stats(&self) -> Result<Vec<LineageStat>> {
        let rows = lineages::Entity::find()
            .join(JoinType::LeftJoin, lineages::Relation::States.def())
            .select_only()
            .column_as(lineages::Column::Value, "lineage")
            .column_as(states::Column::Id.count(), "state_count")
            .column_as(states::Column::LastModified.max(), "last_update")
            .group_by(lineages::Column::Value)
            .order_by(lineages::Column::Value, Order::Asc)
            .into_model::<LineageStat>()
            .all(&self.connection)
            .await?;
        Ok(rows)
    }

    pub async fn general_stats(&self) -> Result<GeneralStats> {
        Ok(GeneralStats {
            lineages: lineages::Entity::find().count(&self.connection).await?,
            states: states::Entity::find().count(&self.connection).await?,
            resources: resources::Entity::find().count(&self.connection).await?,
        })
    }
}

fn apply_match<E>(
    select: sea_orm::Select<E>,
    column: impl ColumnTrait,
    value: &Option<String>,
    exact: bool,
) -> sea_orm::Select<E>
where
    E: EntityTrait,
{
    match value {
        Some(v) if exact => select.filter(column.eq(v.as_str())),
        Some(v) => select.filter(column.contains(v.as_str())),
        None => select,
    }
}

async fn find_or_create_lineage<C>(conn: &C, value: &str) -> Result<i64>
where
    C: ConnectionTrait,
{
    if let Some(existing) = lineages::Entity::find()
        .filter(lineages::Column::Value.eq(value))
        .one(conn)
        .await?
    {
        return Ok(existing.id);
    }

    let row = lineages::ActiveModel {
        value: Set(value.to_string()),
        ..Default::default()
    }
    .insert(conn)
    .await?;
    Ok(row.id)
}

fn document_checksum(doc: &Document) -> Result<String> {
    let bytes = serde_json::to_vec(doc)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
