//! Read-only query facade consumed by the external API layer.

use std::sync::Arc;

use compare::StateCompare;
use providers::Provider;
use store::{
    Database, GeneralStats, LineageStat, NewPlan, PlanRecord, SearchHit, SearchQuery, StateFilter,
    StateRecord, StateSummary, VersionSummary,
};

use crate::error::{AppError, Result};
use crate::locks::{LockReport, aggregate_locks};

pub struct QueryService {
    db: Arc<Database>,
    providers: Vec<Arc<dyn Provider>>,
}

impl QueryService {
    pub fn new(db: Arc<Database>, providers: Vec<Arc<dyn Provider>>) -> Self {
        Self { db, providers }
    }

    pub async fn list_states(
        &self,
        filter: &StateFilter,
        page: u64,
    ) -> Result<(Vec<StateSummary>, u64)> {
        Ok(self.db.list_states(filter, page).await?)
    }

    /// Fetch one state version; an empty `version_id` resolves to the
    /// most recent.
    pub async fn get_state(&self, path: &str, version_id: &str) -> Result<StateRecord> {
        self.db
            .get_state(path, version_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("state {path}")))
    }

    pub async fn list_versions(&self, path: &str) -> Result<Vec<VersionSummary>> {
        Ok(self.db.list_versions(path).await?)
    }

    pub async fn search(&self, query: &SearchQuery, page: u64) -> Result<(Vec<SearchHit>, u64)> {
        Ok(self.db.search(query, page).await?)
    }

    /// Compare two versions of the same state.
    pub async fn compare(&self, path: &str, from: &str, to: &str) -> Result<StateCompare> {
        let from_state = self
            .db
            .get_state(path, from)
            .await?
            .ok_or_else(|| AppError::UnknownVersion(format!("{path} version {from}")))?;
        let to_state = self
            .db
            .get_state(path, to)
            .await?
            .ok_or_else(|| AppError::UnknownVersion(format!("{path} version {to}")))?;

        Ok(compare::compare(&from_state, &to_state))
    }

    /// Active backend locks, merged across providers.
    pub async fn locks(&self) -> LockReport {
        aggregate_locks(&self.providers).await
    }

    pub async fn insert_plan(&self, plan: &NewPlan) -> Result<i64> {
        Ok(self.db.insert_plan(plan).await?)
    }

    pub async fn list_plans(
        &self,
        lineage: Option<&str>,
        page: u64,
    ) -> Result<(Vec<PlanRecord>, u64)> {
        Ok(self.db.list_plans(lineage, page).await?)
    }

    pub async fn lineage_stats(&self) -> Result<Vec<LineageStat>> {
        Ok(self.db.lineage_stats().await?)
    }

    pub async fn general_stats(&self) -> Result<GeneralStats> {
        Ok(self.db.general_stats().await?)
    }
}
