//! Relational index for state documents
//!
//! This crate provides:
//! - sea-orm entities for lineages, states, modules, resources,
//!   attributes and plans
//! - A [`Database`] wrapper with idempotent, transactional ingest keyed
//!   by `(path, version_id)`
//! - List, version, search and stats queries for the query surface
//! - Plan storage and orphan removal

pub mod entity;

mod database;

pub use database::{
    Database, GeneralStats, Ingest, LineageStat, NewPlan, PlanRecord, SearchHit, SearchQuery,
    StateFilter, StateRecord, StateSummary, StoreError, VersionSummary, PAGE_SIZE,
};

pub type Result<T> = std::result::Result<T, StoreError>;
