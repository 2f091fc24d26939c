//! State indexer service
//!
//! This crate provides:
//! - Configuration loading (YAML file, environment overrides, CLI
//!   defaults)
//! - The sync scheduler walking all configured providers on a cadence
//! - The lock aggregator collecting active backend locks on demand
//! - The read-only query facade consumed by the HTTP API layer
//!
//! Can be used as a library or through the `terraboard` binary.

pub mod cli;
pub mod config;
pub mod error;
pub mod locks;
pub mod query;
pub mod sync;

pub use cli::Cli;
pub use config::Config;
pub use error::{AppError, Result};
pub use locks::{LockReport, aggregate_locks};
pub use query::QueryService;
pub use sync::{SharedState, SyncOptions, Syncer};
