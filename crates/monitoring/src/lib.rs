//! Logging initialization for the state indexer services.

mod logging;

pub use logging::init_logging;
