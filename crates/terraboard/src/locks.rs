//! On-demand lock aggregation across all providers.

use std::collections::HashMap;
use std::sync::Arc;

use providers::{LockInfo, Provider};
use serde::Serialize;
use tracing::warn;

/// Merged lock view; providers that could not be reached are listed
/// separately instead of failing the whole request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockReport {
    pub locks: HashMap<String, LockInfo>,
    pub failed_providers: Vec<String>,
}

/// Collect active locks from every provider in parallel and merge the
/// results keyed by state path. Nothing is persisted.
pub async fn aggregate_locks(providers: &[Arc<dyn Provider>]) -> LockReport {
    let calls = providers.iter().map(|provider| {
        let provider = provider.clone();
        async move { (provider.name(), provider.get_locks().await) }
    });
    let results = futures::future::join_all(calls).await;

    let mut report = LockReport::default();
    for (name, result) in results {
        match result {
            Ok(locks) => report.locks.extend(locks),
            Err(e) => {
                warn!(provider = %name, error = %e, "Failed to collect locks");
                report.failed_providers.push(name);
            }
        }
    }

    report
}
