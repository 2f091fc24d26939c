//! Background synchronization of provider states into the index.
//!
//! Every sweep fans out across all providers in parallel; within one
//! provider, states iterate serially while version fetches share a
//! small semaphore. Already-indexed `(path, version_id)` pairs are
//! skipped. A failing provider aborts only its own sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use providers::{Provider, ProviderError, Version};
use store::Database;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Bounded fan-out for version fetches within one provider.
const FETCH_PARALLELISM: usize = 4;

/// Shutdown poll granularity between sweeps.
const SHUTDOWN_POLL_MS: u64 = 500;

/// Process-wide shutdown flag shared between the signal handler and
/// the sync loop.
#[derive(Clone, Default)]
pub struct SharedState {
    shutdown: Arc<AtomicBool>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Minutes between sweeps.
    pub interval_minutes: u64,
    /// Deadline for one full sweep; provider calls past it abort.
    pub sweep_timeout: Duration,
    /// Orphan removal grace window; `None` disables removal.
    pub orphan_grace: Option<chrono::Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            interval_minutes: 1,
            sweep_timeout: Duration::from_secs(300),
            orphan_grace: None,
        }
    }
}

pub struct Syncer {
    db: Arc<Database>,
    providers: Vec<Arc<dyn Provider>>,
    options: SyncOptions,
    state: SharedState,
}

impl Syncer {
    pub fn new(
        db: Arc<Database>,
        providers: Vec<Arc<dyn Provider>>,
        options: SyncOptions,
        state: SharedState,
    ) -> Self {
        Self {
            db,
            providers,
            options,
            state,
        }
    }

    /// Run sweeps until shutdown: once at startup, then every
    /// configured interval.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.options.interval_minutes * 60);
        loop {
            self.sweep().await;

            let next = Instant::now() + interval;
            while Instant::now() < next {
                if self.state.is_shutting_down() {
                    info!("Sync loop stopped");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_MS)).await;
            }
        }
    }

    /// One full pass over all providers.
    pub async fn sweep(&self) {
        let started = Instant::now();
        let deadline = started + self.options.sweep_timeout;
        info!(providers = self.providers.len(), "Starting sync sweep");

        let mut tasks = JoinSet::new();
        for provider in &self.providers {
            let provider = provider.clone();
            let db = self.db.clone();
            let state = self.state.clone();
            tasks.spawn(async move {
                let name = provider.name();
                match sweep_provider(provider, db, state, deadline).await {
                    Ok(paths) => Some(paths),
                    Err(e) => {
                        error!(provider = %name, error = %e, "Provider sweep aborted");
                        None
                    }
                }
            });
        }

        let mut live_paths: HashSet<String> = HashSet::new();
        let mut failed = false;
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Some(paths)) => live_paths.extend(paths),
                Ok(None) => failed = true,
                Err(e) => {
                    error!(error = %e, "Sweep task panicked");
                    failed = true;
                }
            }
        }

        // Orphan removal only runs after a fully successful sweep; a
        // failed provider's paths would otherwise look abandoned.
        if let Some(grace) = self.options.orphan_grace {
            if failed {
                debug!("Skipping orphan removal after a partial sweep");
            } else if !self.state.is_shutting_down() {
                if let Err(e) = self.db.delete_orphans(&live_paths, grace).await {
                    warn!(error = %e, "Orphan removal failed");
                }
            }
        }

        info!(
            elapsed_secs = started.elapsed().as_secs(),
            "Sync sweep finished"
        );
    }
}

async fn sweep_provider(
    provider: Arc<dyn Provider>,
    db: Arc<Database>,
    state: SharedState,
    deadline: Instant,
) -> providers::Result<Vec<String>> {
    let paths = with_deadline(deadline, provider.get_states()).await?;
    debug!(provider = %provider.name(), states = paths.len(), "Discovered states");

    let semaphore = Arc::new(Semaphore::new(FETCH_PARALLELISM));
    for path in &paths {
        if state.is_shutting_down() {
            break;
        }

        let versions = match with_deadline(deadline, provider.get_versions(path)).await {
            Ok(versions) => versions,
            Err(e) => {
                warn!(path, error = %e, "Failed to list versions, skipping path");
                continue;
            }
        };

        let Some(known) = known_versions_with_retry(&db, path).await else {
            continue;
        };

        let mut fetches = JoinSet::new();
        for version in versions {
            let id = normalized_id(&version);
            if known.contains(&id) {
                continue;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let provider = provider.clone();
            let db = db.clone();
            let path = path.clone();
            fetches.spawn(async move {
                let _permit = permit;
                ingest_version(provider, db, &path, &version, deadline).await;
            });
        }
        while fetches.join_next().await.is_some() {}
    }

    Ok(paths)
}

/// A transient store failure is retried once within the tick; on the
/// second failure the path is skipped until the next sweep.
async fn known_versions_with_retry(db: &Database, path: &str) -> Option<HashSet<String>> {
    match db.known_versions(path).await {
        Ok(known) => Some(known),
        Err(first) => {
            warn!(path, error = %first, "Failed to read known versions, retrying");
            match db.known_versions(path).await {
                Ok(known) => Some(known),
                Err(second) => {
                    error!(path, error = %second, "Failed to read known versions, skipping path");
                    None
                }
            }
        }
    }
}

async fn ingest_version(
    provider: Arc<dyn Provider>,
    db: Arc<Database>,
    path: &str,
    version: &Version,
    deadline: Instant,
) {
    let id = normalized_id(version);
    let doc = match with_deadline(deadline, provider.get_state(path, &version.id)).await {
        Ok(doc) => doc,
        Err(ProviderError::Parse(e)) => {
            warn!(path, version = %id, error = %e, "Skipping unparseable state");
            return;
        }
        Err(e) => {
            warn!(path, version = %id, error = %e, "Failed to fetch state version");
            return;
        }
    };

    if let Err(first) = db
        .insert_state(path, &id, version.last_modified, &doc)
        .await
    {
        warn!(path, version = %id, error = %first, "State insert failed, retrying");
        if let Err(second) = db
            .insert_state(path, &id, version.last_modified, &doc)
            .await
        {
            error!(path, version = %id, error = %second, "State insert failed, skipping");
        }
    }
}

fn normalized_id(version: &Version) -> String {
    if version.id.is_empty() {
        "current".to_string()
    } else {
        version.id.clone()
    }
}

async fn with_deadline<T>(
    deadline: Instant,
    operation: impl Future<Output = providers::Result<T>>,
) -> providers::Result<T> {
    match tokio::time::timeout_at(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Unavailable(
            "sweep deadline exceeded".to_string(),
        )),
    }
}
