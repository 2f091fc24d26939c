use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use providers::{LockInfo, Provider, ProviderError, Version};
use sea_orm::ConnectOptions;
use statefile::{Attribute, Document, Module, Resource};
use store::Database;
use terraboard::locks::aggregate_locks;
use terraboard::sync::{SharedState, SyncOptions, Syncer};

async fn test_db() -> Arc<Database> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1).sqlx_logging(false);
    let db = Database::connect(opt).await.expect("connect sqlite");
    db.migrate().await.expect("create schema");
    Arc::new(db)
}

fn document(serial: i64) -> Document {
    Document {
        tf_version: "1.5.0".to_string(),
        serial,
        lineage: "lineage-sync".to_string(),
        modules: vec![Module {
            path: "root".to_string(),
            resources: vec![Resource {
                kind: "aws_instance".to_string(),
                name: "web".to_string(),
                mode: "managed".to_string(),
                index: None,
                provider: "aws".to_string(),
                attributes: vec![Attribute {
                    key: "id".to_string(),
                    value: format!("\"i-{serial}\""),
                    sensitive: false,
                }],
            }],
        }],
    }
}

fn version(id: &str, day: u32) -> Version {
    Version {
        id: id.to_string(),
        last_modified: Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap(),
    }
}

/// In-memory provider for scheduler tests.
struct MemoryProvider {
    name: String,
    states: HashMap<String, Vec<(Version, Document)>>,
    locks: HashMap<String, LockInfo>,
    fail: bool,
    fetches: AtomicUsize,
}

impl MemoryProvider {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            states: HashMap::new(),
            locks: HashMap::new(),
            fail: false,
            fetches: AtomicUsize::new(0),
        }
    }

    fn with_state(mut self, path: &str, versions: Vec<(Version, Document)>) -> Self {
        self.states.insert(path.to_string(), versions);
        self
    }

    fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn with_lock(mut self, path: &str, lock: LockInfo) -> Self {
        self.locks.insert(path.to_string(), lock);
        self
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get_states(&self) -> providers::Result<Vec<String>> {
        if self.fail {
            return Err(ProviderError::Unavailable("backend down".to_string()));
        }
        let mut paths: Vec<String> = self.states.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    async fn get_versions(&self, path: &str) -> providers::Result<Vec<Version>> {
        if self.fail {
            return Err(ProviderError::Unavailable("backend down".to_string()));
        }
        Ok(self
            .states
            .get(path)
            .map(|versions| versions.iter().map(|(v, _)| v.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_state(
        &self,
        path: &str,
        version_id: &str,
    ) -> providers::Result<statefile::Document> {
        if self.fail {
            return Err(ProviderError::Unavailable("backend down".to_string()));
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.states
            .get(path)
            .and_then(|versions| {
                versions
                    .iter()
                    .find(|(v, _)| version_id.is_empty() || v.id == version_id)
            })
            .map(|(_, doc)| doc.clone())
            .ok_or_else(|| ProviderError::NotFound(path.to_string()))
    }

    async fn get_locks(&self) -> providers::Result<HashMap<String, LockInfo>> {
        if self.fail {
            return Err(ProviderError::Unavailable("backend down".to_string()));
        }
        Ok(self.locks.clone())
    }
}

#[tokio::test]
async fn sweep_fetches_only_unknown_versions() {
    let db = test_db().await;

    // v1 and v2 are already indexed.
    db.insert_state(
        "env/app.tfstate",
        "v1",
        version("v1", 1).last_modified,
        &document(1),
    )
    .await
    .unwrap();
    db.insert_state(
        "env/app.tfstate",
        "v2",
        version("v2", 2).last_modified,
        &document(2),
    )
    .await
    .unwrap();

    let provider = Arc::new(MemoryProvider::new("memory/a").with_state(
        "env/app.tfstate",
        vec![
            (version("v3", 3), document(3)),
            (version("v2", 2), document(2)),
            (version("v1", 1), document(1)),
        ],
    ));

    let syncer = Syncer::new(
        db.clone(),
        vec![provider.clone()],
        SyncOptions::default(),
        SharedState::new(),
    );
    syncer.sweep().await;

    // Exactly one fetch and one insert happened.
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    let known = db.known_versions("env/app.tfstate").await.unwrap();
    assert_eq!(known.len(), 3);
    assert!(known.contains("v3"));

    // A second sweep fetches nothing.
    syncer.sweep().await;
    assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_provider_does_not_abort_others() {
    let db = test_db().await;

    let healthy = Arc::new(
        MemoryProvider::new("memory/healthy")
            .with_state("ok.tfstate", vec![(version("v1", 1), document(1))]),
    );
    let broken = Arc::new(MemoryProvider::new("memory/broken").failing());

    let syncer = Syncer::new(
        db.clone(),
        vec![broken, healthy.clone()],
        SyncOptions::default(),
        SharedState::new(),
    );
    syncer.sweep().await;

    let known = db.known_versions("ok.tfstate").await.unwrap();
    assert!(known.contains("v1"));
    assert_eq!(healthy.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_version_ids_are_normalized_to_current() {
    let db = test_db().await;

    let provider = Arc::new(MemoryProvider::new("memory/k8s").with_state(
        "myapp",
        vec![(
            Version {
                id: String::new(),
                last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            },
            document(1),
        )],
    ));

    let syncer = Syncer::new(
        db.clone(),
        vec![provider],
        SyncOptions::default(),
        SharedState::new(),
    );
    syncer.sweep().await;

    let known = db.known_versions("myapp").await.unwrap();
    assert!(known.contains("current"));
}

#[tokio::test]
async fn unparseable_state_is_skipped_and_sweep_continues() {
    let db = test_db().await;

    // A provider that fails parsing for one path but serves another.
    struct PartialProvider {
        good: MemoryProvider,
    }

    #[async_trait]
    impl Provider for PartialProvider {
        fn name(&self) -> String {
            "memory/partial".to_string()
        }
        async fn get_states(&self) -> providers::Result<Vec<String>> {
            Ok(vec!["bad.tfstate".to_string(), "good.tfstate".to_string()])
        }
        async fn get_versions(&self, _path: &str) -> providers::Result<Vec<Version>> {
            Ok(vec![version("v1", 1)])
        }
        async fn get_state(
            &self,
            path: &str,
            version_id: &str,
        ) -> providers::Result<statefile::Document> {
            if path == "bad.tfstate" {
                return Err(ProviderError::Parse(
                    statefile::read(b"{not json").unwrap_err(),
                ));
            }
            self.good.get_state("good.tfstate", version_id).await
        }
        async fn get_locks(&self) -> providers::Result<HashMap<String, LockInfo>> {
            Ok(HashMap::new())
        }
    }

    let provider = Arc::new(PartialProvider {
        good: MemoryProvider::new("memory/good")
            .with_state("good.tfstate", vec![(version("v1", 1), document(1))]),
    });

    let syncer = Syncer::new(
        db.clone(),
        vec![provider],
        SyncOptions::default(),
        SharedState::new(),
    );
    syncer.sweep().await;

    assert!(db.known_versions("bad.tfstate").await.unwrap().is_empty());
    assert!(db.known_versions("good.tfstate").await.unwrap().contains("v1"));
}

#[tokio::test]
async fn lock_aggregation_reports_partial_failures() {
    let lock = LockInfo {
        id: "L1".to_string(),
        path: "env/prod".to_string(),
        operation: "OperationTypeApply".to_string(),
        who: "alice@host".to_string(),
        ..Default::default()
    };

    let provider_a: Arc<dyn Provider> =
        Arc::new(MemoryProvider::new("memory/a").with_lock("env/prod", lock));
    let provider_b: Arc<dyn Provider> = Arc::new(MemoryProvider::new("memory/b").failing());

    let report = aggregate_locks(&[provider_a, provider_b]).await;

    assert_eq!(report.locks.len(), 1);
    assert_eq!(report.locks["env/prod"].id, "L1");
    assert_eq!(report.failed_providers, vec!["memory/b".to_string()]);
}
