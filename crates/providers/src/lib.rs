//! Read-only backend providers for state documents
//!
//! Every remote backend satisfies the same capability set: enumerate
//! state paths, list versions of one path, fetch a document at a
//! version, and report active locks. Providers never mutate remote
//! state and never acquire locks.

pub mod aws;
pub mod gcs;
pub mod gitlab;
pub mod kubernetes;
pub mod tfe;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("provider configuration: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Parse(#[from] statefile::ParseError),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// One backend-reported version of a state path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Version {
    pub id: String,
    pub last_modified: DateTime<Utc>,
}

impl Version {
    /// The singleton version reported by backends without native
    /// versioning.
    pub fn current(last_modified: DateTime<Utc>) -> Self {
        Self {
            id: "current".to_string(),
            last_modified,
        }
    }
}

/// An active advisory lock observed on a backend. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub path: String,
    pub operation: String,
    pub who: String,
    pub version: String,
    pub info: String,
    pub created: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Display name, e.g. `s3/my-bucket`.
    fn name(&self) -> String;

    /// All state document paths visible in this backend.
    async fn get_states(&self) -> Result<Vec<String>>;

    /// Versions of one path, newest first. Backends without native
    /// versioning return a singleton `current` entry.
    async fn get_versions(&self, path: &str) -> Result<Vec<Version>>;

    /// Fetch and parse one version; an empty `version_id` means the
    /// latest.
    async fn get_state(&self, path: &str, version_id: &str) -> Result<statefile::Document>;

    /// Active locks keyed by state path. Empty when locking is
    /// disabled or unsupported.
    async fn get_locks(&self) -> Result<HashMap<String, LockInfo>>;
}

/// Fleet-wide provider switches.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub no_versioning: bool,
    pub no_locks: bool,
}

/// Provider sections of the application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub provider: ProviderSettings,
    pub aws: Vec<aws::AwsConfig>,
    pub gcp: Vec<gcs::GcpConfig>,
    pub tfe: Vec<tfe::TfeConfig>,
    pub gitlab: Vec<gitlab::GitlabConfig>,
    pub kubernetes: Vec<kubernetes::KubernetesConfig>,
}

/// Map configuration entries to provider instances. Entries with
/// insufficient configuration are silently skipped; a backend that is
/// configured but unreachable only fails later, at call time.
pub async fn build_providers(config: &ProvidersConfig) -> Result<Vec<Arc<dyn Provider>>> {
    let settings = config.provider;
    let mut built: Vec<Arc<dyn Provider>> = Vec::new();

    for aws_config in &config.aws {
        for bucket in &aws_config.s3 {
            if let Some(provider) = aws::S3Provider::new(aws_config, bucket, settings).await {
                info!(name = %provider.name(), "Configured provider");
                built.push(Arc::new(provider));
            }
        }
    }

    for gcp_config in &config.gcp {
        for provider in gcs::GcsProvider::collection(gcp_config, settings).await? {
            info!(name = %provider.name(), "Configured provider");
            built.push(Arc::new(provider));
        }
    }

    for tfe_config in &config.tfe {
        if let Some(provider) = tfe::TfeProvider::new(tfe_config, settings)? {
            info!(name = %provider.name(), "Configured provider");
            built.push(Arc::new(provider));
        }
    }

    for gitlab_config in &config.gitlab {
        if let Some(provider) = gitlab::GitlabProvider::new(gitlab_config, settings)? {
            info!(name = %provider.name(), "Configured provider");
            built.push(Arc::new(provider));
        }
    }

    for k8s_config in &config.kubernetes {
        if let Some(provider) = kubernetes::KubernetesProvider::new(k8s_config, settings).await? {
            info!(name = %provider.name(), "Configured provider");
            built.push(Arc::new(provider));
        }
    }

    Ok(built)
}

/// Lock metadata as Terraform serializes it into lock payloads
/// (DynamoDB `Info` items, `.tflock` objects).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub(crate) struct RawLockPayload {
    #[serde(rename = "ID")]
    pub id: String,
    pub operation: String,
    pub info: String,
    pub who: String,
    pub version: String,
    pub created: String,
    pub path: String,
}

impl RawLockPayload {
    pub(crate) fn into_lock_info(self, fallback_id: &str, fallback_path: &str) -> LockInfo {
        let created = DateTime::parse_from_rfc3339(&self.created)
            .ok()
            .map(|t| t.with_timezone(&Utc));
        LockInfo {
            id: if self.id.is_empty() {
                fallback_id.to_string()
            } else {
                self.id
            },
            path: if self.path.is_empty() {
                fallback_path.to_string()
            } else {
                self.path
            },
            operation: self.operation,
            who: self.who,
            version: self.version,
            info: self.info,
            created,
        }
    }
}
