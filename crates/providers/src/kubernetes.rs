//! Kubernetes provider reading states from secrets.
//!
//! State documents live in secrets named `<state>-<suffix>` whose
//! `data["tfstate"]` field holds the document, possibly base64-wrapped
//! and/or gzip-compressed. Secrets have no native versioning, so a
//! singleton `current` version is reported. Locks are read from
//! `terraform.io/lock-*` annotations.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{LockInfo, Provider, ProviderError, ProviderSettings, Result, Version};

const STATE_DATA_KEY: &str = "tfstate";
const LAST_MODIFIED_ANNOTATION: &str = "terraform.io/last-modified";
const LOCK_ID_ANNOTATION: &str = "terraform.io/lock-id";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub namespace: String,
    pub secret_suffix: String,
    pub labels: HashMap<String, String>,
    pub config_path: String,
    pub context: String,
    pub in_cluster_config: bool,
}

pub struct KubernetesProvider {
    client: kube::Client,
    namespace: String,
    suffix: String,
    labels: HashMap<String, String>,
    settings: ProviderSettings,
}

impl KubernetesProvider {
    /// Returns `Ok(None)` when neither a namespace nor a secret suffix
    /// is configured.
    pub async fn new(
        config: &KubernetesConfig,
        settings: ProviderSettings,
    ) -> Result<Option<Self>> {
        if config.namespace.is_empty() && config.secret_suffix.is_empty() {
            return Ok(None);
        }

        let kube_config = if config.in_cluster_config {
            info!("Using in-cluster Kubernetes configuration");
            kube::Config::incluster().map_err(|e| {
                ProviderError::Config(format!("failed to load in-cluster config: {e}"))
            })?
        } else {
            info!(
                config_path = %config.config_path,
                context = %config.context,
                "Using kubeconfig for Kubernetes configuration"
            );
            let kubeconfig = if config.config_path.is_empty() {
                Kubeconfig::read()
            } else {
                Kubeconfig::read_from(&config.config_path)
            }
            .map_err(|e| ProviderError::Config(format!("failed to read kubeconfig: {e}")))?;

            let options = KubeConfigOptions {
                context: (!config.context.is_empty()).then(|| config.context.clone()),
                ..Default::default()
            };
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| {
                    ProviderError::Config(format!("failed to build Kubernetes config: {e}"))
                })?
        };

        let client = kube::Client::try_from(kube_config).map_err(|e| {
            ProviderError::Config(format!("failed to create Kubernetes client: {e}"))
        })?;

        Ok(Some(Self {
            client,
            namespace: config.namespace.clone(),
            suffix: config.secret_suffix.clone(),
            labels: config.labels.clone(),
            settings,
        }))
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn list_params(&self) -> ListParams {
        if self.labels.is_empty() {
            ListParams::default()
        } else {
            let selector = self
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",");
            ListParams::default().labels(&selector)
        }
    }

    fn secret_name(&self, path: &str) -> String {
        format!("{path}-{}", self.suffix)
    }

    async fn get_secret(&self, path: &str) -> Result<Secret> {
        let name = self.secret_name(path);
        self.secrets().get(&name).await.map_err(|e| {
            ProviderError::Unavailable(format!("failed to get secret {name}: {e}"))
        })
    }
}

/// Strip the configured suffix from a secret name; secrets without the
/// suffix are not state documents.
fn state_name<'a>(secret_name: &'a str, suffix: &str) -> Option<&'a str> {
    secret_name
        .strip_suffix(suffix)
        .and_then(|n| n.strip_suffix('-'))
        .filter(|n| !n.is_empty())
}

/// Undo the encodings the Kubernetes backend may apply to the payload:
/// gzip, base64, or base64-wrapped gzip.
fn decode_payload(raw: &[u8]) -> Vec<u8> {
    if let Some(out) = gunzip(raw) {
        return out;
    }

    let trimmed: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if let Ok(decoded) = BASE64.decode(&trimmed) {
        if let Some(out) = gunzip(&decoded) {
            return out;
        }
        if decoded.first() == Some(&b'{') {
            return decoded;
        }
    }

    raw.to_vec()
}

fn gunzip(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 2 || raw[0] != 0x1f || raw[1] != 0x8b {
        return None;
    }
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(raw).read_to_end(&mut out).ok()?;
    Some(out)
}

fn annotations(secret: &Secret) -> Option<&BTreeMap<String, String>> {
    secret.metadata.annotations.as_ref()
}

#[async_trait::async_trait]
impl Provider for KubernetesProvider {
    fn name(&self) -> String {
        format!("kubernetes/{}", self.namespace)
    }

    async fn get_states(&self) -> Result<Vec<String>> {
        let secrets = self.secrets().list(&self.list_params()).await.map_err(|e| {
            ProviderError::Unavailable(format!(
                "failed to list secrets in namespace {}: {e}",
                self.namespace
            ))
        })?;

        let mut states = Vec::new();
        for secret in secrets {
            let Some(name) = secret.metadata.name.as_deref() else {
                continue;
            };
            let has_state = secret
                .data
                .as_ref()
                .is_some_and(|d| d.contains_key(STATE_DATA_KEY));
            if !has_state {
                continue;
            }
            if let Some(state) = state_name(name, &self.suffix) {
                states.push(state.to_string());
            }
        }

        states.sort();
        Ok(states)
    }

    async fn get_versions(&self, path: &str) -> Result<Vec<Version>> {
        let secret = self.get_secret(path).await?;

        let mut last_modified: DateTime<Utc> = secret
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_default();
        if let Some(stamp) = annotations(&secret).and_then(|a| a.get(LAST_MODIFIED_ANNOTATION)) {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp) {
                last_modified = parsed.with_timezone(&Utc);
            }
        }

        Ok(vec![Version::current(last_modified)])
    }

    async fn get_state(&self, path: &str, version_id: &str) -> Result<statefile::Document> {
        if !version_id.is_empty() && version_id != "current" {
            debug!(
                path,
                version_id, "Version ignored, secrets have no native versioning"
            );
        }

        let secret = self.get_secret(path).await?;
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(STATE_DATA_KEY))
            .ok_or_else(|| {
                ProviderError::NotFound(format!(
                    "secret {} has no {STATE_DATA_KEY} data",
                    self.secret_name(path)
                ))
            })?;

        let payload = decode_payload(&data.0);
        Ok(statefile::read(&payload)?)
    }

    async fn get_locks(&self) -> Result<HashMap<String, LockInfo>> {
        if self.settings.no_locks {
            return Ok(HashMap::new());
        }

        let secrets = self.secrets().list(&self.list_params()).await.map_err(|e| {
            ProviderError::Unavailable(format!(
                "failed to list secrets for locks in namespace {}: {e}",
                self.namespace
            ))
        })?;

        let mut locks = HashMap::new();
        for secret in secrets {
            let Some(name) = secret.metadata.name.as_deref() else {
                continue;
            };
            let Some(path) = state_name(name, &self.suffix) else {
                continue;
            };
            let Some(annotations) = annotations(&secret) else {
                continue;
            };
            let Some(lock_id) = annotations.get(LOCK_ID_ANNOTATION) else {
                continue;
            };

            let lookup = |key: &str| annotations.get(key).cloned().unwrap_or_default();
            locks.insert(
                path.to_string(),
                LockInfo {
                    id: lock_id.clone(),
                    path: path.to_string(),
                    operation: lookup("terraform.io/lock-operation"),
                    who: lookup("terraform.io/lock-who"),
                    version: lookup("terraform.io/lock-version"),
                    info: lookup("terraform.io/lock-info"),
                    created: annotations
                        .get("terraform.io/lock-created")
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc)),
                },
            );
        }

        Ok(locks)
    }
}
