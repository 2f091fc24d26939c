//! Google Cloud Storage provider using object generations as versions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use google_cloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::Object;
use serde::Deserialize;
use tracing::warn;

use crate::{LockInfo, Provider, ProviderError, ProviderSettings, RawLockPayload, Result, Version};

const STATE_EXTENSION: &str = ".tfstate";
const LOCK_EXTENSION: &str = ".tflock";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    pub gcs_buckets: Vec<String>,
    pub gcp_sa_key: String,
}

pub struct GcsProvider {
    client: Client,
    bucket: String,
    settings: ProviderSettings,
}

impl GcsProvider {
    /// One provider per configured bucket; an empty bucket list yields
    /// none.
    pub async fn collection(
        config: &GcpConfig,
        settings: ProviderSettings,
    ) -> Result<Vec<GcsProvider>> {
        if config.gcs_buckets.is_empty() {
            return Ok(Vec::new());
        }

        let client_config = if config.gcp_sa_key.is_empty() {
            ClientConfig::default().with_auth().await.map_err(|e| {
                ProviderError::Config(format!("failed to load GCP credentials: {e}"))
            })?
        } else {
            let credentials = CredentialsFile::new_from_file(config.gcp_sa_key.clone())
                .await
                .map_err(|e| {
                    ProviderError::Config(format!(
                        "failed to read service account key {}: {e}",
                        config.gcp_sa_key
                    ))
                })?;
            ClientConfig::default()
                .with_credentials(credentials)
                .await
                .map_err(|e| {
                    ProviderError::Config(format!("failed to load GCP credentials: {e}"))
                })?
        };

        let client = Client::new(client_config);
        Ok(config
            .gcs_buckets
            .iter()
            .map(|bucket| GcsProvider {
                client: client.clone(),
                bucket: bucket.clone(),
                settings,
            })
            .collect())
    }

    async fn list_bucket(&self, prefix: Option<String>, versions: bool) -> Result<Vec<Object>> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects(&ListObjectsRequest {
                    bucket: self.bucket.clone(),
                    prefix: prefix.clone(),
                    versions: Some(versions),
                    page_token: page_token.clone(),
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    ProviderError::Unavailable(format!(
                        "failed to list bucket {}: {e}",
                        self.bucket
                    ))
                })?;

            objects.extend(response.items.unwrap_or_default());
            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        Ok(objects)
    }

    async fn download(&self, object: &str, generation: Option<i64>) -> Result<Vec<u8>> {
        self.client
            .download_object(
                &GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: object.to_string(),
                    generation,
                    ..Default::default()
                },
                &Range::default(),
            )
            .await
            .map_err(|e| {
                ProviderError::Unavailable(format!("failed to download object {object}: {e}"))
            })
    }
}

fn object_time(object: &Object) -> DateTime<Utc> {
    object
        .updated
        .or(object.time_created)
        .and_then(|t| DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()))
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl Provider for GcsProvider {
    fn name(&self) -> String {
        format!("gcs/{}", self.bucket)
    }

    async fn get_states(&self) -> Result<Vec<String>> {
        let mut states: Vec<String> = self
            .list_bucket(None, false)
            .await?
            .into_iter()
            .map(|o| o.name)
            .filter(|name| name.ends_with(STATE_EXTENSION))
            .collect();
        states.sort();
        Ok(states)
    }

    async fn get_versions(&self, path: &str) -> Result<Vec<Version>> {
        if self.settings.no_versioning {
            let object = self
                .client
                .get_object(&GetObjectRequest {
                    bucket: self.bucket.clone(),
                    object: path.to_string(),
                    ..Default::default()
                })
                .await
                .map_err(|e| {
                    ProviderError::Unavailable(format!("failed to stat object {path}: {e}"))
                })?;
            return Ok(vec![Version::current(object_time(&object))]);
        }

        let mut versions: Vec<Version> = self
            .list_bucket(Some(path.to_string()), true)
            .await?
            .into_iter()
            .filter(|o| o.name == path)
            .map(|o| Version {
                id: o.generation.to_string(),
                last_modified: object_time(&o),
            })
            .collect();
        versions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(versions)
    }

    async fn get_state(&self, path: &str, version_id: &str) -> Result<statefile::Document> {
        let generation = if version_id.is_empty() || version_id == "current" {
            None
        } else {
            Some(version_id.parse::<i64>().map_err(|_| {
                ProviderError::NotFound(format!("invalid object generation {version_id}"))
            })?)
        };

        let data = self.download(path, generation).await?;
        Ok(statefile::read(&data)?)
    }

    async fn get_locks(&self) -> Result<HashMap<String, LockInfo>> {
        if self.settings.no_locks {
            return Ok(HashMap::new());
        }

        let mut locks = HashMap::new();
        let lock_objects: Vec<String> = self
            .list_bucket(None, false)
            .await?
            .into_iter()
            .map(|o| o.name)
            .filter(|name| name.ends_with(LOCK_EXTENSION))
            .collect();

        for name in lock_objects {
            let data = self.download(&name, None).await?;
            let path = name.trim_end_matches(LOCK_EXTENSION).to_string();
            match serde_json::from_slice::<RawLockPayload>(&data) {
                Ok(payload) => {
                    let lock = payload.into_lock_info(&name, &path);
                    locks.insert(path, lock);
                }
                Err(e) => {
                    warn!(object = %name, error = %e, "Skipping unparseable lock object");
                }
            }
        }

        Ok(locks)
    }
}
