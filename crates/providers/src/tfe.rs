//! Terraform Cloud / Enterprise provider.
//!
//! Workspaces of one organization enumerate as state paths; versions
//! come from the state-versions API and documents are downloaded via
//! their hosted state URL. Locks mirror workspace lock status.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::{LockInfo, Provider, ProviderError, ProviderSettings, Result, Version};

fn default_address() -> String {
    "https://app.terraform.io".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TfeConfig {
    pub address: String,
    pub token: String,
    pub organization: String,
}

impl Default for TfeConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            token: String::new(),
            organization: String::new(),
        }
    }
}

pub struct TfeProvider {
    client: reqwest::Client,
    address: String,
    organization: String,
    settings: ProviderSettings,
}

// JSON:API wire shapes, limited to the fields consumed here.

#[derive(Debug, Deserialize)]
struct ApiList<T> {
    data: Vec<T>,
    #[serde(default)]
    meta: Option<ApiMeta>,
}

#[derive(Debug, Deserialize)]
struct ApiSingle<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ApiMeta {
    #[serde(default)]
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(rename = "next-page")]
    next_page: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Workspace {
    id: String,
    attributes: WorkspaceAttributes,
}

#[derive(Debug, Deserialize)]
struct WorkspaceAttributes {
    name: String,
    #[serde(default)]
    locked: bool,
}

#[derive(Debug, Deserialize)]
struct StateVersion {
    id: String,
    attributes: StateVersionAttributes,
}

#[derive(Debug, Deserialize)]
struct StateVersionAttributes {
    #[serde(rename = "created-at")]
    created_at: Option<DateTime<Utc>>,
    #[serde(rename = "hosted-state-download-url", default)]
    hosted_state_download_url: String,
}

impl TfeProvider {
    /// Returns `Ok(None)` without a token or organization.
    pub fn new(config: &TfeConfig, settings: ProviderSettings) -> Result<Option<Self>> {
        if config.token.is_empty() || config.organization.is_empty() {
            return Ok(None);
        }

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| ProviderError::Config("invalid TFE token".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/vnd.api+json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build TFE client: {e}")))?;

        Ok(Some(Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
            organization: config.organization.clone(),
            settings,
        }))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("TFE request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "TFE API returned {status} for {url}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("invalid TFE response: {e}")))
    }

    async fn workspaces(&self) -> Result<Vec<Workspace>> {
        let url = format!(
            "{}/api/v2/organizations/{}/workspaces",
            self.address, self.organization
        );
        let mut workspaces = Vec::new();
        let mut page = 1u64;

        loop {
            let body: ApiList<Workspace> = self
                .get_json(
                    &url,
                    &[
                        ("page[size]", "100".to_string()),
                        ("page[number]", page.to_string()),
                    ],
                )
                .await?;
            workspaces.extend(body.data);

            match body.meta.and_then(|m| m.pagination).and_then(|p| p.next_page) {
                Some(next) => page = next,
                None => break,
            }
        }

        Ok(workspaces)
    }

    async fn workspace_by_name(&self, name: &str) -> Result<Workspace> {
        let url = format!(
            "{}/api/v2/organizations/{}/workspaces/{name}",
            self.address, self.organization
        );
        let body: ApiSingle<Workspace> = self.get_json(&url, &[]).await?;
        Ok(body.data)
    }

    async fn download_state(&self, state_version: &StateVersion) -> Result<statefile::Document> {
        if state_version.attributes.hosted_state_download_url.is_empty() {
            return Err(ProviderError::Unavailable(format!(
                "state version {} has no download URL",
                state_version.id
            )));
        }

        let response = self
            .client
            .get(&state_version.attributes.hosted_state_download_url)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("state download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "state download returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("state download failed: {e}")))?;

        Ok(statefile::read(&body)?)
    }
}

#[async_trait::async_trait]
impl Provider for TfeProvider {
    fn name(&self) -> String {
        format!("tfe/{}", self.organization)
    }

    async fn get_states(&self) -> Result<Vec<String>> {
        Ok(self
            .workspaces()
            .await?
            .into_iter()
            .map(|w| w.attributes.name)
            .collect())
    }

    async fn get_versions(&self, path: &str) -> Result<Vec<Version>> {
        let url = format!("{}/api/v2/state-versions", self.address);
        let body: ApiList<StateVersion> = self
            .get_json(
                &url,
                &[
                    ("filter[workspace][name]", path.to_string()),
                    ("filter[organization][name]", self.organization.clone()),
                    ("page[size]", "100".to_string()),
                ],
            )
            .await?;

        // The API already returns newest first.
        Ok(body
            .data
            .into_iter()
            .map(|sv| Version {
                id: sv.id,
                last_modified: sv.attributes.created_at.unwrap_or_default(),
            })
            .collect())
    }

    async fn get_state(&self, path: &str, version_id: &str) -> Result<statefile::Document> {
        let state_version = if version_id.is_empty() || version_id == "current" {
            let workspace = self.workspace_by_name(path).await?;
            let url = format!(
                "{}/api/v2/workspaces/{}/current-state-version",
                self.address, workspace.id
            );
            let body: ApiSingle<StateVersion> = self.get_json(&url, &[]).await?;
            body.data
        } else {
            let url = format!("{}/api/v2/state-versions/{version_id}", self.address);
            let body: ApiSingle<StateVersion> = self.get_json(&url, &[]).await?;
            body.data
        };

        self.download_state(&state_version).await
    }

    async fn get_locks(&self) -> Result<HashMap<String, LockInfo>> {
        if self.settings.no_locks {
            return Ok(HashMap::new());
        }

        let mut locks = HashMap::new();
        for workspace in self.workspaces().await? {
            if !workspace.attributes.locked {
                continue;
            }
            let path = workspace.attributes.name;
            locks.insert(
                path.clone(),
                LockInfo {
                    id: workspace.id,
                    path,
                    operation: "lock".to_string(),
                    ..Default::default()
                },
            );
        }

        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_yields_no_provider() {
        let provider = TfeProvider::new(
            &TfeConfig {
                organization: "acme".to_string(),
                ..Default::default()
            },
            ProviderSettings::default(),
        )
        .unwrap();
        assert!(provider.is_none());
    }

    #[test]
    fn missing_organization_yields_no_provider() {
        let provider = TfeProvider::new(
            &TfeConfig {
                token: "token".to_string(),
                ..Default::default()
            },
            ProviderSettings::default(),
        )
        .unwrap();
        assert!(provider.is_none());
    }

    #[test]
    fn workspace_list_parses_json_api_payload() {
        let body: ApiList<Workspace> = serde_json::from_str(
            r#"{
              "data": [
                {"id": "ws-1", "type": "workspaces", "attributes": {"name": "prod", "locked": true}},
                {"id": "ws-2", "type": "workspaces", "attributes": {"name": "staging"}}
              ],
              "meta": {"pagination": {"current-page": 1, "next-page": null, "total-pages": 1}}
            }"#,
        )
        .unwrap();

        assert_eq!(body.data.len(), 2);
        assert_eq!(body.data[0].attributes.name, "prod");
        assert!(body.data[0].attributes.locked);
        assert!(!body.data[1].attributes.locked);
        assert!(body
            .meta
            .and_then(|m| m.pagination)
            .and_then(|p| p.next_page)
            .is_none());
    }

    #[test]
    fn state_version_parses_download_url() {
        let body: ApiSingle<StateVersion> = serde_json::from_str(
            r#"{
              "data": {
                "id": "sv-42",
                "type": "state-versions",
                "attributes": {
                  "serial": 7,
                  "created-at": "2024-05-01T12:00:00Z",
                  "hosted-state-download-url": "https://archivist.example.com/v1/object/abc"
                }
              }
            }"#,
        )
        .unwrap();

        assert_eq!(body.data.id, "sv-42");
        assert!(body.data.attributes.created_at.is_some());
        assert!(body
            .data
            .attributes
            .hosted_state_download_url
            .starts_with("https://"));
    }
}
