//! GitLab managed-state provider.
//!
//! Terraform states of all member projects are enumerated through the
//! GraphQL API; documents are downloaded through the project
//! state-storage endpoint. A state path is `<project full path>/<state
//! name>`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::{LockInfo, Provider, ProviderError, ProviderSettings, Result, Version};

fn default_address() -> String {
    "https://gitlab.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitlabConfig {
    pub address: String,
    pub token: String,
}

impl Default for GitlabConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            token: String::new(),
        }
    }
}

pub struct GitlabProvider {
    client: reqwest::Client,
    address: String,
    settings: ProviderSettings,
}

const LIST_STATES_QUERY: &str = r#"
query($after: String) {
  projects(membership: true, first: 100, after: $after) {
    nodes {
      fullPath
      terraformStates {
        nodes {
          name
          latestVersion { serial updatedAt }
          lockedAt
          lockedByUser { username }
        }
      }
    }
    pageInfo { hasNextPage endCursor }
  }
}"#;

const STATE_VERSIONS_QUERY: &str = r#"
query($fullPath: ID!, $name: String!) {
  project(fullPath: $fullPath) {
    terraformState(name: $name) {
      versions(first: 100) {
        nodes { serial createdAt }
      }
    }
  }
}"#;

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProjectsData {
    projects: ProjectsConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectsConnection {
    nodes: Vec<ProjectNode>,
    page_info: PageInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectNode {
    full_path: String,
    terraform_states: Option<StatesConnection>,
}

#[derive(Debug, Deserialize)]
struct StatesConnection {
    nodes: Vec<StateNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateNode {
    name: String,
    locked_at: Option<DateTime<Utc>>,
    locked_by_user: Option<UserNode>,
}

#[derive(Debug, Deserialize)]
struct UserNode {
    username: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectData {
    project: Option<ProjectStateData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectStateData {
    terraform_state: Option<StateVersionsData>,
}

#[derive(Debug, Deserialize)]
struct StateVersionsData {
    versions: VersionsConnection,
}

#[derive(Debug, Deserialize)]
struct VersionsConnection {
    nodes: Vec<VersionNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionNode {
    serial: i64,
    created_at: Option<DateTime<Utc>>,
}

/// Split `group/project/state-name` into project path and state name.
fn split_state_path(path: &str) -> Result<(&str, &str)> {
    path.rsplit_once('/')
        .ok_or_else(|| ProviderError::NotFound(format!("malformed GitLab state path {path}")))
}

impl GitlabProvider {
    /// Returns `Ok(None)` without a token.
    pub fn new(config: &GitlabConfig, settings: ProviderSettings) -> Result<Option<Self>> {
        if config.token.is_empty() {
            return Ok(None);
        }

        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(&config.token)
            .map_err(|_| ProviderError::Config("invalid GitLab token".to_string()))?;
        token.set_sensitive(true);
        headers.insert("PRIVATE-TOKEN", token);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build GitLab client: {e}")))?;

        Ok(Some(Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
            settings,
        }))
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(format!("{}/api/graphql", self.address))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("GitLab request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "GitLab GraphQL API returned {}",
                response.status()
            )));
        }

        let body: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("invalid GitLab response: {e}")))?;

        if let Some(error) = body.errors.first() {
            return Err(ProviderError::Unavailable(format!(
                "GitLab GraphQL error: {}",
                error.message
            )));
        }
        body.data
            .ok_or_else(|| ProviderError::Unavailable("empty GitLab GraphQL response".to_string()))
    }

    async fn list_projects(&self) -> Result<Vec<ProjectNode>> {
        let mut nodes = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let data: ProjectsData = self
                .graphql(LIST_STATES_QUERY, json!({ "after": cursor }))
                .await?;
            nodes.extend(data.projects.nodes);

            if !data.projects.page_info.has_next_page {
                break;
            }
            cursor = data.projects.page_info.end_cursor;
        }

        Ok(nodes)
    }

    fn state_url(&self, project: &str, name: &str) -> String {
        format!(
            "{}/api/v4/projects/{}/terraform/state/{name}",
            self.address,
            project.replace('/', "%2F")
        )
    }
}

#[async_trait::async_trait]
impl Provider for GitlabProvider {
    fn name(&self) -> String {
        format!("gitlab/{}", self.address)
    }

    async fn get_states(&self) -> Result<Vec<String>> {
        let mut states = Vec::new();
        for project in self.list_projects().await? {
            let Some(connection) = project.terraform_states else {
                continue;
            };
            for state in connection.nodes {
                states.push(format!("{}/{}", project.full_path, state.name));
            }
        }
        Ok(states)
    }

    async fn get_versions(&self, path: &str) -> Result<Vec<Version>> {
        let (project, name) = split_state_path(path)?;
        let data: ProjectData = self
            .graphql(
                STATE_VERSIONS_QUERY,
                json!({ "fullPath": project, "name": name }),
            )
            .await?;

        let mut versions: Vec<Version> = data
            .project
            .and_then(|p| p.terraform_state)
            .map(|s| s.versions.nodes)
            .unwrap_or_default()
            .into_iter()
            .map(|v| Version {
                id: v.serial.to_string(),
                last_modified: v.created_at.unwrap_or_default(),
            })
            .collect();
        versions.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        Ok(versions)
    }

    async fn get_state(&self, path: &str, version_id: &str) -> Result<statefile::Document> {
        let (project, name) = split_state_path(path)?;
        let mut url = self.state_url(project, name);
        if !version_id.is_empty() && version_id != "current" {
            url = format!("{url}/versions/{version_id}");
        }

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("state download failed: {e}")))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "GitLab state endpoint returned {status} for {path}"
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("state download failed: {e}")))?;

        Ok(statefile::read(&body)?)
    }

    async fn get_locks(&self) -> Result<HashMap<String, LockInfo>> {
        if self.settings.no_locks {
            return Ok(HashMap::new());
        }

        let mut locks = HashMap::new();
        for project in self.list_projects().await? {
            let Some(connection) = project.terraform_states else {
                continue;
            };
            for state in connection.nodes {
                let Some(locked_at) = state.locked_at else {
                    continue;
                };
                let path = format!("{}/{}", project.full_path, state.name);
                locks.insert(
                    path.clone(),
                    LockInfo {
                        id: path.clone(),
                        path,
                        operation: "lock".to_string(),
                        who: state
                            .locked_by_user
                            .map(|u| u.username)
                            .unwrap_or_default(),
                        created: Some(locked_at),
                        ..Default::default()
                    },
                );
            }
        }

        Ok(locks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_token_yields_no_provider() {
        let provider =
            GitlabProvider::new(&GitlabConfig::default(), ProviderSettings::default()).unwrap();
        assert!(provider.is_none());
    }

    #[test]
    fn state_path_splits_into_project_and_name() {
        let (project, name) = split_state_path("group/app/production").unwrap();
        assert_eq!(project, "group/app");
        assert_eq!(name, "production");

        assert!(split_state_path("no-slash").is_err());
    }

    #[test]
    fn projects_payload_parses_states_and_locks() {
        let body: GraphQlResponse<ProjectsData> = serde_json::from_str(
            r#"{
              "data": {
                "projects": {
                  "nodes": [
                    {
                      "fullPath": "group/app",
                      "terraformStates": {
                        "nodes": [
                          {
                            "name": "production",
                            "latestVersion": {"serial": 12, "updatedAt": "2024-05-01T10:00:00Z"},
                            "lockedAt": "2024-05-01T11:00:00Z",
                            "lockedByUser": {"username": "alice"}
                          },
                          {
                            "name": "staging",
                            "latestVersion": null,
                            "lockedAt": null,
                            "lockedByUser": null
                          }
                        ]
                      }
                    }
                  ],
                  "pageInfo": {"hasNextPage": false, "endCursor": null}
                }
              }
            }"#,
        )
        .unwrap();

        let data = body.data.unwrap();
        assert_eq!(data.projects.nodes.len(), 1);
        let states = data.projects.nodes[0].terraform_states.as_ref().unwrap();
        assert_eq!(states.nodes.len(), 2);
        assert!(states.nodes[0].locked_at.is_some());
        assert_eq!(
            states.nodes[0].locked_by_user.as_ref().unwrap().username,
            "alice"
        );
        assert!(states.nodes[1].locked_at.is_none());
    }

    #[test]
    fn graphql_errors_are_detected() {
        let body: GraphQlResponse<ProjectsData> = serde_json::from_str(
            r#"{"data": null, "errors": [{"message": "insufficient permissions"}]}"#,
        )
        .unwrap();
        assert!(body.data.is_none());
        assert_eq!(body.errors[0].message, "insufficient permissions");
    }
}
