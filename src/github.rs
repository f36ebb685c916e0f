//! GitHub API client for star import and metadata refresh.
//!
//! Both uses are optional phases of a sync, so nothing here retries: a
//! failure is reported and the phase degrades to a warning.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::GitHubConfig;
use crate::error::HostError;

const API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

/// A repository the user has starred.
#[derive(Debug, Clone, PartialEq)]
pub struct StarredRepo {
    pub clone_url: String,
    pub description: Option<String>,
    pub topics: Vec<String>,
    pub starred_at: Option<String>,
}

/// Description and topics as currently published by the host.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RepoMetadata {
    pub description: Option<String>,
    pub topics: Vec<String>,
}

#[async_trait]
pub trait HostApi: Send + Sync {
    async fn starred_repos(&self) -> Result<Vec<StarredRepo>, HostError>;
    async fn repo_metadata(&self, owner: &str, repo: &str) -> Result<RepoMetadata, HostError>;
}

pub struct GitHubClient {
    client: reqwest::Client,
    token: Option<String>,
    api_base: String,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> Result<Self, HostError> {
        Self::with_base(config, API_BASE)
    }

    pub fn with_base(config: &GitHubConfig, api_base: &str) -> Result<Self, HostError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("clones/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            token: config.token.clone().filter(|t| !t.trim().is_empty()),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str, accept: &str) -> Result<reqwest::Response, HostError> {
        let mut req = self
            .client
            .get(format!("{}{}", self.api_base, path))
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req.send().await?;
        check_status(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(HostError::InvalidToken),
        StatusCode::FORBIDDEN => Err(HostError::RateLimited),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(HostError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            })
        }
    }
}

#[derive(Deserialize)]
struct StarItem {
    starred_at: Option<String>,
    repo: ApiRepo,
}

#[derive(Deserialize)]
struct ApiRepo {
    clone_url: String,
    description: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
}

#[async_trait]
impl HostApi for GitHubClient {
    async fn starred_repos(&self) -> Result<Vec<StarredRepo>, HostError> {
        if self.token.is_none() {
            return Err(HostError::NotConfigured("star import requires a token"));
        }

        let mut out = Vec::new();
        for page in 1.. {
            let path = format!("/user/starred?per_page={}&page={}", PER_PAGE, page);
            let items: Vec<StarItem> = self
                .get(&path, "application/vnd.github.star+json")
                .await?
                .json()
                .await?;
            let last_page = items.len() < PER_PAGE;
            out.extend(items.into_iter().map(|item| StarredRepo {
                clone_url: item.repo.clone_url,
                description: item.repo.description,
                topics: item.repo.topics,
                starred_at: item.starred_at,
            }));
            if last_page {
                break;
            }
        }
        tracing::debug!(count = out.len(), "fetched starred repositories");
        Ok(out)
    }

    async fn repo_metadata(&self, owner: &str, repo: &str) -> Result<RepoMetadata, HostError> {
        let path = format!("/repos/{}/{}", owner, repo);
        let api: ApiRepo = self
            .get(&path, "application/vnd.github+json")
            .await?
            .json()
            .await?;
        Ok(RepoMetadata {
            description: api.description.filter(|d| !d.trim().is_empty()),
            topics: api.topics,
        })
    }
}
