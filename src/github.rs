use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

const PER_PAGE: u32 = 100;

/// Error from a GitHub API call. Several query domains branch on the HTTP
/// status, so it is carried as data instead of being flattened into a
/// message.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to read GitHub API response: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to decode GitHub API response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected GitHub API response shape: {0}")]
    Shape(String),
}

impl ApiError {
    /// HTTP status of the failed call, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ApiError::Status { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawAccount {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct RawCommit {
    /// The GitHub account behind the commit, absent for unmapped authors.
    #[serde(default)]
    pub author: Option<RawAccount>,
    pub commit: RawCommitDetail,
}

#[derive(Debug, Deserialize)]
pub struct RawCommitDetail {
    pub author: RawGitAuthor,
    pub message: String,
    pub tree: RawTree,
    pub verification: RawVerification,
}

#[derive(Debug, Deserialize)]
pub struct RawGitAuthor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct RawTree {
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub struct RawVerification {
    pub verified: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawPullRequest {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub state: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    pub html_url: String,
    #[serde(default)]
    pub labels: Option<Vec<RawLabel>>,
}

#[derive(Debug, Deserialize)]
pub struct RawLabel {
    pub name: String,
}

/// An issue-search hit. Search results carry the PR link in a nested
/// `pull_request` object rather than a top level `html_url`.
#[derive(Debug, Deserialize)]
pub struct RawSearchIssue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub pull_request: Option<RawPullRequestRef>,
}

#[derive(Debug, Deserialize)]
pub struct RawPullRequestRef {
    pub html_url: String,
}

/// A workflow run reduced to the fields the exporter forwards.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawWorkflowRun {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub workflow_id: i64,
    pub run_number: i64,
    pub event: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub html_url: String,
}

#[derive(Debug, Deserialize)]
pub struct RawDependabotAlert {
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub dependency: Value,
    pub security_advisory: RawSecurityAdvisory,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawSecurityAdvisory {
    #[serde(default)]
    pub ghsa_id: Option<String>,
    #[serde(default)]
    pub cve_id: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub cvss: Value,
    #[serde(default)]
    pub cwes: Value,
}

#[derive(Debug, Deserialize)]
pub struct RawCodespace {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub environment_id: Option<String>,
    pub owner: RawAccount,
    pub billable_owner: RawAccount,
    pub repository: RawRepoRef,
    #[serde(default)]
    pub machine: Option<RawMachine>,
    #[serde(default)]
    pub prebuild: Value,
    #[serde(default)]
    pub devcontainer_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_used_at: Option<String>,
    pub state: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub idle_timeout_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RawRepoRef {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct RawMachine {
    pub name: String,
    pub display_name: String,
    pub operating_system: String,
    pub storage_in_bytes: i64,
    pub memory_in_bytes: i64,
    pub cpus: i64,
}

/// The slice of the GitHub API the query layer uses. Implemented by
/// [`GitHubClient`]; tests substitute stubs.
pub trait GitHubApi {
    fn get_repository(&self, owner: &str, repo: &str) -> Result<Value, ApiError>;
    fn get_branch_protection(&self, owner: &str, repo: &str, branch: &str)
        -> Result<Value, ApiError>;
    fn list_commits(&self, owner: &str, repo: &str, since: &str)
        -> Result<Vec<RawCommit>, ApiError>;
    fn list_dependabot_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<RawDependabotAlert>, ApiError>;
    fn list_code_scanning_alerts(&self, owner: &str, repo: &str) -> Result<Vec<Value>, ApiError>;
    fn search_prs(&self, query: &str) -> Result<Vec<RawSearchIssue>, ApiError>;
    /// One page of the PR list, sorted by update time descending. Paging is
    /// left to the caller so it can stop early.
    fn list_pulls_page(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawPullRequest>, ApiError>;
    fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        created: &str,
    ) -> Result<Vec<RawWorkflowRun>, ApiError>;
    fn list_org_members(&self, org: &str) -> Result<Vec<Value>, ApiError>;
    fn list_org_codespaces(&self, org: &str) -> Result<Vec<RawCodespace>, ApiError>;
}

/// Client for interacting with the GitHub API
pub struct GitHubClient {
    api_base: String,
    token: String,
}

impl GitHubClient {
    /// Create a new GitHub client
    pub fn new(host: String, token: String) -> Self {
        let api_base = if host == "github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("https://{host}/api/v3")
        };
        GitHubClient { api_base, token }
    }

    /// Make a GET request to the GitHub API with optional query parameters
    fn api_get(
        &self,
        path_segments: &[&str],
        query_params: &[(&str, &str)],
    ) -> Result<ureq::Response, ApiError> {
        let mut url = Url::parse(&self.api_base)?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ApiError::Shape("Failed to set URL path segments".to_string()))?;
            segments.extend(path_segments);
        }
        if !query_params.is_empty() {
            let mut query_pairs = url.query_pairs_mut();
            for (key, value) in query_params {
                query_pairs.append_pair(key, value);
            }
        }

        let result = ureq::get(url.as_str())
            .set("Authorization", &format!("Bearer {}", &self.token))
            .set("User-Agent", "ghmeta")
            .set("Accept", "application/vnd.github+json")
            .call();
        match result {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(status, resp)) => {
                let message = resp.into_string().unwrap_or_default();
                Err(ApiError::Status { status, message })
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(ApiError::Transport(transport.to_string()))
            }
        }
    }

    fn get_json(&self, path_segments: &[&str]) -> Result<Value, ApiError> {
        let body: Value = self.api_get(path_segments, &[])?.into_json()?;
        Ok(body)
    }

    /// Fetch every page of a list endpoint. Some endpoints return a bare
    /// array, others wrap it in an object under `envelope_key`.
    fn get_paginated(
        &self,
        path_segments: &[&str],
        query_params: &[(&str, &str)],
        envelope_key: Option<&str>,
    ) -> Result<Vec<Value>, ApiError> {
        let mut items = Vec::new();
        let per_page = PER_PAGE.to_string();
        let mut page: u32 = 1;
        loop {
            let page_str = page.to_string();
            let mut params: Vec<(&str, &str)> = query_params.to_vec();
            params.push(("per_page", &per_page));
            params.push(("page", &page_str));
            let body: Value = self.api_get(path_segments, &params)?.into_json()?;
            let page_items = match envelope_key {
                Some(key) => body
                    .get(key)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| {
                        ApiError::Shape(format!("expected an array under '{key}'"))
                    })?,
                None => body
                    .as_array()
                    .cloned()
                    .ok_or_else(|| ApiError::Shape("expected a JSON array".to_string()))?,
            };
            let count = page_items.len();
            items.extend(page_items);
            if count < PER_PAGE as usize {
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    fn get_paginated_as<T: DeserializeOwned>(
        &self,
        path_segments: &[&str],
        query_params: &[(&str, &str)],
        envelope_key: Option<&str>,
    ) -> Result<Vec<T>, ApiError> {
        let items = self.get_paginated(path_segments, query_params, envelope_key)?;
        let typed = serde_json::from_value(Value::Array(items))?;
        Ok(typed)
    }
}

impl GitHubApi for GitHubClient {
    fn get_repository(&self, owner: &str, repo: &str) -> Result<Value, ApiError> {
        self.get_json(&["repos", owner, repo])
    }

    fn get_branch_protection(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Value, ApiError> {
        self.get_json(&["repos", owner, repo, "branches", branch, "protection"])
    }

    fn list_commits(
        &self,
        owner: &str,
        repo: &str,
        since: &str,
    ) -> Result<Vec<RawCommit>, ApiError> {
        self.get_paginated_as(
            &["repos", owner, repo, "commits"],
            &[("since", since)],
            None,
        )
    }

    fn list_dependabot_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<RawDependabotAlert>, ApiError> {
        self.get_paginated_as(&["repos", owner, repo, "dependabot", "alerts"], &[], None)
    }

    fn list_code_scanning_alerts(&self, owner: &str, repo: &str) -> Result<Vec<Value>, ApiError> {
        self.get_paginated(
            &["repos", owner, repo, "code-scanning", "alerts"],
            &[("state", "open")],
            None,
        )
    }

    fn search_prs(&self, query: &str) -> Result<Vec<RawSearchIssue>, ApiError> {
        self.get_paginated_as(&["search", "issues"], &[("q", query)], Some("items"))
    }

    fn list_pulls_page(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<RawPullRequest>, ApiError> {
        let page_str = page.to_string();
        let per_page_str = per_page.to_string();
        let resp = self.api_get(
            &["repos", owner, repo, "pulls"],
            &[
                ("state", "all"),
                ("sort", "updated"),
                ("direction", "desc"),
                ("per_page", &per_page_str),
                ("page", &page_str),
            ],
        )?;
        let pulls: Vec<RawPullRequest> = resp.into_json()?;
        Ok(pulls)
    }

    fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        created: &str,
    ) -> Result<Vec<RawWorkflowRun>, ApiError> {
        self.get_paginated_as(
            &["repos", owner, repo, "actions", "runs"],
            &[("created", created)],
            Some("workflow_runs"),
        )
    }

    fn list_org_members(&self, org: &str) -> Result<Vec<Value>, ApiError> {
        self.get_paginated(&["orgs", org, "members"], &[], None)
    }

    fn list_org_codespaces(&self, org: &str) -> Result<Vec<RawCodespace>, ApiError> {
        self.get_paginated_as(&["orgs", org, "codespaces"], &[], Some("codespaces"))
    }
}
