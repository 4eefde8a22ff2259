use std::path::Path;

use anyhow::{anyhow, Result};
use log::{error, warn};
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

use crate::github::{
    ApiError, GitHubApi, RawCodespace, RawCommit, RawDependabotAlert, RawPullRequest,
    RawSearchIssue,
};
use crate::workflow_files;

/// Files every repository is expected to carry at its root.
pub const REQUIRED_FILES: [&str; 5] = [
    "README.md",
    "LICENSE",
    "CODE_OF_CONDUCT.md",
    "CONTRIBUTING.md",
    "SECURITY.md",
];

const PR_PAGE_SIZE: u32 = 100;

fn envelope(owner: &str, repo: Option<&str>, query: &str) -> Map<String, Value> {
    let mut result = Map::new();
    result.insert("metadata_owner".to_string(), json!(owner));
    if let Some(repo) = repo {
        result.insert("metadata_repo".to_string(), json!(repo));
    }
    result.insert("metadata_query".to_string(), json!(query));
    result
}

/// Status code when the server answered, full error text otherwise.
fn status_label(err: &ApiError) -> String {
    match err.status() {
        Some(code) => code.to_string(),
        None => err.to_string(),
    }
}

pub fn query_repository(api: &dyn GitHubApi, owner: &str, repo: &str) -> Result<Value> {
    let data = api.get_repository(owner, repo).map_err(|err| {
        anyhow!(
            "Error querying repository {owner}/{repo}: {}",
            status_label(&err)
        )
    })?;
    let mut result = envelope(owner, Some(repo), "repository");
    if let Value::Object(fields) = data {
        result.extend(fields);
    }
    Ok(Value::Object(result))
}

/// A repository with no protection rule configured answers 404; that is a
/// valid state, not a failure.
pub fn query_branch_protection(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    branch: &str,
) -> Result<Value> {
    let mut result = envelope(owner, Some(repo), "branch_protection");
    result.insert("metadata_branch".to_string(), json!(branch));
    match api.get_branch_protection(owner, repo, branch) {
        Ok(data) => {
            if let Value::Object(fields) = data {
                result.extend(fields);
            }
            Ok(Value::Object(result))
        }
        Err(err) if err.status() == Some(404) => {
            result.insert("enabled".to_string(), json!(false));
            Ok(Value::Object(result))
        }
        Err(err) => Err(anyhow!(
            "Failed to get branch protection for {branch} on {owner}/{repo}: {}",
            status_label(&err)
        )),
    }
}

pub fn query_commits(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    time_in_days: u32,
) -> Result<Value> {
    query_commits_at(api, owner, repo, time_in_days, OffsetDateTime::now_utc())
}

pub fn query_commits_at(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    time_in_days: u32,
    now: OffsetDateTime,
) -> Result<Value> {
    let since = (now - Duration::days(i64::from(time_in_days))).format(&Rfc3339)?;
    let commits = api.list_commits(owner, repo, &since).map_err(|err| {
        anyhow!(
            "Error querying commit history for repository {owner}/{repo}: {}",
            status_label(&err)
        )
    })?;
    let flattened: Vec<Value> = commits.iter().map(flatten_commit).collect();

    let mut result = envelope(owner, Some(repo), "commit_count");
    result.insert("metadata_time_in_days".to_string(), json!(time_in_days));
    result.insert("metadata_since".to_string(), json!(since));
    result.insert("commit_count".to_string(), json!(flattened.len()));
    result.insert("commits".to_string(), Value::Array(flattened));
    Ok(Value::Object(result))
}

fn flatten_commit(commit: &RawCommit) -> Value {
    let author = commit
        .author
        .as_ref()
        .map(|account| account.login.clone())
        .or_else(|| commit.commit.author.name.clone());
    json!({
        "author": author,
        "author_email": &commit.commit.author.email,
        "date": &commit.commit.author.date,
        "message": &commit.commit.message,
        "sha": &commit.commit.tree.sha,
        "verified": commit.commit.verification.verified,
        "verified_reason": &commit.commit.verification.reason,
    })
}

/// Existence check against the local checkout. Never fails.
pub fn query_required_files(root: &Path, owner: &str, repo: &str) -> Value {
    let mut result = envelope(owner, Some(repo), "required_files");
    for file in REQUIRED_FILES {
        result.insert(file.to_string(), json!(root.join(file).exists()));
    }
    Value::Object(result)
}

pub fn query_action_dependencies(
    workflows_dir: &Path,
    owner: &str,
    repo: &str,
) -> Result<Value> {
    let dependencies = workflow_files::scan_action_dependencies(workflows_dir)?;
    let mut result = envelope(owner, Some(repo), "action_dependencies");
    result.insert(
        "action_dependencies".to_string(),
        serde_json::to_value(dependencies)?,
    );
    Ok(Value::Object(result))
}

/// Never raises: a repository with the feature disabled, or any other
/// failure, resolves to an empty alert list.
pub fn query_dependabot_alerts(api: &dyn GitHubApi, owner: &str, repo: &str) -> Value {
    let alerts = match api.list_dependabot_alerts(owner, repo) {
        Ok(alerts) => alerts
            .iter()
            .filter(|alert| alert.number.is_some())
            .map(flatten_dependabot_alert)
            .collect(),
        Err(err) => {
            let disabled = err.status() == Some(403)
                && err
                    .message()
                    .is_some_and(|message| message.contains("Dependabot alerts are disabled"));
            if disabled {
                warn!("Dependabot alerts are disabled for {owner}/{repo}");
            } else {
                error!("Failed to get dependabot alerts for {owner}/{repo}: {err}");
            }
            Vec::new()
        }
    };
    let mut result = envelope(owner, Some(repo), "dependabot_alerts");
    result.insert("dependabot_alerts".to_string(), Value::Array(alerts));
    Value::Object(result)
}

fn flatten_dependabot_alert(alert: &RawDependabotAlert) -> Value {
    let advisory = &alert.security_advisory;
    json!({
        "id": alert.number,
        "dependency": &alert.dependency,
        "ghsa_id": &advisory.ghsa_id,
        "cve_id": &advisory.cve_id,
        "severity": &advisory.severity,
        "cvss": &advisory.cvss,
        "cwes": &advisory.cwes,
        "created_at": &alert.created_at,
    })
}

/// 403 and 404 mean code scanning is disabled or inaccessible for the
/// repository; both resolve to an empty alert list.
pub fn query_code_scanning_alerts(api: &dyn GitHubApi, owner: &str, repo: &str) -> Result<Value> {
    let mut result = envelope(owner, Some(repo), "code_scanning_alerts");
    match api.list_code_scanning_alerts(owner, repo) {
        Ok(alerts) => {
            result.insert("code_scanning_alerts".to_string(), Value::Array(alerts));
            Ok(Value::Object(result))
        }
        Err(err) if matches!(err.status(), Some(403) | Some(404)) => {
            result.insert("code_scanning_alerts".to_string(), json!([]));
            Ok(Value::Object(result))
        }
        Err(err) => Err(anyhow!(
            "Failed to get code scanning alerts for {owner}/{repo}: {}",
            status_label(&err)
        )),
    }
}

pub fn query_renovate_prs(api: &dyn GitHubApi, owner: &str, repo: &str) -> Result<Value> {
    let search = format!("repo:{owner}/{repo} is:pr label:renovate");
    let issues = api.search_prs(&search).map_err(|err| {
        anyhow!(
            "Error querying renovate PRs for {owner}/{repo}: {}",
            status_label(&err)
        )
    })?;
    let flattened: Vec<Value> = issues.iter().map(flatten_search_issue).collect();

    let mut result = envelope(owner, Some(repo), "renovate_prs");
    result.insert("renovate_prs".to_string(), Value::Array(flattened));
    Ok(Value::Object(result))
}

fn flatten_search_issue(issue: &RawSearchIssue) -> Value {
    json!({
        "id": issue.id,
        "number": issue.number,
        "title": &issue.title,
        "created_at": &issue.created_at,
        "updated_at": &issue.updated_at,
        "closed_at": &issue.closed_at,
        "html_url": issue.pull_request.as_ref().map(|pr| &pr.html_url),
    })
}

pub fn query_all_prs(api: &dyn GitHubApi, owner: &str, repo: &str) -> Result<Value> {
    query_all_prs_at(api, owner, repo, OffsetDateTime::now_utc())
}

/// PRs whose last update falls on the previous UTC day. The PR list is
/// requested most-recently-updated first, so pagination stops at the first
/// page whose final entry predates the target day.
pub fn query_all_prs_at(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    now: OffsetDateTime,
) -> Result<Value> {
    let day_str = previous_day(now)?;
    let day_start = format!("{day_str}T00:00:00Z");

    let mut prs = Vec::new();
    let mut page: u32 = 1;
    loop {
        let page_items = api
            .list_pulls_page(owner, repo, page, PR_PAGE_SIZE)
            .map_err(|err| {
                anyhow!(
                    "Error querying PRs for {owner}/{repo}: {}",
                    status_label(&err)
                )
            })?;
        if page_items.is_empty() {
            break;
        }
        for pr in &page_items {
            if pr.updated_at.starts_with(&day_str) {
                prs.push(flatten_pull_request(pr));
            }
        }
        let page_exhausts_window = page_items
            .last()
            .is_some_and(|last| last.updated_at.as_str() < day_start.as_str());
        if page_exhausts_window || page_items.len() < PR_PAGE_SIZE as usize {
            break;
        }
        page += 1;
    }

    let mut result = envelope(owner, Some(repo), "all_prs");
    result.insert("prs".to_string(), Value::Array(prs));
    Ok(Value::Object(result))
}

fn flatten_pull_request(pr: &RawPullRequest) -> Value {
    let labels: Vec<String> = pr
        .labels
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|label| label.name.clone())
        .collect();
    json!({
        "id": pr.id,
        "number": pr.number,
        "title": &pr.title,
        "state": &pr.state,
        "created_at": &pr.created_at,
        "updated_at": &pr.updated_at,
        "closed_at": &pr.closed_at,
        "html_url": &pr.html_url,
        "labels": labels,
    })
}

pub fn query_workflows(api: &dyn GitHubApi, owner: &str, repo: &str) -> Result<Value> {
    query_workflows_at(api, owner, repo, OffsetDateTime::now_utc())
}

/// Workflow runs created during the previous UTC day. The created window is
/// also enforced client-side to guard against off-by-one responses.
pub fn query_workflows_at(
    api: &dyn GitHubApi,
    owner: &str,
    repo: &str,
    now: OffsetDateTime,
) -> Result<Value> {
    let day_str = previous_day(now)?;
    let created = format!("{day_str}T00:00:00Z..{day_str}T23:59:59Z");
    let runs = api
        .list_workflow_runs(owner, repo, &created)
        .map_err(|err| {
            anyhow!(
                "Error querying workflow runs for {owner}/{repo}: {}",
                status_label(&err)
            )
        })?;
    let kept: Vec<_> = runs
        .into_iter()
        .filter(|run| run.created_at.starts_with(&day_str))
        .collect();

    let mut result = envelope(owner, Some(repo), "workflows");
    result.insert("workflows".to_string(), serde_json::to_value(kept)?);
    Ok(Value::Object(result))
}

fn previous_day(now: OffsetDateTime) -> Result<String> {
    let day = (now - Duration::days(1)).date();
    let format = format_description!("[year]-[month]-[day]");
    Ok(day.format(&format)?)
}

/// Org members are forwarded as the API returns them.
pub fn query_users(api: &dyn GitHubApi, org: &str) -> Result<Value> {
    let users = api.list_org_members(org).map_err(|err| {
        anyhow!(
            "Error querying org members for {org}: {}",
            status_label(&err)
        )
    })?;
    let mut result = envelope(org, None, "users");
    result.insert("users".to_string(), Value::Array(users));
    Ok(Value::Object(result))
}

pub fn query_codespaces(api: &dyn GitHubApi, org: &str) -> Result<Value> {
    let codespaces = api.list_org_codespaces(org).map_err(|err| {
        anyhow!(
            "Error querying org codespaces for {org}: {}",
            status_label(&err)
        )
    })?;
    let flattened: Vec<Value> = codespaces.iter().map(flatten_codespace).collect();

    let mut result = envelope(org, None, "codespaces");
    result.insert("codespaces".to_string(), Value::Array(flattened));
    Ok(Value::Object(result))
}

fn flatten_codespace(codespace: &RawCodespace) -> Value {
    let machine = codespace.machine.as_ref();
    json!({
        "id": codespace.id,
        "name": &codespace.name,
        "environment_id": &codespace.environment_id,
        "owner": &codespace.owner.login,
        "billable_owner": &codespace.billable_owner.login,
        "repository": &codespace.repository.full_name,
        "machine_name": machine.map(|m| &m.name),
        "machine_display_name": machine.map(|m| &m.display_name),
        "machine_os": machine.map(|m| &m.operating_system),
        "machine_storage_in_bytes": machine.map(|m| m.storage_in_bytes),
        "machine_memory_in_bytes": machine.map(|m| m.memory_in_bytes),
        "machine_cpus": machine.map(|m| m.cpus),
        "prebuild": &codespace.prebuild,
        "devcontainer_path": &codespace.devcontainer_path,
        "created_at": &codespace.created_at,
        "updated_at": &codespace.updated_at,
        "last_used_at": &codespace.last_used_at,
        "state": &codespace.state,
        "location": &codespace.location,
        "idle_timeout_minutes": codespace.idle_timeout_minutes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::RawWorkflowRun;
    use std::cell::{Cell, RefCell};
    use time::macros::datetime;

    type StubResult = Option<Result<Value, (u16, String)>>;

    #[derive(Default)]
    struct StubApi {
        repository: StubResult,
        branch_protection: StubResult,
        commits: StubResult,
        dependabot: StubResult,
        code_scanning: StubResult,
        search: StubResult,
        pull_pages: Vec<Value>,
        pull_page_calls: Cell<usize>,
        workflow_runs: StubResult,
        members: StubResult,
        codespaces: StubResult,
        created_window: RefCell<Option<String>>,
    }

    fn stub_value(slot: &StubResult) -> Result<Value, ApiError> {
        match slot.as_ref().expect("stub not configured") {
            Ok(value) => Ok(value.clone()),
            Err((status, message)) => Err(ApiError::Status {
                status: *status,
                message: message.clone(),
            }),
        }
    }

    fn stub_list<T: serde::de::DeserializeOwned>(slot: &StubResult) -> Result<Vec<T>, ApiError> {
        let value = stub_value(slot)?;
        Ok(serde_json::from_value(value).expect("stub data decodes"))
    }

    impl GitHubApi for StubApi {
        fn get_repository(&self, _owner: &str, _repo: &str) -> Result<Value, ApiError> {
            stub_value(&self.repository)
        }

        fn get_branch_protection(
            &self,
            _owner: &str,
            _repo: &str,
            _branch: &str,
        ) -> Result<Value, ApiError> {
            stub_value(&self.branch_protection)
        }

        fn list_commits(
            &self,
            _owner: &str,
            _repo: &str,
            _since: &str,
        ) -> Result<Vec<RawCommit>, ApiError> {
            stub_list(&self.commits)
        }

        fn list_dependabot_alerts(
            &self,
            _owner: &str,
            _repo: &str,
        ) -> Result<Vec<RawDependabotAlert>, ApiError> {
            stub_list(&self.dependabot)
        }

        fn list_code_scanning_alerts(
            &self,
            _owner: &str,
            _repo: &str,
        ) -> Result<Vec<Value>, ApiError> {
            stub_list(&self.code_scanning)
        }

        fn search_prs(&self, _query: &str) -> Result<Vec<RawSearchIssue>, ApiError> {
            stub_list(&self.search)
        }

        fn list_pulls_page(
            &self,
            _owner: &str,
            _repo: &str,
            _page: u32,
            _per_page: u32,
        ) -> Result<Vec<RawPullRequest>, ApiError> {
            let call = self.pull_page_calls.get();
            self.pull_page_calls.set(call + 1);
            match self.pull_pages.get(call) {
                Some(page) => Ok(serde_json::from_value(page.clone()).expect("stub page decodes")),
                None => Ok(Vec::new()),
            }
        }

        fn list_workflow_runs(
            &self,
            _owner: &str,
            _repo: &str,
            created: &str,
        ) -> Result<Vec<RawWorkflowRun>, ApiError> {
            *self.created_window.borrow_mut() = Some(created.to_string());
            stub_list(&self.workflow_runs)
        }

        fn list_org_members(&self, _org: &str) -> Result<Vec<Value>, ApiError> {
            stub_list(&self.members)
        }

        fn list_org_codespaces(&self, _org: &str) -> Result<Vec<RawCodespace>, ApiError> {
            stub_list(&self.codespaces)
        }
    }

    #[test]
    fn test_repository_success_spreads_fields() {
        let api = StubApi {
            repository: Some(Ok(json!({ "id": "123" }))),
            ..StubApi::default()
        };
        let result = query_repository(&api, "owner", "repo").unwrap();
        assert_eq!(
            result,
            json!({
                "id": "123",
                "metadata_owner": "owner",
                "metadata_repo": "repo",
                "metadata_query": "repository",
            })
        );
    }

    #[test]
    fn test_repository_failure_is_fatal() {
        let api = StubApi {
            repository: Some(Err((400, "Bad Request".to_string()))),
            ..StubApi::default()
        };
        let err = query_repository(&api, "owner", "repo").unwrap_err();
        assert_eq!(err.to_string(), "Error querying repository owner/repo: 400");
    }

    #[test]
    fn test_branch_protection_success() {
        let api = StubApi {
            branch_protection: Some(Ok(json!({ "id": "123" }))),
            ..StubApi::default()
        };
        let result = query_branch_protection(&api, "owner", "repo", "main").unwrap();
        assert_eq!(
            result,
            json!({
                "id": "123",
                "metadata_owner": "owner",
                "metadata_repo": "repo",
                "metadata_query": "branch_protection",
                "metadata_branch": "main",
            })
        );
    }

    #[test]
    fn test_branch_protection_missing_rule_is_not_an_error() {
        let api = StubApi {
            branch_protection: Some(Err((404, "Branch not protected".to_string()))),
            ..StubApi::default()
        };
        let result = query_branch_protection(&api, "owner", "repo", "main").unwrap();
        assert_eq!(
            result,
            json!({
                "metadata_owner": "owner",
                "metadata_repo": "repo",
                "metadata_query": "branch_protection",
                "metadata_branch": "main",
                "enabled": false,
            })
        );
    }

    #[test]
    fn test_branch_protection_other_failure_is_fatal() {
        let api = StubApi {
            branch_protection: Some(Err((400, "Bad Request".to_string()))),
            ..StubApi::default()
        };
        let err = query_branch_protection(&api, "owner", "repo", "main").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to get branch protection for main on owner/repo: 400"
        );
    }

    #[test]
    fn test_branch_protection_custom_branch() {
        let api = StubApi {
            branch_protection: Some(Ok(json!({ "id": "123" }))),
            ..StubApi::default()
        };
        let result = query_branch_protection(&api, "owner", "repo", "develop").unwrap();
        assert_eq!(result["metadata_branch"], "develop");
    }

    #[test]
    fn test_commits_flattened_with_scalar_count() {
        let api = StubApi {
            commits: Some(Ok(json!([
                {
                    "author": { "login": "author" },
                    "commit": {
                        "author": { "email": "author@example.com", "date": "date" },
                        "message": "commit message",
                        "tree": { "sha": "abc123" },
                        "verification": { "verified": true, "reason": "reason" }
                    }
                },
                {
                    "author": { "login": "author" },
                    "commit": {
                        "author": { "email": "author@example.com", "date": "date" },
                        "message": "another commit",
                        "tree": { "sha": "def456" },
                        "verification": { "verified": false, "reason": "bad_signature" }
                    }
                }
            ]))),
            ..StubApi::default()
        };
        let result =
            query_commits_at(&api, "owner", "repo", 60, datetime!(2025-11-21 12:00 UTC)).unwrap();
        assert_eq!(result["metadata_query"], "commit_count");
        assert_eq!(result["metadata_time_in_days"], 60);
        assert_eq!(result["metadata_since"], "2025-09-22T12:00:00Z");
        assert_eq!(result["commit_count"], 2);
        assert_eq!(
            result["commits"],
            json!([
                {
                    "author": "author",
                    "author_email": "author@example.com",
                    "date": "date",
                    "message": "commit message",
                    "sha": "abc123",
                    "verified": true,
                    "verified_reason": "reason",
                },
                {
                    "author": "author",
                    "author_email": "author@example.com",
                    "date": "date",
                    "message": "another commit",
                    "sha": "def456",
                    "verified": false,
                    "verified_reason": "bad_signature",
                }
            ])
        );
    }

    #[test]
    fn test_commits_custom_window() {
        let api = StubApi {
            commits: Some(Ok(json!([]))),
            ..StubApi::default()
        };
        let result =
            query_commits_at(&api, "owner", "repo", 30, datetime!(2025-11-21 12:00 UTC)).unwrap();
        assert_eq!(result["metadata_time_in_days"], 30);
        assert_eq!(result["metadata_since"], "2025-10-22T12:00:00Z");
        assert_eq!(result["commit_count"], 0);
        assert_eq!(result["commits"], json!([]));
    }

    #[test]
    fn test_commits_author_falls_back_to_git_name() {
        let api = StubApi {
            commits: Some(Ok(json!([
                {
                    "author": null,
                    "commit": {
                        "author": {
                            "name": "Git User Name",
                            "email": "test@example.com",
                            "date": "2025-11-15T10:00:00Z"
                        },
                        "message": "test commit",
                        "tree": { "sha": "abc123" },
                        "verification": { "verified": false, "reason": "unsigned" }
                    }
                }
            ]))),
            ..StubApi::default()
        };
        let result = query_commits(&api, "owner", "repo", 60).unwrap();
        assert_eq!(result["commits"][0]["author"], "Git User Name");
        assert_eq!(result["commits"][0]["author_email"], "test@example.com");
    }

    #[test]
    fn test_required_files_inventory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("LICENSE"), "license").unwrap();
        std::fs::write(dir.path().join("README.md"), "readme").unwrap();

        let result = query_required_files(dir.path(), "owner", "repo");
        assert_eq!(
            result,
            json!({
                "LICENSE": true,
                "README.md": true,
                "CODE_OF_CONDUCT.md": false,
                "CONTRIBUTING.md": false,
                "SECURITY.md": false,
                "metadata_owner": "owner",
                "metadata_repo": "repo",
                "metadata_query": "required_files",
            })
        );
    }

    #[test]
    fn test_action_dependencies_envelope() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("test.yml"),
            "jobs:\n  test:\n    steps:\n      - uses: actions/checkout@v3\n",
        )
        .unwrap();

        let result = query_action_dependencies(dir.path(), "owner", "repo").unwrap();
        assert_eq!(result["metadata_query"], "action_dependencies");
        assert_eq!(
            result["action_dependencies"],
            json!([{
                "name": "actions/checkout",
                "ref": "v3",
                "comment": null,
                "file_name": "test.yml",
            }])
        );
    }

    #[test]
    fn test_dependabot_alerts_flattened() {
        let api = StubApi {
            dependabot: Some(Ok(json!([
                {
                    "number": 1,
                    "dependency": { "name": "dependency" },
                    "security_advisory": {
                        "ghsa_id": "ghsa_id",
                        "cve_id": "cve_id",
                        "severity": "severity",
                        "cvss": "cvss",
                        "cwes": "cwes"
                    },
                    "created_at": "created_at"
                }
            ]))),
            ..StubApi::default()
        };
        let result = query_dependabot_alerts(&api, "owner", "repo");
        assert_eq!(
            result,
            json!({
                "metadata_owner": "owner",
                "metadata_repo": "repo",
                "metadata_query": "dependabot_alerts",
                "dependabot_alerts": [{
                    "id": 1,
                    "dependency": { "name": "dependency" },
                    "ghsa_id": "ghsa_id",
                    "cve_id": "cve_id",
                    "severity": "severity",
                    "cvss": "cvss",
                    "cwes": "cwes",
                    "created_at": "created_at",
                }],
            })
        );
    }

    #[test]
    fn test_dependabot_alerts_drops_records_without_number() {
        let api = StubApi {
            dependabot: Some(Ok(json!([
                {
                    "number": 1,
                    "dependency": { "name": "dep1" },
                    "security_advisory": { "ghsa_id": "ghsa1" },
                    "created_at": "2025-01-01"
                },
                {
                    "dependency": { "name": "dep2" },
                    "security_advisory": { "ghsa_id": "ghsa2" },
                    "created_at": "2025-01-02"
                },
                {
                    "number": 3,
                    "dependency": { "name": "dep3" },
                    "security_advisory": { "ghsa_id": "ghsa3" },
                    "created_at": "2025-01-03"
                }
            ]))),
            ..StubApi::default()
        };
        let result = query_dependabot_alerts(&api, "owner", "repo");
        let alerts = result["dependabot_alerts"].as_array().unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0]["id"], 1);
        assert_eq!(alerts[1]["id"], 3);
    }

    #[test]
    fn test_dependabot_alerts_disabled_resolves_empty() {
        let api = StubApi {
            dependabot: Some(Err((
                403,
                "Dependabot alerts are disabled for this repository.".to_string(),
            ))),
            ..StubApi::default()
        };
        let result = query_dependabot_alerts(&api, "owner", "repo");
        assert_eq!(result["dependabot_alerts"], json!([]));
    }

    #[test]
    fn test_dependabot_alerts_never_raises() {
        let api = StubApi {
            dependabot: Some(Err((500, "Internal Server Error".to_string()))),
            ..StubApi::default()
        };
        let result = query_dependabot_alerts(&api, "owner", "repo");
        assert_eq!(result["dependabot_alerts"], json!([]));
    }

    #[test]
    fn test_code_scanning_alerts_passthrough() {
        let api = StubApi {
            code_scanning: Some(Ok(json!([{ "number": 1 }, { "number": 2 }]))),
            ..StubApi::default()
        };
        let result = query_code_scanning_alerts(&api, "owner", "repo").unwrap();
        assert_eq!(
            result,
            json!({
                "metadata_owner": "owner",
                "metadata_repo": "repo",
                "metadata_query": "code_scanning_alerts",
                "code_scanning_alerts": [{ "number": 1 }, { "number": 2 }],
            })
        );
    }

    #[test]
    fn test_code_scanning_alerts_disabled_statuses_resolve_empty() {
        for status in [403, 404] {
            let api = StubApi {
                code_scanning: Some(Err((status, "nope".to_string()))),
                ..StubApi::default()
            };
            let result = query_code_scanning_alerts(&api, "owner", "repo").unwrap();
            assert_eq!(result["code_scanning_alerts"], json!([]));
        }
    }

    #[test]
    fn test_code_scanning_alerts_other_failure_is_fatal() {
        let api = StubApi {
            code_scanning: Some(Err((400, "Bad Request".to_string()))),
            ..StubApi::default()
        };
        let err = query_code_scanning_alerts(&api, "owner", "repo").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to get code scanning alerts for owner/repo: 400"
        );
    }

    #[test]
    fn test_renovate_prs_flattened() {
        let api = StubApi {
            search: Some(Ok(json!([
                {
                    "id": 1474610853i64,
                    "number": 1,
                    "title": "chore(deps): update js-devtools/npm-publish digest to e42e372 - autoclosed",
                    "created_at": "2022-12-04T08:47:37Z",
                    "updated_at": "2022-12-07T17:08:04Z",
                    "closed_at": "2022-12-07T17:08:01Z",
                    "pull_request": { "html_url": "https://www.github.com/owner/repo/pull/1" }
                },
                {
                    "id": 1474610854i64,
                    "number": 2,
                    "title": "chore(deps): update all minor dependencies",
                    "created_at": "2022-12-04T08:47:37Z",
                    "updated_at": "2022-12-07T17:08:04Z",
                    "closed_at": null,
                    "pull_request": { "html_url": "https://www.github.com/owner/repo/pull/2" }
                }
            ]))),
            ..StubApi::default()
        };
        let result = query_renovate_prs(&api, "owner", "repo").unwrap();
        assert_eq!(result["metadata_query"], "renovate_prs");
        let prs = result["renovate_prs"].as_array().unwrap();
        assert_eq!(prs.len(), 2);
        assert_eq!(prs[0]["html_url"], "https://www.github.com/owner/repo/pull/1");
        assert_eq!(prs[1]["closed_at"], Value::Null);
    }

    #[test]
    fn test_all_prs_keeps_target_day_only() {
        let api = StubApi {
            pull_pages: vec![json!([
                {
                    "id": 1,
                    "number": 10,
                    "title": "Recent PR",
                    "state": "open",
                    "created_at": "2025-11-20T10:00:00Z",
                    "updated_at": "2025-11-20T12:00:00Z",
                    "closed_at": null,
                    "html_url": "https://github.com/owner/repo/pull/10",
                    "labels": [{ "name": "bug" }, { "name": "urgent" }]
                },
                {
                    "id": 2,
                    "number": 9,
                    "title": "Old PR",
                    "state": "open",
                    "created_at": "2025-11-19T10:00:00Z",
                    "updated_at": "2025-11-19T12:00:00Z",
                    "closed_at": null,
                    "html_url": "https://github.com/owner/repo/pull/9",
                    "labels": []
                }
            ])],
            ..StubApi::default()
        };
        let result =
            query_all_prs_at(&api, "owner", "repo", datetime!(2025-11-21 12:00 UTC)).unwrap();
        let prs = result["prs"].as_array().unwrap();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0]["number"], 10);
        assert_eq!(prs[0]["labels"], json!(["bug", "urgent"]));
    }

    #[test]
    fn test_all_prs_stops_paginating_past_target_day() {
        let full_page: Vec<Value> = (0..100)
            .map(|n| {
                json!({
                    "id": n,
                    "number": n,
                    "title": format!("PR {n}"),
                    "state": "open",
                    "created_at": "2025-11-18T10:00:00Z",
                    "updated_at": "2025-11-18T12:00:00Z",
                    "closed_at": null,
                    "html_url": format!("https://github.com/owner/repo/pull/{n}"),
                    "labels": []
                })
            })
            .collect();
        let api = StubApi {
            pull_pages: vec![Value::Array(full_page), json!([{ "unreachable": true }])],
            ..StubApi::default()
        };
        query_all_prs_at(&api, "owner", "repo", datetime!(2025-11-21 12:00 UTC)).unwrap();
        assert_eq!(api.pull_page_calls.get(), 1);
    }

    #[test]
    fn test_all_prs_missing_labels_become_empty() {
        let api = StubApi {
            pull_pages: vec![json!([
                {
                    "id": 1,
                    "number": 10,
                    "title": "PR without labels",
                    "state": "open",
                    "created_at": "2025-11-20T10:00:00Z",
                    "updated_at": "2025-11-20T12:00:00Z",
                    "closed_at": null,
                    "html_url": "https://github.com/owner/repo/pull/10",
                    "labels": null
                }
            ])],
            ..StubApi::default()
        };
        let result =
            query_all_prs_at(&api, "owner", "repo", datetime!(2025-11-21 12:00 UTC)).unwrap();
        assert_eq!(result["prs"][0]["labels"], json!([]));
    }

    #[test]
    fn test_workflows_window_and_filter() {
        let api = StubApi {
            workflow_runs: Some(Ok(json!([
                {
                    "id": 1,
                    "name": "Yesterday Workflow",
                    "workflow_id": 123,
                    "run_number": 45,
                    "event": "push",
                    "status": "completed",
                    "conclusion": "success",
                    "created_at": "2025-11-20T10:30:00Z",
                    "updated_at": "2025-11-20T10:35:00Z",
                    "html_url": "https://github.com/owner/repo/actions/runs/1"
                },
                {
                    "id": 2,
                    "name": "Today Workflow",
                    "workflow_id": 124,
                    "run_number": 12,
                    "event": "push",
                    "status": "in_progress",
                    "conclusion": null,
                    "created_at": "2025-11-21T08:00:00Z",
                    "updated_at": "2025-11-21T08:05:00Z",
                    "html_url": "https://github.com/owner/repo/actions/runs/2"
                }
            ]))),
            ..StubApi::default()
        };
        let result =
            query_workflows_at(&api, "owner", "repo", datetime!(2025-11-21 12:00 UTC)).unwrap();
        assert_eq!(
            api.created_window.borrow().as_deref(),
            Some("2025-11-20T00:00:00Z..2025-11-20T23:59:59Z")
        );
        let workflows = result["workflows"].as_array().unwrap();
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0]["id"], 1);
        assert_eq!(workflows[0]["name"], "Yesterday Workflow");
    }

    #[test]
    fn test_workflows_empty_day() {
        let api = StubApi {
            workflow_runs: Some(Ok(json!([]))),
            ..StubApi::default()
        };
        let result =
            query_workflows_at(&api, "owner", "repo", datetime!(2025-11-21 12:00 UTC)).unwrap();
        assert_eq!(result["workflows"], json!([]));
    }

    #[test]
    fn test_users_passthrough() {
        let members = json!([
            {
                "id": "123",
                "login": "login",
                "node_id": "node_id",
                "avatar_url": "avatar_url",
                "gravatar_id": "gravatar_id",
                "type": "type",
                "site_admin": "site_admin"
            }
        ]);
        let api = StubApi {
            members: Some(Ok(members.clone())),
            ..StubApi::default()
        };
        let result = query_users(&api, "owner").unwrap();
        assert_eq!(
            result,
            json!({
                "metadata_owner": "owner",
                "metadata_query": "users",
                "users": members,
            })
        );
        assert!(result.get("metadata_repo").is_none());
    }

    #[test]
    fn test_users_pagination_error_propagates() {
        let api = StubApi {
            members: Some(Err((500, "Org API error".to_string()))),
            ..StubApi::default()
        };
        assert!(query_users(&api, "owner").is_err());
    }

    #[test]
    fn test_codespaces_flattened() {
        let api = StubApi {
            codespaces: Some(Ok(json!([
                {
                    "id": 123,
                    "name": "name",
                    "environment_id": "environment_id",
                    "owner": { "login": "owner" },
                    "billable_owner": { "login": "billable_owner" },
                    "repository": { "full_name": "full_name" },
                    "machine": {
                        "name": "machine_name",
                        "display_name": "display_name",
                        "operating_system": "os",
                        "storage_in_bytes": 123,
                        "memory_in_bytes": 123,
                        "cpus": 123
                    },
                    "prebuild": "prebuild",
                    "devcontainer_path": "devcontainer_path",
                    "created_at": "created_at",
                    "updated_at": "updated_at",
                    "last_used_at": "last_used_at",
                    "state": "state",
                    "location": "location",
                    "idle_timeout_minutes": 123
                }
            ]))),
            ..StubApi::default()
        };
        let result = query_codespaces(&api, "owner").unwrap();
        assert_eq!(
            result,
            json!({
                "metadata_owner": "owner",
                "metadata_query": "codespaces",
                "codespaces": [{
                    "id": 123,
                    "name": "name",
                    "environment_id": "environment_id",
                    "owner": "owner",
                    "billable_owner": "billable_owner",
                    "repository": "full_name",
                    "machine_name": "machine_name",
                    "machine_display_name": "display_name",
                    "machine_os": "os",
                    "machine_storage_in_bytes": 123,
                    "machine_memory_in_bytes": 123,
                    "machine_cpus": 123,
                    "prebuild": "prebuild",
                    "devcontainer_path": "devcontainer_path",
                    "created_at": "created_at",
                    "updated_at": "updated_at",
                    "last_used_at": "last_used_at",
                    "state": "state",
                    "location": "location",
                    "idle_timeout_minutes": 123,
                }],
            })
        );
    }

    #[test]
    fn test_codespaces_empty_list() {
        let api = StubApi {
            codespaces: Some(Ok(json!([]))),
            ..StubApi::default()
        };
        let result = query_codespaces(&api, "owner").unwrap();
        assert_eq!(result["codespaces"], json!([]));
    }
}
