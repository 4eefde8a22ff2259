use std::path::Path;

use anyhow::Result;
use log::{info, warn};
use serde_json::Value;

use crate::config::Config;
use crate::forwarder::{forward_payload, LogSink, StoreTarget};
use crate::github::GitHubApi;
use crate::query;

const LOG_TYPE_PREFIX: &str = "GitHubMetadata_";

/// Commit history covers a 60 day window and can dwarf the other domains,
/// so it ships in larger batches.
const COMMIT_CHUNK_SIZE: usize = 20;

/// Everything one export run needs. Sinks and the API handle are borrowed
/// so tests can substitute stubs.
pub struct RunContext<'a> {
    pub api: &'a dyn GitHubApi,
    pub log_sink: &'a dyn LogSink,
    pub store: Option<StoreTarget<'a>>,
    pub config: &'a Config,
    pub owner: &'a str,
    pub repo: &'a str,
    pub checkout_root: &'a Path,
}

/// One full export: repo-scoped queries in a fixed order, each forwarded
/// before the next starts, then the org-wide queries when this repository
/// is the designated org data repository.
pub fn run_export(ctx: &RunContext) -> Result<()> {
    let owner = ctx.owner;
    let repo = ctx.repo;
    let batch = ctx.config.batch_size;

    info!("Exporting metadata for {owner}/{repo}");

    let repository = query::query_repository(ctx.api, owner, repo)?;
    forward(ctx, &repository, None, "Repository", batch)?;

    let branch_protection =
        query::query_branch_protection(ctx.api, owner, repo, &ctx.config.branch)?;
    forward(ctx, &branch_protection, None, "BranchProtection", batch)?;

    let commits = query::query_commits(ctx.api, owner, repo, ctx.config.time_in_days)?;
    forward(ctx, &commits, Some("commits"), "CommitCount", COMMIT_CHUNK_SIZE)?;

    let required_files = query::query_required_files(ctx.checkout_root, owner, repo);
    forward(ctx, &required_files, None, "RequiredFiles", batch)?;

    let workflows_dir = ctx.checkout_root.join(".github/workflows");
    let action_dependencies = query::query_action_dependencies(&workflows_dir, owner, repo)?;
    forward(
        ctx,
        &action_dependencies,
        Some("action_dependencies"),
        "ActionDependencies",
        batch,
    )?;

    let dependabot_alerts = query::query_dependabot_alerts(ctx.api, owner, repo);
    forward(
        ctx,
        &dependabot_alerts,
        Some("dependabot_alerts"),
        "DependabotAlerts",
        batch,
    )?;

    let code_scanning_alerts = query::query_code_scanning_alerts(ctx.api, owner, repo)?;
    forward(
        ctx,
        &code_scanning_alerts,
        Some("code_scanning_alerts"),
        "CodeScanningAlerts",
        batch,
    )?;

    let renovate_prs = query::query_renovate_prs(ctx.api, owner, repo)?;
    forward(ctx, &renovate_prs, Some("renovate_prs"), "RenovatePRs", batch)?;

    // The daily activity snapshots are advisory; losing one day does not
    // justify aborting the rest of the export.
    if let Err(err) = query::query_all_prs(ctx.api, owner, repo)
        .and_then(|prs| forward(ctx, &prs, Some("prs"), "AllPRs", batch))
    {
        warn!("Skipping PR activity for {owner}/{repo}: {err}");
    }
    if let Err(err) = query::query_workflows(ctx.api, owner, repo)
        .and_then(|runs| forward(ctx, &runs, Some("workflows"), "Workflows", batch))
    {
        warn!("Skipping workflow runs for {owner}/{repo}: {err}");
    }

    if ctx.config.is_org_data_repo(owner, repo) {
        info!("{owner}/{repo} is the org data repository, exporting org-wide data");

        let users = query::query_users(ctx.api, owner)?;
        forward(ctx, &users, Some("users"), "Users", batch)?;

        let codespaces = query::query_codespaces(ctx.api, owner)?;
        forward(ctx, &codespaces, Some("codespaces"), "Codespaces", batch)?;
    }

    info!("Export finished for {owner}/{repo}");
    Ok(())
}

fn forward(
    ctx: &RunContext,
    payload: &Value,
    array_key: Option<&str>,
    name: &str,
    chunk_size: usize,
) -> Result<()> {
    let log_type = format!("{LOG_TYPE_PREFIX}{name}");
    forward_payload(
        ctx.log_sink,
        ctx.store.as_ref(),
        payload,
        array_key,
        &log_type,
        chunk_size,
    )
}
