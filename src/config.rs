use std::{
    env,
    fs::{create_dir_all, read_to_string, File},
};

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

/// Exporter configuration, read from `~/.config/ghmeta/config.toml`.
#[derive(Serialize, Deserialize, Debug)]
pub struct Config {
    /// `owner/repo` to export. Overridden by `--repo` or `GITHUB_REPOSITORY`.
    pub repository: Option<String>,
    /// Token used for GitHub API access. Accepts `env:`/`file:` refs.
    pub github_token: Option<String>,
    /// GitHub App credentials are recognized but the installation token
    /// exchange happens outside this tool.
    pub github_app_id: Option<u64>,
    pub github_installation_id: Option<u64>,
    pub github_private_key: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Commit history lookback window in days.
    #[serde(default = "default_time_in_days")]
    pub time_in_days: u32,
    /// Maximum number of records forwarded in a single payload.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// The one `owner/repo` from which org-wide queries are run.
    pub org_data_repo: Option<String>,
    pub log_analytics: Option<LogAnalyticsConfig>,
    pub s3: Option<S3Config>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct LogAnalyticsConfig {
    pub workspace_id: String,
    /// Base64-encoded shared key. Accepts `env:`/`file:` refs.
    pub workspace_key: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct S3Config {
    pub bucket: String,
    #[serde(default = "default_s3_region")]
    pub region: String,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_time_in_days() -> u32 {
    60
}

fn default_batch_size() -> usize {
    10
}

fn default_s3_region() -> String {
    "ca-central-1".to_string()
}

impl Config {
    /// Resolve the `owner/repo` pair for this run. A command line flag wins
    /// over the `GITHUB_REPOSITORY` environment variable, which wins over
    /// the config file.
    pub fn repo_slug(&self, flag: Option<&str>) -> anyhow::Result<(String, String)> {
        let slug = match flag {
            Some(value) => value.to_string(),
            None => match env::var("GITHUB_REPOSITORY") {
                Ok(value) => value,
                Err(_) => self
                    .repository
                    .clone()
                    .ok_or(anyhow!("No repository configured. Pass --repo, set GITHUB_REPOSITORY, or add repository to the config file."))?,
            },
        };
        split_slug(&slug)
    }

    pub fn is_org_data_repo(&self, owner: &str, repo: &str) -> bool {
        match &self.org_data_repo {
            Some(designated) => designated == &format!("{owner}/{repo}"),
            None => false,
        }
    }

    /// The token used for API access. App credentials are accepted in the
    /// config but minting an installation token from them is handled by the
    /// deploy environment, not here.
    pub fn auth_token(&self) -> anyhow::Result<String> {
        if let Some(raw) = &self.github_token {
            return resolve_secret(raw).with_context(|| "Failed to resolve github_token");
        }
        if self.github_app_id.is_some()
            || self.github_installation_id.is_some()
            || self.github_private_key.is_some()
        {
            anyhow::bail!(
                "GitHub App credentials are configured but installation tokens must be minted externally. Provide the minted token as github_token."
            );
        }
        anyhow::bail!("No github_token configured. Add it to your config file.")
    }
}

pub fn split_slug(slug: &str) -> anyhow::Result<(String, String)> {
    let (owner, repo) = slug
        .split_once('/')
        .ok_or(anyhow!("Repository '{slug}' is not in owner/repo form"))?;
    if owner.is_empty() || repo.is_empty() {
        anyhow::bail!("Repository '{slug}' is not in owner/repo form");
    }
    Ok((owner.to_string(), repo.to_string()))
}

/// Resolve a secret reference. `env:NAME` reads an environment variable,
/// `file:PATH` reads a file (trimmed), anything else is taken literally.
pub fn resolve_secret(raw: &str) -> anyhow::Result<String> {
    if let Some(var_name) = raw.strip_prefix("env:") {
        return env::var(var_name)
            .with_context(|| format!("Environment variable '{var_name}' is not set"));
    }
    if let Some(path) = raw.strip_prefix("file:") {
        let contents =
            read_to_string(path).with_context(|| format!("Failed to read secret file '{path}'"))?;
        return Ok(contents.trim().to_string());
    }
    Ok(raw.to_string())
}

pub fn get_config() -> anyhow::Result<Config> {
    let mut config_buf = home::home_dir().ok_or(anyhow::anyhow!("Can't determine home dir"))?;
    config_buf.push(".config/ghmeta/");
    let config_dir = config_buf.as_path();
    if !config_dir.exists() {
        create_dir_all(config_dir)?;
    }
    config_buf.push("config.toml");
    let config_file = config_buf.as_path();
    if !config_file.exists() {
        File::create(config_file)?;
    }
    let config_str = read_to_string(config_file)?;
    parse_config(&config_str)
}

pub fn parse_config(config_str: &str) -> anyhow::Result<Config> {
    let config = toml::from_str(config_str)?;
    Ok(config)
}
