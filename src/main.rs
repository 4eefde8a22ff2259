use std::{env, error::Error, path::Path, path::PathBuf};

use anyhow::anyhow;
use clap::{Parser, Subcommand};

mod actions;
mod config;
mod forwarder;
mod github;
mod query;
mod utils;
mod workflow_files;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export metadata for one repository
    Run {
        /// Repository to export as owner/repo. Falls back to
        /// GITHUB_REPOSITORY, then to the config file.
        #[arg(long)]
        repo: Option<String>,
        /// Path to the local checkout used for file inventories
        #[arg(long, default_value = ".")]
        checkout: PathBuf,
    },
    /// Print the resolved configuration
    ShowConfig,
}

fn setup_logging(verbose: bool) {
    let mut log_builder = env_logger::builder();
    if verbose {
        log_builder.filter(None, log::LevelFilter::Debug);
    } else {
        // Only set default of info if not configured via env already
        if env::var("RUST_LOG").is_err() {
            log_builder.filter(None, log::LevelFilter::Info);
        }
        log_builder.format_timestamp(None);
    }
    log_builder.init();
}

fn run(repo_flag: Option<&str>, checkout: &Path, config: &config::Config) -> anyhow::Result<()> {
    let (owner, repo) = config.repo_slug(repo_flag)?;
    let token = config.auth_token()?;
    let client = github::GitHubClient::new("github.com".to_string(), token);

    let log_config = config
        .log_analytics
        .as_ref()
        .ok_or(anyhow!("No log_analytics section in the config file"))?;
    let workspace_key = config::resolve_secret(&log_config.workspace_key)?;
    let log_sink = forwarder::LogAnalyticsSink::new(log_config.workspace_id.clone(), workspace_key);

    let registry = match &config.s3 {
        Some(_) => Some(forwarder::S3Registry::new()?),
        None => None,
    };
    let store = match (&config.s3, &registry) {
        (Some(s3), Some(registry)) => Some(forwarder::StoreTarget {
            store: registry,
            bucket: &s3.bucket,
            region: &s3.region,
        }),
        _ => None,
    };

    let ctx = actions::RunContext {
        api: &client,
        log_sink: &log_sink,
        store,
        config,
        owner: &owner,
        repo: &repo,
        checkout_root: checkout,
    };
    actions::run_export(&ctx)
}

fn show_config(config: &config::Config) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = config::get_config()?;
    match &cli.command {
        Commands::Run { repo, checkout } => run(repo.as_deref(), checkout, &config)?,
        Commands::ShowConfig => show_config(&config)?,
    };

    Ok(())
}
