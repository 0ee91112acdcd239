use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use scout_core::{RunStatus, SearchFilters, DEFAULT_MAX_STARS, DEFAULT_MIN_STARS};
use scout_pipeline::{maybe_build_prune_scheduler, RunContext, ScoutConfig, ScoutServices};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scout-cli")]
#[command(about = "Repo scout: find open-source projects worth contributing to")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Run one search with the saved profile and print events as NDJSON.
    Search(SearchArgs),
    /// Drop cached repositories not seen recently.
    Prune {
        #[arg(long)]
        days: Option<i64>,
    },
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long = "language", required = true)]
    languages: Vec<String>,
    #[arg(long = "topic")]
    topics: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_MIN_STARS)]
    min_stars: u32,
    #[arg(long, default_value_t = DEFAULT_MAX_STARS)]
    max_stars: u32,
    #[arg(long)]
    license: Option<String>,
}

fn init_logger() {
    // Events go to stderr so `search` output stays pure NDJSON.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// A missing `.env` is normal; anything else is worth reporting.
fn dotenv_problem<T>(loaded: std::result::Result<T, dotenvy::Error>) -> Option<dotenvy::Error> {
    match loaded {
        Err(err) if !err.not_found() => Some(err),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let loaded = dotenvy::dotenv();
    init_logger();
    if let Some(err) = dotenv_problem(loaded) {
        warn!(error = %err, "ignoring unreadable .env file");
    }
    let cli = Cli::parse();
    let config = ScoutConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Search(args) => search(config, args).await,
        Commands::Prune { days } => prune(config, days).await,
    }
}

async fn serve(config: ScoutConfig) -> Result<()> {
    let services = ScoutServices::from_config(&config).await?;
    let scheduler = maybe_build_prune_scheduler(&config, services.store.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting prune scheduler")?;
        info!(cron = %config.prune_cron, "prune scheduler started");
    }
    scout_web::serve(&config, services).await
}

async fn search(config: ScoutConfig, args: SearchArgs) -> Result<()> {
    let mut filters = SearchFilters::new(args.languages, args.min_stars, args.max_stars)?
        .with_topics(args.topics);
    if let Some(license) = args.license.filter(|l| !l.trim().is_empty()) {
        filters = filters.with_license(license.trim());
    }

    let services = ScoutServices::from_config(&config).await?;
    let stored = services
        .store
        .get_profile()
        .await?
        .context("no developer profile saved; POST one to /scout/profile first")?;

    let run_id = uuid::Uuid::new_v4().to_string();
    services
        .store
        .create_run(&run_id, Some(&stored.id), &filters)
        .await?;
    let active = services.registry.activate(&run_id)?;
    let cancel = active.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(32);
    let orchestrator = Arc::clone(&services.orchestrator);
    let ctx = RunContext {
        run_id: run_id.clone(),
        profile: Arc::new(stored.profile),
        filters,
    };
    let token = active.token();
    let run = tokio::spawn(async move { orchestrator.run(ctx, token, tx).await });

    while let Some(event) = rx.recv().await {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer(&mut stdout, &event)?;
        writeln!(stdout)?;
        stdout.flush()?;
    }

    let status = run.await.context("search task panicked")?;
    drop(active);
    info!(%run_id, %status, "search finished");
    if status == RunStatus::Failed {
        bail!("search run {run_id} failed");
    }
    Ok(())
}

async fn prune(config: ScoutConfig, days: Option<i64>) -> Result<()> {
    let store = config.open_store().await?;
    let retention = days
        .map(|d| chrono::Duration::days(d.max(0)))
        .unwrap_or_else(|| config.cache_retention());
    let pruned = store.prune_stale_repositories(retention).await?;
    println!("pruned {pruned} cached repositories");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_file_is_not_a_problem() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dotenv_problem(dotenvy::from_path(dir.path().join(".env"))).is_none());
    }

    #[test]
    fn malformed_env_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "THIS IS NOT VALID\n").unwrap();
        let err = dotenv_problem(dotenvy::from_path(&path)).expect("parse error surfaces");
        assert!(matches!(err, dotenvy::Error::LineParse(..)));
    }
}
