//! CLI command definitions for the diff calculator.
//!
//! `run` starts the claim/compute loop, `migrate` applies the work queue schema.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::config::DiffCalculatorConfig;
use crate::diff::HttpDiffEngine;
use crate::grouping::GroupingResolver;
use crate::metrics::{
    init_metrics, serve_metrics, spawn_busy_reporter, BusyFlag, BUSY_PULSE_INTERVAL,
};
use crate::scheduler::{Claimer, ClaimerSettings, Poller, PollerSettings};
use crate::storage::{open_store, Backend, PgWorkStore};

/// Continuously computes diffs for primary-branch and review-branch groupings.
#[derive(Parser)]
#[command(name = "diffcalculator")]
#[command(about = "Claim and compute image diff work from the shared work queues")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Poll the work queues and compute diffs until interrupted.
    Run(RunArgs),

    /// Create or update the work queue schema.
    Migrate(MigrateArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "DIFFCALC_CONFIG")]
    pub config: PathBuf,

    /// Do nothing but wait for a shutdown signal (for debugging deployments).
    #[arg(long)]
    pub hang: bool,
}

/// Arguments for the migrate command.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Path to the JSON configuration file.
    #[arg(short, long, env = "DIFFCALC_CONFIG")]
    pub config: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_calculator(args).await,
        Commands::Migrate(args) => run_migrate(args).await,
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        token.cancel();
    });
    shutdown
}

async fn run_calculator(args: RunArgs) -> anyhow::Result<()> {
    let shutdown = shutdown_on_ctrl_c();

    if args.hang {
        info!("Hanging");
        shutdown.cancelled().await;
        return Ok(());
    }

    let config = DiffCalculatorConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    info!(
        high_contention_mode = config.high_contention_mode,
        diff_service_url = %config.diff_service_url,
        grouping_cache_size = config.grouping_cache_size,
        "Loaded config"
    );

    init_metrics().context("Failed to initialize metrics")?;
    let metrics_addr = config.prom_port.clone();
    let metrics_token = shutdown.clone();
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = serve_metrics(&metrics_addr, metrics_token).await {
            error!(error = %e, "Metrics server stopped");
        }
    });

    let busy = BusyFlag::new();
    let busy_reporter = spawn_busy_reporter(busy.clone(), BUSY_PULSE_INTERVAL, shutdown.clone());

    let stores = open_store(&config)
        .await
        .context("Failed to open work store")?;
    let resolver = Arc::new(GroupingResolver::new(
        stores.groupings.clone(),
        config.grouping_cache_size,
    ));
    let engine = Arc::new(
        HttpDiffEngine::with_timeout(&config.diff_service_url, config.scheduler.lease_duration())
            .context("Failed to create diff service client")?,
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let claimer = Claimer::new(
        stores.work.clone(),
        resolver,
        engine,
        clock.clone(),
        ClaimerSettings::from(&config),
    );
    let mut poller = Poller::new(claimer, clock, busy, PollerSettings::from(&config));

    let result = poller.run(&shutdown).await;

    shutdown.cancel();
    let _ = busy_reporter.await;
    let _ = metrics_server.await;

    result.context("Stopped while polling for work")
}

async fn run_migrate(args: MigrateArgs) -> anyhow::Result<()> {
    let config = DiffCalculatorConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    match Backend::from_url(&config.database_url)? {
        Backend::Postgres => {
            let store = PgWorkStore::connect(&config.database_url, config.max_sql_connections)
                .await
                .context("Failed to connect to database")?;
            let applied = store.run_migrations().await?;
            info!(applied = applied, "Migrations complete");
        }
        Backend::Sqlite => {
            // Opening a SQLite store applies its schema.
            open_store(&config).await?;
            info!("SQLite schema up to date");
        }
    }
    Ok(())
}
