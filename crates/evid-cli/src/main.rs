//! `evid` binary: serve the API, run a refresh worker, or drive a
//! one-shot resolve against the local store.

use anyhow::Context;
use clap::{Parser, Subcommand};
use evid_refresh::{RefreshService, Worker};
use evid_store::{RefreshTracker, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod config;
mod demo;

use config::EvidConfig;

#[derive(Debug, Parser)]
#[command(
    name = "evid",
    about = "Refresh orchestration and claim versioning for condition/drug evidence",
    version
)]
struct Cli {
    #[arg(long, env = "EVID_CONFIG", help = "Path to a TOML config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API, optionally with an embedded refresh worker.
    Serve {
        #[arg(long, default_value_t = false)]
        with_worker: bool,
    },
    /// Run a standalone refresh worker until ctrl-c.
    Worker,
    /// Resolve a condition against the local store and print the
    /// outcome. With --wait, drives any queued refresh to completion.
    Resolve {
        condition: String,
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("EVID_LOG")
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn open_store(config: &EvidConfig) -> anyhow::Result<Arc<SqliteStore>> {
    if let Some(parent) = config.db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let store = SqliteStore::with_validation_band(&config.db_path, config.validation_band())
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

fn build_service(config: &EvidConfig, store: &Arc<SqliteStore>) -> Arc<RefreshService> {
    Arc::new(RefreshService::new(
        demo::resolver(),
        store.clone(),
        store.clone(),
        store.clone(),
        config.refresh_config(),
    ))
}

async fn run_serve(config: &EvidConfig, with_worker: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let service = build_service(config, &store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = if with_worker {
        let worker = Worker::new(
            store.clone(),
            store.clone(),
            demo::pipeline(),
            config.worker_config(),
        );
        Some(tokio::spawn(async move { worker.run(shutdown_rx).await }))
    } else {
        None
    };

    let serve_result = evid_gateway::serve(config.bind_addr()?, service).await;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = worker_handle {
        handle.await.context("worker task panicked")??;
    }
    serve_result
}

async fn run_worker(config: &EvidConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let worker = Worker::new(
        store.clone(),
        store.clone(),
        demo::pipeline(),
        config.worker_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(db_path = %config.db_path.display(), "refresh worker started");
    worker.run(shutdown_rx).await
}

async fn run_resolve(config: &EvidConfig, condition: &str, wait: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let service = build_service(config, &store);

    let outcome = service.resolve(condition).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    let Some(job) = outcome.job.filter(|_| wait) else {
        return Ok(());
    };

    let worker = Worker::new(
        store.clone(),
        store.clone(),
        demo::pipeline(),
        config.worker_config(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let finished = loop {
        let current = store
            .get_job(job.id)
            .await?
            .context("refresh job disappeared mid-run")?;
        if current.status.is_terminal() {
            break current;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    };

    let _ = shutdown_tx.send(true);
    handle.await.context("worker task panicked")??;

    println!("{}", serde_json::to_string_pretty(&finished)?);
    if let Some(version_id) = finished.result_version_id {
        if let Some(claim_set) = service.get_claim_set(&version_id.to_string()).await? {
            println!("{}", serde_json::to_string_pretty(&claim_set)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EvidConfig::load(cli.config.as_deref());

    match cli.command {
        Command::Serve { with_worker } => run_serve(&config, with_worker).await,
        Command::Worker => run_worker(&config).await,
        Command::Resolve { condition, wait } => run_resolve(&config, &condition, wait).await,
    }
}
