//! conveyor-daemon entry point.
//!
//! Thin on purpose: loads config, sets up tracing, wires the Postgres
//! catalog, the message outbox and the transfer-tool client into one engine,
//! then hands it to the poll loop in `poller.rs`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use conveyor_config::{load_layered_yaml, report_unused_keys, ConveyorConfig, UnusedKeyPolicy};
use conveyor_daemon::{Poller, PollerSettings};
use conveyor_db::{PgCatalog, PgMessageOutbox};
use conveyor_reconcile::{NoticeSettings, ReconcileEngine, TracingLog, TracingMetrics};
use conveyor_transfertool::FtsRestClient;
use tracing::info;

#[derive(Parser)]
#[command(name = "conveyor-daemon")]
#[command(about = "Transfer-request reconciliation daemon", long_about = None)]
struct Cli {
    /// Layered config paths in merge order (base -> site -> local)
    #[arg(long = "config", required = true)]
    config_paths: Vec<String>,

    /// Run a single poll and exit.
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Fail startup when the config contains keys nothing reads.
    #[arg(long, default_value_t = false)]
    strict_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cli = Cli::parse();
    let path_refs: Vec<&str> = cli.config_paths.iter().map(String::as_str).collect();
    let loaded = load_layered_yaml(&path_refs)?;
    info!(config_hash = %loaded.config_hash, "config loaded");

    let policy = if cli.strict_config {
        UnusedKeyPolicy::Fail
    } else {
        UnusedKeyPolicy::Warn
    };
    let unused = report_unused_keys(&loaded.config_json, policy)?;
    for ptr in &unused.unused_leaf_pointers {
        tracing::warn!(key = %ptr, "config key is not used");
    }

    let cfg = ConveyorConfig::from_loaded(&loaded)?;

    let db_url = cfg.database_url()?;
    let pool = conveyor_db::connect(&db_url, cfg.database.max_connections).await?;
    if cfg.daemon.migrate_on_start {
        conveyor_db::migrate(&pool).await?;
        info!("migrations applied");
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(cfg.transfer_tool.timeout_secs))
        .build()
        .context("failed to build transfer tool http client")?;
    let tool = Arc::new(FtsRestClient::new_with_client(
        cfg.transfer_tool.endpoint.clone(),
        http,
    ));

    let engine = ReconcileEngine::new(
        PgCatalog::new(pool, cfg.reconcile.max_retries),
        PgMessageOutbox,
        TracingMetrics,
        TracingLog,
        NoticeSettings {
            activity: cfg.reconcile.activity.clone(),
            tool_id: cfg.reconcile.tool_id.clone(),
            transfer_endpoint: cfg.transfer_tool.endpoint.clone(),
        },
    );

    let poller = Arc::new(Poller::new(
        Arc::new(engine),
        tool,
        PollerSettings {
            batch_size: cfg.daemon.batch_size,
            max_in_flight: cfg.daemon.max_in_flight,
            poll_interval: Duration::from_secs(cfg.daemon.poll_interval_secs),
            defer_for: Duration::from_secs(cfg.daemon.defer_secs),
        },
    ));

    if cli.once {
        let summary = poller.run_once().await?;
        info!(total = summary.total(), "single poll finished");
        return Ok(());
    }

    info!(
        endpoint = %cfg.transfer_tool.endpoint,
        interval_secs = cfg.daemon.poll_interval_secs,
        "conveyor-daemon polling"
    );
    poller.run(shutdown_signal()).await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "ctrl-c handler failed; stopping");
    }
}
