//! counter-sync - people-counting sensor ingestion service
//!
//! Polls the configured sensors on an interval and upserts their hourly line
//! counts into the counts table. `--once` runs a single cycle and exits
//! (non-zero only when every sensor failed), for cron-style scheduling.
//!
//! Module structure:
//! - `domain/` - Count records and the timestamp model
//! - `io/` - Sensor client, table store client, health endpoint
//! - `services/` - Poller, reconciliation, retry, diagnostics
//! - `infra/` - Config, errors, metrics

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use counter_sync::infra::{Config, Metrics};
use counter_sync::io::{start_health_server, HealthState, RestStore, SensorClient};
use counter_sync::services::Poller;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// People-counting sensor ingestion service
#[derive(Parser, Debug)]
#[command(name = "counter-sync", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Run one poll cycle and exit
    #[arg(long)]
    once: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-sensor detail
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(version = %env!("GIT_HASH"), "counter-sync starting");

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        store_url = %config.store().base_url,
        table = %config.store().table,
        sensors = %config.enabled_sensors().count(),
        poll_interval_secs = %config.poll_interval().as_secs(),
        granularity = %config.granularity().as_str(),
        health_port = %config.health_port(),
        "config_loaded"
    );
    if config.store().api_key.is_empty() {
        warn!("store_api_key_missing");
    }
    if config.enabled_sensors().next().is_none() {
        warn!("no_sensors_configured");
    }

    let metrics = Arc::new(Metrics::new());
    let source = Arc::new(
        SensorClient::new(config.sensor_timeout()).context("failed to build sensor client")?,
    );
    let store = Arc::new(
        RestStore::new(
            &config.store().base_url,
            &config.store().table,
            &config.store().api_key,
            config.store_request_timeout(),
        )
        .context("failed to build store client")?,
    );
    let poller = Poller::new(&config, source, store, metrics.clone());

    if args.once {
        let report = poller.run_cycle().await;
        report.log();
        metrics.report().log();
        if report.all_failed() {
            anyhow::bail!("all {} sensors failed", report.failed());
        }
        return Ok(());
    }

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start health/metrics HTTP server (if port > 0)
    let health_port = config.health_port();
    if health_port > 0 {
        let state = Arc::new(HealthState {
            metrics: metrics.clone(),
            site_id: config.site_id().to_string(),
            stale_after: config.stale_after(),
            version: env!("GIT_HASH"),
            started_at: Utc::now(),
        });
        let health_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_health_server(health_port, state, health_shutdown).await {
                error!(error = %e, "health_server_error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut reporter_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = reporter_shutdown.changed() => return,
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    poller.run(shutdown_rx).await;

    metrics.report().log();
    info!("counter-sync shutdown complete");
    Ok(())
}
