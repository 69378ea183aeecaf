//! counter-diag - operator diagnostics for the counts table
//!
//! Usage:
//!   counter-diag freshness                 # did ingestion run for every sensor?
//!   counter-diag future                    # rows stamped in the future
//!   counter-diag purge-future --yes        # delete them
//!   counter-diag origin --hours 48         # scheduled vs manual inserts
//!   counter-diag gaps --sensor pc-01       # missing hours
//!   counter-diag summary                   # per-sensor overview
//!   counter-diag duplicates                # legacy duplicate rows
//!   counter-diag watch --interval-secs 5   # row count over time
//!   counter-diag probe pc-01               # read a sensor without writing
//!
//! Results go to stdout (`--json` for machine-readable output), logs to stderr.

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use counter_sync::domain::timestamp::{align, poll_window, to_backend_string, TimeWindow};
use counter_sync::domain::types::{Granularity, RecordRow, SensorId, StoredRecord};
use counter_sync::infra::config::secs_to_chrono;
use counter_sync::infra::Config;
use counter_sync::io::{CountStore, RecordFilter, RestStore, SensorClient, SensorSource};
use counter_sync::services::diagnostics::{
    classify_origin, find_future_dated, find_hourly_gaps, future_dated_filter, ingestion_freshness,
    insertion_delay, origin_breakdown, summarize,
};
use counter_sync::services::monitor::watch_count;
use counter_sync::services::reconcile::dedup_stored;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Diagnostics for people-counting ingestion
#[derive(Parser, Debug)]
#[command(name = "counter-diag", version, about, long_about = None)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rows whose timestamp lies in the future
    Future {
        /// Allowed clock skew in minutes (default: poller.future_tolerance_secs)
        #[arg(long)]
        tolerance_mins: Option<i64>,
        #[arg(long)]
        sensor: Option<String>,
    },

    /// Delete future-dated rows
    PurgeFuture {
        #[arg(long)]
        tolerance_mins: Option<i64>,
        #[arg(long)]
        sensor: Option<String>,
        /// Actually delete; without it only the rows are listed
        #[arg(long)]
        yes: bool,
    },

    /// Classify rows as scheduled or manual inserts by insertion delay
    Origin {
        #[arg(long, default_value = "24")]
        hours: i64,
        #[arg(long)]
        sensor: Option<String>,
        /// Print every row with its delay
        #[arg(short, long)]
        verbose: bool,
    },

    /// Missing hours per sensor
    Gaps {
        #[arg(long, default_value = "24")]
        hours: i64,
        #[arg(long)]
        sensor: Option<String>,
    },

    /// Per-sensor row counts, time range and totals
    Summary {
        /// Limit to the last N hours (default: all rows)
        #[arg(long)]
        hours: Option<i64>,
        #[arg(long)]
        sensor: Option<String>,
    },

    /// Latest insertion per configured sensor; exits non-zero if any is stale
    Freshness {
        /// Maximum age in minutes (default: diagnostics.stale_after_secs)
        #[arg(long)]
        max_age_mins: Option<i64>,
    },

    /// Rows sharing a (sensor_id, timestamp) key
    Duplicates {
        #[arg(long, default_value = "168")]
        hours: i64,
        #[arg(long)]
        sensor: Option<String>,
    },

    /// Re-poll the row count until Ctrl+C
    Watch {
        #[arg(long, default_value = "5")]
        interval_secs: u64,
        /// Stop after this many polls
        #[arg(long)]
        max_polls: Option<u64>,
        #[arg(long)]
        sensor: Option<String>,
    },

    /// Fetch a sensor's current window and print it without writing
    Probe {
        /// Sensor id from the config file
        sensor: String,
        /// Full periods before the current one (default: poller.lookback_periods)
        #[arg(long)]
        lookback: Option<u32>,
    },
}

/// Row as printed, with id and insertion time
fn printable(stored: &StoredRecord) -> RecordRow {
    let mut row = stored.record.to_row();
    row.id = stored.id;
    row.inserted_at = stored.inserted_at.map(to_backend_string);
    row
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_rows(rows: &[&StoredRecord], json: bool) -> anyhow::Result<()> {
    if json {
        let printable: Vec<RecordRow> = rows.iter().map(|s| printable(s)).collect();
        return print_json(&printable);
    }
    for s in rows {
        println!(
            "{:>8}  {:<16} {}  in={:<6} out={:<6} created={}",
            s.id.map(|id| id.to_string()).unwrap_or_default(),
            s.record.sensor_id,
            to_backend_string(s.record.timestamp),
            s.record.total_in(),
            s.record.total_out(),
            s.inserted_at.map(to_backend_string).unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

fn base_filter(sensor: Option<String>) -> RecordFilter {
    match sensor {
        Some(id) => RecordFilter::new().sensor(SensorId(id)),
        None => RecordFilter::new(),
    }
}

/// `--hours` as a duration, rejecting values chrono cannot represent
fn hours_arg(hours: i64) -> anyhow::Result<Duration> {
    match Duration::try_hours(hours) {
        Some(span) if span >= Duration::zero() && span <= Duration::days(366 * 100) => Ok(span),
        _ => bail!("--hours {hours} is out of range"),
    }
}

fn fmt_ts(ts: Option<DateTime<Utc>>) -> String {
    ts.map(to_backend_string).unwrap_or_else(|| "-".to_string())
}

struct Diag {
    config: Config,
    store: RestStore,
    json: bool,
}

impl Diag {
    fn future_tolerance(&self, mins: Option<i64>) -> anyhow::Result<Duration> {
        match mins {
            Some(mins) => Duration::try_minutes(mins)
                .with_context(|| format!("--tolerance-mins {mins} is out of range")),
            None => Ok(secs_to_chrono(self.config.poller().future_tolerance_secs)),
        }
    }

    async fn future(&self, tolerance_mins: Option<i64>, sensor: Option<String>) -> anyhow::Result<()> {
        let now = Utc::now();
        let tolerance = self.future_tolerance(tolerance_mins)?;
        let rows = self.store.select(&base_filter(sensor).since(now)).await?;
        let future = find_future_dated(&rows, now, tolerance);

        info!(count = %future.len(), tolerance_secs = %tolerance.num_seconds(), "future_dated_rows");
        print_rows(&future, self.json)
    }

    async fn purge_future(
        &self,
        tolerance_mins: Option<i64>,
        sensor: Option<String>,
        yes: bool,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let tolerance = self.future_tolerance(tolerance_mins)?;
        let filter = base_filter(sensor);
        let rows = self.store.select(&filter.clone().since(now)).await?;
        let future = find_future_dated(&rows, now, tolerance);
        print_rows(&future, self.json)?;

        if future.is_empty() {
            eprintln!("no future-dated rows");
            return Ok(());
        }
        if !yes {
            eprintln!("{} rows would be deleted; re-run with --yes", future.len());
            return Ok(());
        }

        let deleted = self.store.delete(&future_dated_filter(filter, now, tolerance)).await?;
        info!(deleted = %deleted, "future_dated_rows_deleted");
        eprintln!("deleted {deleted} rows");
        Ok(())
    }

    async fn origin(&self, hours: i64, sensor: Option<String>, verbose: bool) -> anyhow::Result<()> {
        let granularity = self.config.granularity();
        let threshold = self.config.scheduled_threshold();
        hours_arg(hours)?;
        let window = TimeWindow::trailing_hours(Utc::now(), hours);
        let rows = self.store.select(&base_filter(sensor).since(window.start)).await?;
        let breakdown = origin_breakdown(&rows, granularity, threshold);

        if self.json {
            #[derive(Serialize)]
            struct OriginRow<'a> {
                sensor_id: &'a SensorId,
                timestamp: String,
                origin: &'static str,
                delay_secs: Option<i64>,
            }
            let detail: Vec<OriginRow> = rows
                .iter()
                .map(|s| OriginRow {
                    sensor_id: &s.record.sensor_id,
                    timestamp: to_backend_string(s.record.timestamp),
                    origin: classify_origin(s, granularity, threshold).as_str(),
                    delay_secs: insertion_delay(s, granularity).map(|d| d.num_seconds()),
                })
                .collect();
            return print_json(&serde_json::json!({ "breakdown": breakdown, "rows": detail }));
        }

        if verbose {
            for s in &rows {
                println!(
                    "{:<16} {}  {:<9} delay={}",
                    s.record.sensor_id,
                    to_backend_string(s.record.timestamp),
                    classify_origin(s, granularity, threshold),
                    insertion_delay(s, granularity)
                        .map(|d| format!("{}s", d.num_seconds()))
                        .unwrap_or_else(|| "-".to_string()),
                );
            }
        }
        println!(
            "scheduled={} manual={} unknown={} total={} (threshold {}s)",
            breakdown.scheduled,
            breakdown.manual,
            breakdown.unknown,
            breakdown.total(),
            threshold.num_seconds()
        );
        Ok(())
    }

    async fn gaps(&self, hours: i64, sensor: Option<String>) -> anyhow::Result<()> {
        let now = Utc::now();
        let utc = chrono::FixedOffset::east_opt(0).context("utc offset")?;
        // Whole hours only; the current hour is still being counted
        let end = align(now, Granularity::Hourly, utc);
        let window = TimeWindow::new(end - hours_arg(hours)?, end);
        let expected: Vec<SensorId> = match &sensor {
            Some(id) => vec![SensorId(id.clone())],
            None => self.config.enabled_sensors().map(|s| s.id.clone()).collect(),
        };
        let rows = self
            .store
            .select(&base_filter(sensor).since(window.start).until(window.end))
            .await?;
        let gaps = find_hourly_gaps(&rows, &window, &expected);

        if self.json {
            return print_json(&gaps);
        }
        if gaps.is_empty() {
            println!("no gaps between {} and {}", to_backend_string(window.start), to_backend_string(window.end));
        }
        for gap in &gaps {
            let hours: Vec<String> = gap.missing.iter().map(|ts| to_backend_string(*ts)).collect();
            println!("{:<16} missing {}: {}", gap.sensor_id, gap.missing.len(), hours.join(", "));
        }
        Ok(())
    }

    async fn summary(&self, hours: Option<i64>, sensor: Option<String>) -> anyhow::Result<()> {
        let mut filter = base_filter(sensor);
        if let Some(hours) = hours {
            filter = filter.since(Utc::now() - hours_arg(hours)?);
        }
        let rows = self.store.select(&filter).await?;
        let summary = summarize(&rows);

        if self.json {
            return print_json(&summary);
        }
        for s in &summary {
            println!(
                "{:<16} rows={:<6} {} .. {}  in={:<8} out={:<8} last_insert={}",
                s.sensor_id,
                s.rows,
                to_backend_string(s.first),
                to_backend_string(s.last),
                s.total_in,
                s.total_out,
                fmt_ts(s.last_inserted),
            );
        }
        Ok(())
    }

    async fn freshness(&self, max_age_mins: Option<i64>) -> anyhow::Result<()> {
        let now = Utc::now();
        let max_age = max_age_mins.map(Duration::minutes).unwrap_or_else(|| {
            Duration::from_std(self.config.stale_after()).unwrap_or_else(|_| Duration::hours(2))
        });
        // Look back far enough to find the last insert of a stale sensor
        let since = now - (max_age * 2).max(Duration::hours(24));
        let rows = self.store.select(&RecordFilter::new().since(since)).await?;
        let expected: Vec<SensorId> = self.config.enabled_sensors().map(|s| s.id.clone()).collect();
        let freshness = ingestion_freshness(&rows, now, max_age, &expected);

        if self.json {
            print_json(&freshness)?;
        } else {
            for f in &freshness {
                println!(
                    "{:<16} {:<5} last_insert={} age={}",
                    f.sensor_id,
                    if f.stale { "STALE" } else { "ok" },
                    fmt_ts(f.last_inserted),
                    f.age_secs.map(|a| format!("{}m", a / 60)).unwrap_or_else(|| "-".to_string()),
                );
            }
        }

        let stale = freshness.iter().filter(|f| f.stale).count();
        if stale > 0 {
            bail!("{stale} of {} sensors are stale", freshness.len());
        }
        Ok(())
    }

    async fn duplicates(&self, hours: i64, sensor: Option<String>) -> anyhow::Result<()> {
        let since = Utc::now() - hours_arg(hours)?;
        let rows = self.store.select(&base_filter(sensor).since(since)).await?;
        let total = rows.len();
        let (_, duplicates) = dedup_stored(rows);

        info!(rows = %total, duplicates = %duplicates.len(), "duplicate_scan");
        let refs: Vec<&StoredRecord> = duplicates.iter().collect();
        print_rows(&refs, self.json)
    }

    async fn watch(
        &self,
        interval_secs: u64,
        max_polls: Option<u64>,
        sensor: Option<String>,
    ) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            let _ = shutdown_tx.send(true);
        });

        let json = self.json;
        let summary = watch_count(
            &self.store,
            &base_filter(sensor),
            std::time::Duration::from_secs(interval_secs.max(1)),
            max_polls,
            shutdown_rx,
            |sample| {
                let now = to_backend_string(Utc::now());
                if json {
                    println!(
                        "{}",
                        serde_json::json!({ "at": now, "count": sample.count, "delta": sample.delta })
                    );
                } else {
                    println!("{now}  count={:<8} delta={:+}", sample.count, sample.delta);
                }
            },
        )
        .await;

        eprintln!(
            "polls={} errors={} net_change={:+}",
            summary.polls,
            summary.errors,
            summary.net_change()
        );
        Ok(())
    }

    async fn probe(&self, sensor_id: &str, lookback: Option<u32>) -> anyhow::Result<()> {
        let sensor = self
            .config
            .sensor(sensor_id)
            .with_context(|| format!("sensor {sensor_id:?} is not in {}", self.config.config_file()))?;
        let granularity = self.config.granularity();
        let lookback = lookback.unwrap_or(self.config.poller().lookback_periods);
        let window = poll_window(Utc::now(), granularity, lookback, sensor.utc_offset)?;

        let client = SensorClient::new(self.config.sensor_timeout())?;
        let records = client
            .fetch(sensor, &window, granularity)
            .await
            .with_context(|| format!("fetching {}", sensor.report_url()))?;

        let stored: Vec<StoredRecord> = records.into_iter().map(StoredRecord::new).collect();
        let refs: Vec<&StoredRecord> = stored.iter().collect();
        print_rows(&refs, self.json)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::from_file(&config_path)?;
    let store = RestStore::new(
        &config.store().base_url,
        &config.store().table,
        &config.store().api_key,
        config.store_request_timeout(),
    )?;
    let diag = Diag { config, store, json: args.json };

    match args.command {
        Command::Future { tolerance_mins, sensor } => diag.future(tolerance_mins, sensor).await,
        Command::PurgeFuture { tolerance_mins, sensor, yes } => {
            diag.purge_future(tolerance_mins, sensor, yes).await
        }
        Command::Origin { hours, sensor, verbose } => diag.origin(hours, sensor, verbose).await,
        Command::Gaps { hours, sensor } => diag.gaps(hours, sensor).await,
        Command::Summary { hours, sensor } => diag.summary(hours, sensor).await,
        Command::Freshness { max_age_mins } => diag.freshness(max_age_mins).await,
        Command::Duplicates { hours, sensor } => diag.duplicates(hours, sensor).await,
        Command::Watch { interval_secs, max_polls, sensor } => {
            diag.watch(interval_secs, max_polls, sensor).await
        }
        Command::Probe { sensor, lookback } => diag.probe(&sensor, lookback).await,
    }
}
