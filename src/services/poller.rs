//! Polling scheduler
//!
//! One cycle polls every enabled sensor concurrently (bounded by a
//! semaphore): fetch the trailing window, drop future-dated records, plan
//! against the rows already stored, then upsert only what changed. A failing
//! sensor is recorded in its outcome and never aborts the cycle.

use crate::domain::timestamp::{poll_window, to_backend_string};
use crate::domain::types::{CountRecord, Granularity, SensorId};
use crate::infra::config::{secs_to_chrono, Config, SensorConfig};
use crate::infra::metrics::Metrics;
use crate::io::sensor::SensorSource;
use crate::io::store::{CountStore, RecordFilter};
use crate::services::reconcile::plan_upsert;
use crate::services::retry::{retry, RetryPolicy};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-cycle knobs taken from the `[poller]` section
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub granularity: Granularity,
    pub lookback_periods: u32,
    pub future_tolerance: chrono::Duration,
    pub max_concurrent_sensors: usize,
    pub poll_interval: Duration,
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        let poller = config.poller();
        Self {
            granularity: config.granularity(),
            lookback_periods: poller.lookback_periods,
            future_tolerance: secs_to_chrono(poller.future_tolerance_secs),
            max_concurrent_sensors: poller.max_concurrent_sensors.max(1),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Result of polling one sensor in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorOutcome {
    pub sensor_id: SensorId,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub decreased: usize,
    pub rejected_future: usize,
    pub error: Option<String>,
}

impl SensorOutcome {
    fn new(sensor_id: SensorId) -> Self {
        Self {
            sensor_id,
            fetched: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            decreased: 0,
            rejected_future: 0,
            error: None,
        }
    }

    fn failed(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate of one cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub outcomes: Vec<SensorOutcome>,
    /// Sensor tasks that panicked or were cancelled
    pub task_failures: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded() + self.task_failures
    }

    /// True when at least one sensor was polled and none succeeded
    pub fn all_failed(&self) -> bool {
        self.succeeded() == 0 && self.failed() > 0
    }

    pub fn inserted(&self) -> usize {
        self.outcomes.iter().map(|o| o.inserted).sum()
    }

    pub fn updated(&self) -> usize {
        self.outcomes.iter().map(|o| o.updated).sum()
    }

    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            sensors_ok = %self.succeeded(),
            sensors_failed = %self.failed(),
            fetched = %self.outcomes.iter().map(|o| o.fetched).sum::<usize>(),
            inserted = %self.inserted(),
            updated = %self.updated(),
            unchanged = %self.outcomes.iter().map(|o| o.unchanged).sum::<usize>(),
            rejected_future = %self.outcomes.iter().map(|o| o.rejected_future).sum::<usize>(),
            elapsed_ms = %self.elapsed.as_millis(),
            "poll_cycle_complete"
        );
    }
}

/// Shared by every sensor task of a cycle
struct PollContext {
    settings: PollSettings,
    retry: RetryPolicy,
    source: Arc<dyn SensorSource>,
    store: Arc<dyn CountStore>,
    metrics: Arc<Metrics>,
}

pub struct Poller {
    ctx: Arc<PollContext>,
    sensors: Vec<Arc<SensorConfig>>,
    limit: Arc<Semaphore>,
}

impl Poller {
    pub fn new(
        config: &Config,
        source: Arc<dyn SensorSource>,
        store: Arc<dyn CountStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let settings = PollSettings::from_config(config);
        let sensors = config.enabled_sensors().cloned().map(Arc::new).collect();
        Self::with_settings(settings, RetryPolicy::from(config.retry()), sensors, source, store, metrics)
    }

    pub fn with_settings(
        settings: PollSettings,
        retry: RetryPolicy,
        sensors: Vec<Arc<SensorConfig>>,
        source: Arc<dyn SensorSource>,
        store: Arc<dyn CountStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limit = Arc::new(Semaphore::new(settings.max_concurrent_sensors));
        let ctx = Arc::new(PollContext { settings, retry, source, store, metrics });
        Self { ctx, sensors, limit }
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Poll on a fixed interval until shutdown; the first cycle runs at once
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sensors = %self.sensors.len(),
            interval_secs = %self.ctx.settings.poll_interval.as_secs(),
            granularity = %self.ctx.settings.granularity.as_str(),
            lookback = %self.ctx.settings.lookback_periods,
            "poller_started"
        );

        let mut ticker = interval(self.ctx.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("poller_shutdown");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.run_cycle().await.log();
                }
            }
        }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    /// One cycle with an explicit "now" (windows and the future cutoff use it)
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let run_id = Uuid::now_v7();
        let started = Instant::now();
        debug!(run_id = %run_id, now = %to_backend_string(now), "poll_cycle_started");

        let mut tasks = JoinSet::new();
        for sensor in &self.sensors {
            let ctx = self.ctx.clone();
            let sensor = sensor.clone();
            let limit = self.limit.clone();
            tasks.spawn(async move {
                let _permit = match limit.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return SensorOutcome::new(sensor.id.clone()).failed("poller closed");
                    }
                };
                poll_sensor(&ctx, &sensor, now).await
            });
        }

        let mut outcomes = Vec::with_capacity(self.sensors.len());
        let mut task_failures = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "sensor_task_failed");
                    self.ctx.metrics.record_poll_failure();
                    task_failures += 1;
                }
            }
        }
        outcomes.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));

        self.ctx.metrics.record_cycle();
        let report = CycleReport { run_id, outcomes, task_failures, elapsed: started.elapsed() };
        if report.succeeded() > 0 {
            self.ctx.metrics.mark_success(Utc::now().timestamp_millis().max(0) as u64);
        }
        report
    }
}

/// Fetch, filter, reconcile and write one sensor's window
async fn poll_sensor(ctx: &PollContext, sensor: &SensorConfig, now: DateTime<Utc>) -> SensorOutcome {
    let outcome = SensorOutcome::new(sensor.id.clone());
    let settings = &ctx.settings;
    let window = match poll_window(now, settings.granularity, settings.lookback_periods, sensor.utc_offset) {
        Ok(window) => window,
        Err(e) => {
            ctx.metrics.record_poll_failure();
            warn!(sensor_id = %sensor.id, error = %e, "poll_window_invalid");
            return outcome.failed(e);
        }
    };

    let fetch_start = Instant::now();
    let fetched = retry(&ctx.retry, "sensor_fetch", || {
        ctx.source.fetch(sensor, &window, settings.granularity)
    })
    .await;
    let records = match fetched {
        Ok(records) => records,
        Err(e) => {
            ctx.metrics.record_poll_failure();
            warn!(sensor_id = %sensor.id, error = %e, "sensor_fetch_failed");
            return outcome.failed(e);
        }
    };
    ctx.metrics.record_fetch(fetch_start.elapsed().as_millis() as u64, records.len());

    let mut outcome = SensorOutcome { fetched: records.len(), ..outcome };
    let (records, rejected) = drop_future_dated(records, now + settings.future_tolerance);
    if !rejected.is_empty() {
        ctx.metrics.record_rejected_future(rejected.len());
        warn!(
            sensor_id = %sensor.id,
            count = %rejected.len(),
            first = %to_backend_string(rejected[0].timestamp),
            "future_dated_records_dropped"
        );
    }
    outcome.rejected_future = rejected.len();

    let (Some(first), Some(last)) =
        (records.iter().map(|r| r.timestamp).min(), records.iter().map(|r| r.timestamp).max())
    else {
        debug!(sensor_id = %sensor.id, "sensor_report_empty");
        return outcome;
    };

    let filter = RecordFilter::new()
        .sensor(sensor.id.clone())
        .since(first)
        .until(last + chrono::Duration::seconds(1));
    let existing = match retry(&ctx.retry, "store_select", || ctx.store.select(&filter)).await {
        Ok(rows) => rows,
        Err(e) => {
            ctx.metrics.record_store_error();
            warn!(sensor_id = %sensor.id, error = %e, "store_select_failed");
            return outcome.failed(e);
        }
    };

    let plan = plan_upsert(records, &existing);
    for record in &plan.decreased {
        warn!(
            sensor_id = %sensor.id,
            timestamp = %to_backend_string(record.timestamp),
            total_in = %record.total_in(),
            total_out = %record.total_out(),
            "counts_decreased"
        );
    }

    if !plan.is_noop() {
        let batch = plan.to_write();
        if let Err(e) = retry(&ctx.retry, "store_upsert", || ctx.store.upsert(&batch)).await {
            ctx.metrics.record_store_error();
            warn!(sensor_id = %sensor.id, error = %e, rows = %batch.len(), "store_upsert_failed");
            return outcome.failed(e);
        }
    }

    ctx.metrics.record_upsert(
        plan.inserts.len(),
        plan.updates.len(),
        plan.unchanged,
        plan.decreased.len(),
    );
    outcome.inserted = plan.inserts.len();
    outcome.updated = plan.updates.len();
    outcome.unchanged = plan.unchanged;
    outcome.decreased = plan.decreased.len();

    debug!(
        sensor_id = %sensor.id,
        inserted = %outcome.inserted,
        updated = %outcome.updated,
        unchanged = %outcome.unchanged,
        "sensor_poll_complete"
    );
    outcome
}

/// Split records into (kept, dropped) at `cutoff` (inclusive)
pub fn drop_future_dated(
    records: Vec<CountRecord>,
    cutoff: DateTime<Utc>,
) -> (Vec<CountRecord>, Vec<CountRecord>) {
    records.into_iter().partition(|r| r.timestamp <= cutoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).single().unwrap()
    }

    fn rec(h: u32) -> CountRecord {
        CountRecord::new("pc-01".into(), "store-1".into(), "org-1".into(), ts(h))
    }

    #[test]
    fn test_drop_future_dated_boundary() {
        let (kept, dropped) = drop_future_dated(vec![rec(10), rec(11), rec(12)], ts(11));
        assert_eq!(kept.len(), 2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].timestamp, ts(12));
    }

    #[test]
    fn test_cycle_report_counts() {
        let ok = SensorOutcome { inserted: 2, ..SensorOutcome::new("a".into()) };
        let bad = SensorOutcome::new("b".into()).failed("timeout");
        let report = CycleReport {
            run_id: Uuid::now_v7(),
            outcomes: vec![ok, bad.clone()],
            task_failures: 0,
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.inserted(), 2);
        assert!(!report.all_failed());

        let report = CycleReport { outcomes: vec![bad], ..report };
        assert!(report.all_failed());
    }

    #[test]
    fn test_empty_cycle_is_not_a_failure() {
        let report = CycleReport {
            run_id: Uuid::now_v7(),
            outcomes: Vec::new(),
            task_failures: 0,
            elapsed: Duration::ZERO,
        };
        assert!(!report.all_failed());
    }
}
