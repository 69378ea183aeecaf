//! Integration tests for the polling cycle against the in-memory store

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use counter_sync::domain::timestamp::{parse_utc_offset, TimeWindow};
use counter_sync::domain::types::{CountRecord, Granularity, SensorId};
use counter_sync::infra::config::SensorConfig;
use counter_sync::infra::{Metrics, SensorError};
use counter_sync::io::{CountStore, MemoryStore, RecordFilter, SensorSource};
use counter_sync::services::{PollSettings, Poller, RetryPolicy};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).single().unwrap()
}

fn sensor(id: &str) -> Arc<SensorConfig> {
    Arc::new(SensorConfig {
        id: id.into(),
        store_id: "store-1".into(),
        org_id: "org-1".into(),
        base_url: "http://sensor.invalid".to_string(),
        path: "/cgi-bin/report.cgi".to_string(),
        username: None,
        password: None,
        utc_offset: parse_utc_offset("Z").unwrap(),
        lines: vec![1, 2, 3, 4],
        enabled: true,
    })
}

fn rec(id: &str, h: u32, in_count: u32) -> CountRecord {
    CountRecord::new(id.into(), "store-1".into(), "org-1".into(), at(h, 0))
        .with_line(1, in_count, in_count / 2)
        .unwrap()
}

/// Sensor source with scripted reports and failures
#[derive(Default)]
struct FakeSource {
    reports: Mutex<HashMap<SensorId, Vec<CountRecord>>>,
    /// Transient (503) failures left before a sensor answers
    transient: Mutex<HashMap<SensorId, u32>>,
    /// Sensors that always reject credentials
    broken: Vec<SensorId>,
    calls: AtomicU32,
}

impl FakeSource {
    fn set_report(&self, id: &str, records: Vec<CountRecord>) {
        self.reports.lock().insert(id.into(), records);
    }
}

#[async_trait]
impl SensorSource for FakeSource {
    async fn fetch(
        &self,
        sensor: &SensorConfig,
        _window: &TimeWindow,
        _granularity: Granularity,
    ) -> Result<Vec<CountRecord>, SensorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(&sensor.id) {
            return Err(SensorError::HttpStatus { status: 401, body: "unauthorized".to_string() });
        }
        if let Some(left) = self.transient.lock().get_mut(&sensor.id) {
            if *left > 0 {
                *left -= 1;
                return Err(SensorError::HttpStatus { status: 503, body: "busy".to_string() });
            }
        }
        Ok(self.reports.lock().get(&sensor.id).cloned().unwrap_or_default())
    }
}

fn settings() -> PollSettings {
    PollSettings {
        granularity: Granularity::Hourly,
        lookback_periods: 3,
        future_tolerance: chrono::Duration::minutes(5),
        max_concurrent_sensors: 2,
        poll_interval: Duration::from_secs(900),
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        multiplier: 2.0,
    }
}

fn poller(
    sensors: Vec<Arc<SensorConfig>>,
    source: Arc<FakeSource>,
    store: Arc<MemoryStore>,
    metrics: Arc<Metrics>,
) -> Poller {
    Poller::with_settings(settings(), fast_retry(), sensors, source, store, metrics)
}

#[tokio::test]
async fn test_cycle_inserts_then_is_idempotent() {
    let source = Arc::new(FakeSource::default());
    source.set_report("pc-01", vec![rec("pc-01", 9, 10), rec("pc-01", 10, 20), rec("pc-01", 11, 5)]);
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let poller = poller(vec![sensor("pc-01")], source.clone(), store.clone(), metrics.clone());

    let first = poller.run_cycle_at(at(12, 20)).await;
    assert_eq!(first.succeeded(), 1);
    assert_eq!(first.inserted(), 3);
    assert_eq!(store.len(), 3);

    let second = poller.run_cycle_at(at(12, 35)).await;
    assert_eq!(second.inserted(), 0);
    assert_eq!(second.updated(), 0);
    assert_eq!(second.outcomes[0].unchanged, 3);
    assert_eq!(store.len(), 3);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.cycles_total, 2);
    assert_eq!(snapshot.records_inserted_total, 3);
    assert_eq!(snapshot.records_unchanged_total, 3);
    assert!(snapshot.last_success_epoch_ms.is_some());
}

#[tokio::test]
async fn test_later_poll_updates_counts() {
    let source = Arc::new(FakeSource::default());
    source.set_report("pc-01", vec![rec("pc-01", 11, 5)]);
    let store = Arc::new(MemoryStore::new());
    let poller = poller(vec![sensor("pc-01")], source.clone(), store.clone(), Arc::new(Metrics::new()));

    poller.run_cycle_at(at(11, 30)).await;
    let id_before = store.all()[0].id;

    source.set_report("pc-01", vec![rec("pc-01", 11, 42)]);
    let report = poller.run_cycle_at(at(12, 5)).await;
    assert_eq!(report.updated(), 1);

    let rows = store.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.total_in(), 42);
    assert_eq!(rows[0].id, id_before);
}

#[tokio::test]
async fn test_decreased_counts_are_applied() {
    let source = Arc::new(FakeSource::default());
    source.set_report("pc-01", vec![rec("pc-01", 10, 50)]);
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let poller = poller(vec![sensor("pc-01")], source.clone(), store.clone(), metrics.clone());

    poller.run_cycle_at(at(11, 0)).await;
    source.set_report("pc-01", vec![rec("pc-01", 10, 3)]);
    let report = poller.run_cycle_at(at(11, 15)).await;

    assert_eq!(report.outcomes[0].decreased, 1);
    assert_eq!(store.all()[0].record.total_in(), 3);
    assert_eq!(metrics.snapshot().records_decreased_total, 1);
}

#[tokio::test]
async fn test_future_dated_records_are_never_written() {
    let source = Arc::new(FakeSource::default());
    source.set_report("pc-01", vec![rec("pc-01", 12, 4), rec("pc-01", 14, 9)]);
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let poller = poller(vec![sensor("pc-01")], source, store.clone(), metrics.clone());

    let report = poller.run_cycle_at(at(12, 20)).await;

    assert_eq!(report.outcomes[0].fetched, 2);
    assert_eq!(report.outcomes[0].rejected_future, 1);
    assert_eq!(report.inserted(), 1);
    let future = store.count(&RecordFilter::new().since(at(13, 0))).await.unwrap();
    assert_eq!(future, 0);
    assert_eq!(metrics.snapshot().records_rejected_future_total, 1);
}

#[tokio::test]
async fn test_failing_sensor_does_not_abort_cycle() {
    let source = Arc::new(FakeSource { broken: vec!["pc-02".into()], ..Default::default() });
    source.set_report("pc-01", vec![rec("pc-01", 10, 1)]);
    source.set_report("pc-03", vec![rec("pc-03", 10, 2)]);
    let store = Arc::new(MemoryStore::new());
    let metrics = Arc::new(Metrics::new());
    let sensors = vec![sensor("pc-01"), sensor("pc-02"), sensor("pc-03")];
    let poller = poller(sensors, source.clone(), store.clone(), metrics.clone());

    let report = poller.run_cycle_at(at(11, 0)).await;

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert!(!report.all_failed());
    let failed = report.outcomes.iter().find(|o| !o.is_success()).unwrap();
    assert_eq!(failed.sensor_id.as_str(), "pc-02");
    assert!(failed.error.as_deref().unwrap().contains("401"));
    assert_eq!(store.len(), 2);
    // 401 is not retried
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.snapshot().sensor_poll_failures_total, 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let source = Arc::new(FakeSource::default());
    source.transient.lock().insert("pc-01".into(), 2);
    source.set_report("pc-01", vec![rec("pc-01", 10, 7)]);
    let store = Arc::new(MemoryStore::new());
    let poller = poller(vec![sensor("pc-01")], source.clone(), store.clone(), Arc::new(Metrics::new()));

    let report = poller.run_cycle_at(at(11, 0)).await;

    assert_eq!(report.succeeded(), 1);
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_all_sensors_failing() {
    let source = Arc::new(FakeSource {
        broken: vec!["pc-01".into(), "pc-02".into()],
        ..Default::default()
    });
    let metrics = Arc::new(Metrics::new());
    let poller = poller(
        vec![sensor("pc-01"), sensor("pc-02")],
        source,
        Arc::new(MemoryStore::new()),
        metrics.clone(),
    );

    let report = poller.run_cycle_at(at(11, 0)).await;

    assert!(report.all_failed());
    assert_eq!(metrics.last_success_epoch_ms(), None);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let source = Arc::new(FakeSource::default());
    let poller = poller(vec![sensor("pc-01")], source.clone(), Arc::new(MemoryStore::new()), Arc::new(Metrics::new()));
    let (tx, rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(async move { poller.run(rx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    // First tick fires immediately
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
}
