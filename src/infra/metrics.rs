//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for every recording operation. `report()` swaps the periodic
//! counters to zero; `snapshot()` reads without resetting (used by the
//! /metrics endpoint so scrapes don't disturb the log summary).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only, except `last_success_epoch_ms` which /health reads as a
//! best-effort freshness signal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Fetch latency bucket boundaries (milliseconds)
/// Buckets: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600
const BUCKET_BOUNDS: [u64; 10] = [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn read_buckets(buckets: &[AtomicU64; NUM_BUCKETS], reset: bool) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] =
            if reset { bucket.swap(0, Ordering::Relaxed) } else { bucket.load(Ordering::Relaxed) };
    }
    result
}

#[inline]
fn read_counter(counter: &AtomicU64, reset: bool) -> u64 {
    if reset {
        counter.swap(0, Ordering::Relaxed)
    } else {
        counter.load(Ordering::Relaxed)
    }
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Poll cycles completed (monotonic)
    cycles_total: AtomicU64,
    /// Sensor fetches that returned a report (monotonic)
    sensor_polls_total: AtomicU64,
    /// Sensor polls that ended in an error (monotonic)
    sensor_poll_failures_total: AtomicU64,
    records_fetched_total: AtomicU64,
    records_inserted_total: AtomicU64,
    records_updated_total: AtomicU64,
    records_unchanged_total: AtomicU64,
    /// Updates whose totals went down (sensor reset)
    records_decreased_total: AtomicU64,
    records_rejected_future_total: AtomicU64,
    store_errors_total: AtomicU64,
    /// Fetch latency histogram (reset on report)
    fetch_latency_buckets: [AtomicU64; NUM_BUCKETS],
    fetch_latency_sum_ms: AtomicU64,
    fetch_latency_max_ms: AtomicU64,
    /// Same histogram, never reset (exported on /metrics)
    fetch_latency_total_buckets: [AtomicU64; NUM_BUCKETS],
    fetch_latency_total_sum_ms: AtomicU64,
    /// Epoch ms of the last cycle with at least one successful sensor (0 = never)
    last_success_epoch_ms: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cycles_total: AtomicU64::new(0),
            sensor_polls_total: AtomicU64::new(0),
            sensor_poll_failures_total: AtomicU64::new(0),
            records_fetched_total: AtomicU64::new(0),
            records_inserted_total: AtomicU64::new(0),
            records_updated_total: AtomicU64::new(0),
            records_unchanged_total: AtomicU64::new(0),
            records_decreased_total: AtomicU64::new(0),
            records_rejected_future_total: AtomicU64::new(0),
            store_errors_total: AtomicU64::new(0),
            fetch_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            fetch_latency_sum_ms: AtomicU64::new(0),
            fetch_latency_max_ms: AtomicU64::new(0),
            fetch_latency_total_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            fetch_latency_total_sum_ms: AtomicU64::new(0),
            last_success_epoch_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_cycle(&self) {
        self.cycles_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful sensor fetch with its latency and record count
    #[inline]
    pub fn record_fetch(&self, latency_ms: u64, records: usize) {
        self.sensor_polls_total.fetch_add(1, Ordering::Relaxed);
        self.records_fetched_total.fetch_add(records as u64, Ordering::Relaxed);
        self.fetch_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.fetch_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.fetch_latency_total_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.fetch_latency_total_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.fetch_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_poll_failure(&self) {
        self.sensor_poll_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_error(&self) {
        self.store_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected_future(&self, count: usize) {
        self.records_rejected_future_total.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Record the result of one applied upsert plan
    #[inline]
    pub fn record_upsert(&self, inserted: usize, updated: usize, unchanged: usize, decreased: usize) {
        self.records_inserted_total.fetch_add(inserted as u64, Ordering::Relaxed);
        self.records_updated_total.fetch_add(updated as u64, Ordering::Relaxed);
        self.records_unchanged_total.fetch_add(unchanged as u64, Ordering::Relaxed);
        self.records_decreased_total.fetch_add(decreased as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn mark_success(&self, epoch_ms: u64) {
        self.last_success_epoch_ms.store(epoch_ms, Ordering::Relaxed);
    }

    /// Epoch ms of the last successful cycle, if any
    pub fn last_success_epoch_ms(&self) -> Option<u64> {
        match self.last_success_epoch_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Summary that resets the periodic fetch-latency histogram
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Summary without resetting anything
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let fetch_latency_buckets = read_buckets(&self.fetch_latency_buckets, reset);
        let fetch_latency_sum = read_counter(&self.fetch_latency_sum_ms, reset);
        let fetch_latency_max_ms = read_counter(&self.fetch_latency_max_ms, reset);
        let fetch_count: u64 = fetch_latency_buckets.iter().sum();
        let fetch_latency_avg_ms =
            if fetch_count > 0 { fetch_latency_sum / fetch_count } else { 0 };

        let elapsed_secs = if reset {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed.as_secs_f64()
        } else {
            self.last_report_time.lock().elapsed().as_secs_f64()
        };

        MetricsSummary {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            sensor_polls_total: self.sensor_polls_total.load(Ordering::Relaxed),
            sensor_poll_failures_total: self.sensor_poll_failures_total.load(Ordering::Relaxed),
            records_fetched_total: self.records_fetched_total.load(Ordering::Relaxed),
            records_inserted_total: self.records_inserted_total.load(Ordering::Relaxed),
            records_updated_total: self.records_updated_total.load(Ordering::Relaxed),
            records_unchanged_total: self.records_unchanged_total.load(Ordering::Relaxed),
            records_decreased_total: self.records_decreased_total.load(Ordering::Relaxed),
            records_rejected_future_total: self
                .records_rejected_future_total
                .load(Ordering::Relaxed),
            store_errors_total: self.store_errors_total.load(Ordering::Relaxed),
            fetch_latency_buckets,
            fetch_latency_avg_ms,
            fetch_latency_max_ms,
            fetch_latency_p50_ms: percentile_from_buckets(&fetch_latency_buckets, 0.50),
            fetch_latency_p99_ms: percentile_from_buckets(&fetch_latency_buckets, 0.99),
            fetch_latency_cumulative_buckets: read_buckets(&self.fetch_latency_total_buckets, false),
            fetch_latency_cumulative_sum_ms: self.fetch_latency_total_sum_ms.load(Ordering::Relaxed),
            last_success_epoch_ms: self.last_success_epoch_ms(),
            window_secs: elapsed_secs,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the /metrics formatter)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub cycles_total: u64,
    pub sensor_polls_total: u64,
    pub sensor_poll_failures_total: u64,
    pub records_fetched_total: u64,
    pub records_inserted_total: u64,
    pub records_updated_total: u64,
    pub records_unchanged_total: u64,
    pub records_decreased_total: u64,
    pub records_rejected_future_total: u64,
    pub store_errors_total: u64,
    /// Bounds: ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, >25600 ms
    pub fetch_latency_buckets: [u64; NUM_BUCKETS],
    pub fetch_latency_avg_ms: u64,
    pub fetch_latency_max_ms: u64,
    pub fetch_latency_p50_ms: u64,
    pub fetch_latency_p99_ms: u64,
    /// Since process start, for Prometheus
    pub fetch_latency_cumulative_buckets: [u64; NUM_BUCKETS],
    pub fetch_latency_cumulative_sum_ms: u64,
    pub last_success_epoch_ms: Option<u64>,
    /// Seconds covered by the periodic (reset-on-report) values
    pub window_secs: f64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            cycles = %self.cycles_total,
            polls = %self.sensor_polls_total,
            poll_failures = %self.sensor_poll_failures_total,
            fetched = %self.records_fetched_total,
            inserted = %self.records_inserted_total,
            updated = %self.records_updated_total,
            unchanged = %self.records_unchanged_total,
            decreased = %self.records_decreased_total,
            rejected_future = %self.records_rejected_future_total,
            store_errors = %self.store_errors_total,
            fetch_avg_ms = %self.fetch_latency_avg_ms,
            fetch_p99_ms = %self.fetch_latency_p99_ms,
            fetch_max_ms = %self.fetch_latency_max_ms,
            window_secs = %format!("{:.1}", self.window_secs),
            "metrics"
        );
    }
}
