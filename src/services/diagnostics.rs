//! Operator diagnostics over stored rows
//!
//! All functions are pure: callers select the rows (usually through
//! `CountStore::select`) and pass them in with an explicit "now".

use crate::domain::timestamp::TimeWindow;
use crate::domain::types::{Granularity, SensorId, StoredRecord};
use crate::io::store::RecordFilter;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Rows stamped later than `now + tolerance`
pub fn find_future_dated(
    records: &[StoredRecord],
    now: DateTime<Utc>,
    tolerance: Duration,
) -> Vec<&StoredRecord> {
    let cutoff = now + tolerance;
    records.iter().filter(|s| s.record.timestamp > cutoff).collect()
}

/// Narrow `base` to the rows `find_future_dated` would report
///
/// Stored timestamps are whole seconds, so `timestamp > now + tolerance`
/// is the same as `timestamp >= trunc(now + tolerance) + 1s`.
pub fn future_dated_filter(base: RecordFilter, now: DateTime<Utc>, tolerance: Duration) -> RecordFilter {
    let cutoff = (now + tolerance).trunc_subsecs(0) + Duration::seconds(1);
    base.since(cutoff)
}

/// How a row most likely got into the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertOrigin {
    /// Inserted by the scheduled job shortly after its period closed
    Scheduled,
    /// Inserted well after the period (backfill or by hand), or before it ended
    Manual,
    /// No insertion time recorded
    Unknown,
}

impl InsertOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsertOrigin::Scheduled => "scheduled",
            InsertOrigin::Manual => "manual",
            InsertOrigin::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InsertOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Delay between the end of a row's period and its insertion
pub fn insertion_delay(stored: &StoredRecord, granularity: Granularity) -> Option<Duration> {
    let period_end = stored.record.timestamp + granularity.period();
    stored.inserted_at.map(|inserted| inserted - period_end)
}

/// Classify by insertion delay: `0 <= delay <= threshold` is scheduled
pub fn classify_origin(
    stored: &StoredRecord,
    granularity: Granularity,
    threshold: Duration,
) -> InsertOrigin {
    match insertion_delay(stored, granularity) {
        None => InsertOrigin::Unknown,
        Some(delay) if delay >= Duration::zero() && delay <= threshold => InsertOrigin::Scheduled,
        Some(_) => InsertOrigin::Manual,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OriginBreakdown {
    pub scheduled: usize,
    pub manual: usize,
    pub unknown: usize,
}

impl OriginBreakdown {
    pub fn total(&self) -> usize {
        self.scheduled + self.manual + self.unknown
    }
}

pub fn origin_breakdown(
    records: &[StoredRecord],
    granularity: Granularity,
    threshold: Duration,
) -> OriginBreakdown {
    let mut breakdown = OriginBreakdown::default();
    for stored in records {
        match classify_origin(stored, granularity, threshold) {
            InsertOrigin::Scheduled => breakdown.scheduled += 1,
            InsertOrigin::Manual => breakdown.manual += 1,
            InsertOrigin::Unknown => breakdown.unknown += 1,
        }
    }
    breakdown
}

/// Missing period starts for one sensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorGaps {
    pub sensor_id: SensorId,
    pub missing: Vec<DateTime<Utc>>,
}

/// Missing hours per sensor inside `window`
pub fn find_hourly_gaps(
    records: &[StoredRecord],
    window: &TimeWindow,
    expected: &[SensorId],
) -> Vec<SensorGaps> {
    find_gaps(records, window, Granularity::Hourly, expected)
}

/// Missing periods per sensor inside `window`
///
/// Expected starts follow each sensor's own phase (taken from its rows), so
/// devices on half-hour offsets are not reported as entirely missing.
/// Sensors in `expected` without any row in the window miss every period,
/// stepped from `window.start`.
pub fn find_gaps(
    records: &[StoredRecord],
    window: &TimeWindow,
    granularity: Granularity,
    expected: &[SensorId],
) -> Vec<SensorGaps> {
    let mut present: BTreeMap<&SensorId, BTreeSet<DateTime<Utc>>> =
        expected.iter().map(|id| (id, BTreeSet::new())).collect();
    for stored in records.iter().filter(|s| window.contains(s.record.timestamp)) {
        present.entry(&stored.record.sensor_id).or_default().insert(stored.record.timestamp);
    }

    let period_secs = granularity.period().num_seconds();
    let mut gaps = Vec::new();
    for (sensor_id, seen) in present {
        let phase = seen
            .first()
            .map_or(0, |anchor| (*anchor - window.start).num_seconds().rem_euclid(period_secs));
        let phased = TimeWindow::new(window.start + Duration::seconds(phase), window.end);

        let missing: Vec<DateTime<Utc>> =
            phased.period_starts(granularity).filter(|ts| !seen.contains(ts)).collect();
        if !missing.is_empty() {
            gaps.push(SensorGaps { sensor_id: sensor_id.clone(), missing });
        }
    }
    gaps
}

/// Per-sensor overview of stored rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SensorSummary {
    pub sensor_id: SensorId,
    pub rows: usize,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    pub total_in: u64,
    pub total_out: u64,
    pub last_inserted: Option<DateTime<Utc>>,
}

pub fn summarize(records: &[StoredRecord]) -> Vec<SensorSummary> {
    let mut by_sensor: BTreeMap<&SensorId, SensorSummary> = BTreeMap::new();
    for stored in records {
        let r = &stored.record;
        let summary = by_sensor.entry(&r.sensor_id).or_insert_with(|| SensorSummary {
            sensor_id: r.sensor_id.clone(),
            rows: 0,
            first: r.timestamp,
            last: r.timestamp,
            total_in: 0,
            total_out: 0,
            last_inserted: None,
        });
        summary.rows += 1;
        summary.first = summary.first.min(r.timestamp);
        summary.last = summary.last.max(r.timestamp);
        summary.total_in += r.total_in();
        summary.total_out += r.total_out();
        summary.last_inserted = summary.last_inserted.max(stored.inserted_at);
    }
    by_sensor.into_values().collect()
}

/// Did ingestion run recently for this sensor?
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Freshness {
    pub sensor_id: SensorId,
    pub last_inserted: Option<DateTime<Utc>>,
    /// `now - last_inserted`
    pub age_secs: Option<i64>,
    pub stale: bool,
}

/// Latest insertion per sensor and whether it is older than `max_age`
///
/// Sensors in `expected` without any row are reported stale with no
/// insertion time.
pub fn ingestion_freshness(
    records: &[StoredRecord],
    now: DateTime<Utc>,
    max_age: Duration,
    expected: &[SensorId],
) -> Vec<Freshness> {
    let mut latest: BTreeMap<&SensorId, Option<DateTime<Utc>>> =
        expected.iter().map(|id| (id, None)).collect();
    for stored in records {
        let entry = latest.entry(&stored.record.sensor_id).or_insert(None);
        *entry = (*entry).max(stored.inserted_at);
    }

    latest
        .into_iter()
        .map(|(sensor_id, last_inserted)| {
            let age = last_inserted.map(|at| now - at);
            Freshness {
                sensor_id: sensor_id.clone(),
                last_inserted,
                age_secs: age.map(|a| a.num_seconds()),
                stale: age.map_or(true, |a| a > max_age),
            }
        })
        .collect()
}
