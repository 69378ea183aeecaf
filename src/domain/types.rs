//! Shared types for people-counting records

use crate::domain::timestamp::{parse_backend_timestamp, to_backend_string, TimestampError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Lines a single sensor can report on
pub const MAX_LINES: u8 = 4;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Sensor identifier as stored in the `sensor_id` column
    SensorId
);
string_id!(
    /// Store (site) a sensor is installed in
    StoreId
);
string_id!(
    /// Organization owning the store
    OrgId
);

/// Statistics granularity requested from sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Hourly,
    Daily,
}

impl Granularity {
    pub fn period(&self) -> chrono::Duration {
        match self {
            Granularity::Hourly => chrono::Duration::hours(1),
            Granularity::Daily => chrono::Duration::days(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("line {0} is outside 1..=4")]
pub struct InvalidLine(pub u8);

/// A stored row that does not map onto a record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
    #[error(transparent)]
    Line(#[from] InvalidLine),
}

/// Directional counts for one physical line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineCount {
    pub line: u8,
    pub in_count: u32,
    pub out_count: u32,
}

/// Unique key of a row in the counts table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub sensor_id: SensorId,
    pub timestamp: DateTime<Utc>,
}

/// One period of people counting for one sensor
///
/// Lines are kept sorted and unique; totals are always derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountRecord {
    pub sensor_id: SensorId,
    pub store_id: StoreId,
    pub org_id: OrgId,
    /// Start of the counted period (UTC)
    pub timestamp: DateTime<Utc>,
    lines: SmallVec<[LineCount; 4]>,
}

impl CountRecord {
    pub fn new(
        sensor_id: SensorId,
        store_id: StoreId,
        org_id: OrgId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self { sensor_id, store_id, org_id, timestamp, lines: SmallVec::new() }
    }

    /// Add counts to a line, creating it if absent
    pub fn add_line(&mut self, line: u8, in_count: u32, out_count: u32) -> Result<(), InvalidLine> {
        if line == 0 || line > MAX_LINES {
            return Err(InvalidLine(line));
        }
        match self.lines.binary_search_by_key(&line, |l| l.line) {
            Ok(idx) => {
                let existing = &mut self.lines[idx];
                existing.in_count = existing.in_count.saturating_add(in_count);
                existing.out_count = existing.out_count.saturating_add(out_count);
            }
            Err(idx) => self.lines.insert(idx, LineCount { line, in_count, out_count }),
        }
        Ok(())
    }

    /// Builder form of [`CountRecord::add_line`] for literal construction
    pub fn with_line(mut self, line: u8, in_count: u32, out_count: u32) -> Result<Self, InvalidLine> {
        self.add_line(line, in_count, out_count)?;
        Ok(self)
    }

    pub fn lines(&self) -> &[LineCount] {
        &self.lines
    }

    pub fn line(&self, line: u8) -> Option<&LineCount> {
        self.lines.iter().find(|l| l.line == line)
    }

    /// Drop lines not present in `keep`
    pub fn retain_lines(&mut self, keep: &[u8]) {
        self.lines.retain(|l| keep.contains(&l.line));
    }

    pub fn total_in(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.in_count)).sum()
    }

    pub fn total_out(&self) -> u64 {
        self.lines.iter().map(|l| u64::from(l.out_count)).sum()
    }

    pub fn key(&self) -> RecordKey {
        RecordKey { sensor_id: self.sensor_id.clone(), timestamp: self.timestamp }
    }

    /// Counts per line slot, absent lines as zero
    pub fn counts(&self) -> [(u32, u32); MAX_LINES as usize] {
        let mut out = [(0, 0); MAX_LINES as usize];
        for l in &self.lines {
            out[usize::from(l.line - 1)] = (l.in_count, l.out_count);
        }
        out
    }

    /// True when every column that would be written matches
    pub fn same_content(&self, other: &CountRecord) -> bool {
        self.store_id == other.store_id && self.org_id == other.org_id && self.counts() == other.counts()
    }

    pub fn to_row(&self) -> RecordRow {
        let c = self.counts();
        RecordRow {
            id: None,
            sensor_id: self.sensor_id.clone(),
            store_id: self.store_id.clone(),
            org_id: self.org_id.clone(),
            timestamp: to_backend_string(self.timestamp),
            line1_in: Some(c[0].0),
            line1_out: Some(c[0].1),
            line2_in: Some(c[1].0),
            line2_out: Some(c[1].1),
            line3_in: Some(c[2].0),
            line3_out: Some(c[2].1),
            line4_in: Some(c[3].0),
            line4_out: Some(c[3].1),
            total_in: Some(self.total_in()),
            total_out: Some(self.total_out()),
            inserted_at: None,
        }
    }
}

/// A record as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: Option<i64>,
    pub record: CountRecord,
    pub inserted_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    pub fn new(record: CountRecord) -> Self {
        Self { id: None, record, inserted_at: None }
    }

    pub fn with_inserted_at(mut self, inserted_at: DateTime<Utc>) -> Self {
        self.inserted_at = Some(inserted_at);
        self
    }
}

/// Flat row shape of the counts table
///
/// Line columns are nullable on the backend, totals are written on every
/// upsert so readers never need to sum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub sensor_id: SensorId,
    pub store_id: StoreId,
    pub org_id: OrgId,
    pub timestamp: String,
    #[serde(default)]
    pub line1_in: Option<u32>,
    #[serde(default)]
    pub line1_out: Option<u32>,
    #[serde(default)]
    pub line2_in: Option<u32>,
    #[serde(default)]
    pub line2_out: Option<u32>,
    #[serde(default)]
    pub line3_in: Option<u32>,
    #[serde(default)]
    pub line3_out: Option<u32>,
    #[serde(default)]
    pub line4_in: Option<u32>,
    #[serde(default)]
    pub line4_out: Option<u32>,
    #[serde(default)]
    pub total_in: Option<u64>,
    #[serde(default)]
    pub total_out: Option<u64>,
    #[serde(default, rename = "created_at", skip_serializing_if = "Option::is_none")]
    pub inserted_at: Option<String>,
}

impl RecordRow {
    /// Convert to a stored record; line columns that are null or zero are
    /// treated as absent
    pub fn into_stored(self) -> Result<StoredRecord, RowError> {
        let timestamp = parse_backend_timestamp(&self.timestamp)?;
        let inserted_at = self.inserted_at.as_deref().map(parse_backend_timestamp).transpose()?;

        let mut record = CountRecord::new(self.sensor_id, self.store_id, self.org_id, timestamp);
        let columns = [
            (self.line1_in, self.line1_out),
            (self.line2_in, self.line2_out),
            (self.line3_in, self.line3_out),
            (self.line4_in, self.line4_out),
        ];
        for (line, (in_count, out_count)) in (1..=MAX_LINES).zip(columns) {
            let (in_count, out_count) = (in_count.unwrap_or(0), out_count.unwrap_or(0));
            if in_count > 0 || out_count > 0 {
                record.add_line(line, in_count, out_count)?;
            }
        }

        Ok(StoredRecord { id: self.id, record, inserted_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).single().unwrap()
    }

    fn record() -> CountRecord {
        CountRecord::new("pc-01".into(), "store-1".into(), "org-1".into(), ts(11))
    }

    #[test]
    fn test_totals_are_line_sums() {
        let r = record().with_line(1, 10, 7).unwrap().with_line(3, 5, 2).unwrap();
        assert_eq!(r.total_in(), 15);
        assert_eq!(r.total_out(), 9);

        let row = r.to_row();
        assert_eq!(row.total_in, Some(15));
        assert_eq!(row.total_out, Some(9));
        assert_eq!(row.line2_in, Some(0));
        assert_eq!(row.line3_out, Some(2));
    }

    #[test]
    fn test_add_line_accumulates_same_line() {
        let mut r = record();
        r.add_line(2, 3, 1).unwrap();
        r.add_line(2, 4, 2).unwrap();
        assert_eq!(r.lines().len(), 1);
        assert_eq!(r.line(2), Some(&LineCount { line: 2, in_count: 7, out_count: 3 }));
    }

    #[test]
    fn test_lines_sorted_and_bounded() {
        let mut r = record();
        r.add_line(4, 1, 1).unwrap();
        r.add_line(1, 1, 1).unwrap();
        assert_eq!(r.lines().iter().map(|l| l.line).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(r.add_line(0, 1, 1), Err(InvalidLine(0)));
        assert_eq!(r.add_line(5, 1, 1), Err(InvalidLine(5)));
    }

    #[test]
    fn test_retain_lines() {
        let mut r = record().with_line(1, 1, 1).unwrap().with_line(2, 2, 2).unwrap();
        r.retain_lines(&[2]);
        assert_eq!(r.total_in(), 2);
        assert!(r.line(1).is_none());
    }

    #[test]
    fn test_same_content_ignores_absent_vs_zero() {
        let a = record().with_line(1, 5, 5).unwrap();
        let b = record().with_line(1, 5, 5).unwrap().with_line(2, 0, 0).unwrap();
        assert!(a.same_content(&b));

        let c = record().with_line(1, 5, 6).unwrap();
        assert!(!a.same_content(&c));
    }

    #[test]
    fn test_row_json_shape() {
        let r = record().with_line(1, 10, 7).unwrap();
        let json = serde_json::to_value(r.to_row()).unwrap();
        assert_eq!(json["sensor_id"], "pc-01");
        assert_eq!(json["timestamp"], "2024-05-01T11:00:00Z");
        assert_eq!(json["line1_in"], 10);
        assert_eq!(json["total_out"], 7);
        assert!(json.get("id").is_none());
        assert!(json.get("created_at").is_none());
    }

    #[test]
    fn test_row_from_backend_json() {
        let json = r#"{
            "id": 42,
            "sensor_id": "pc-01",
            "store_id": "store-1",
            "org_id": "org-1",
            "timestamp": "2024-05-01T11:00:00+00:00",
            "line1_in": 10,
            "line1_out": 7,
            "line2_in": null,
            "total_in": 10,
            "total_out": 7,
            "created_at": "2024-05-01T12:03:11.52+00:00"
        }"#;
        let row: RecordRow = serde_json::from_str(json).unwrap();
        let stored = row.into_stored().unwrap();
        assert_eq!(stored.id, Some(42));
        assert_eq!(stored.record.timestamp, ts(11));
        assert_eq!(stored.record.total_in(), 10);
        assert_eq!(stored.record.lines().len(), 1);
        assert!(stored.inserted_at.is_some());
    }

    #[test]
    fn test_row_line_columns_and_bad_timestamp() {
        let mut row = record().to_row();
        row.line4_in = Some(3);
        row.line2_out = Some(1);
        let stored = row.clone().into_stored().unwrap();
        assert_eq!(stored.record.lines().iter().map(|l| l.line).collect::<Vec<_>>(), vec![2, 4]);

        row.timestamp = "yesterday".to_string();
        assert!(matches!(row.into_stored(), Err(RowError::Timestamp(_))));
    }

    #[test]
    fn test_granularity_period() {
        assert_eq!(Granularity::Hourly.period(), chrono::Duration::hours(1));
        assert_eq!(Granularity::Daily.as_str(), "daily");
    }
}
