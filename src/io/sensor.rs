//! People-counting sensor client (CGI query API)
//!
//! Request:
//!   GET {base_url}{path}?report_type=0&statistics_type=hourly&linetype=all
//!       &start_time=2024-05-01 10:00:00&end_time=2024-05-01 13:59:59
//! Times are in the device's local clock. `report_type=0` is line counting;
//! regional counting is never requested.
//!
//! Response: `{"data": [row, ...]}` or a bare array of rows, each row
//! `{"time": "...", "line1_in": n, "line1_out": n, ... "line4_out": n}`.
//! Rows sharing a `time` are summed column by column.

use crate::domain::timestamp::{align, format_device_time, parse_device_time, TimeWindow};
use crate::domain::types::{CountRecord, Granularity};
use crate::infra::config::SensorConfig;
use crate::infra::error::{truncate_body, SensorError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Line-counting report
const REPORT_TYPE_LINES: &str = "0";

/// Source of counting reports, one sensor at a time
#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn fetch(
        &self,
        sensor: &SensorConfig,
        window: &TimeWindow,
        granularity: Granularity,
    ) -> Result<Vec<CountRecord>, SensorError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReportBody {
    Wrapped { data: Vec<ReportRow> },
    Rows(Vec<ReportRow>),
}

#[derive(Debug, Deserialize)]
struct ReportRow {
    time: String,
    #[serde(default)]
    line1_in: u32,
    #[serde(default)]
    line1_out: u32,
    #[serde(default)]
    line2_in: u32,
    #[serde(default)]
    line2_out: u32,
    #[serde(default)]
    line3_in: u32,
    #[serde(default)]
    line3_out: u32,
    #[serde(default)]
    line4_in: u32,
    #[serde(default)]
    line4_out: u32,
}

impl ReportRow {
    fn columns(&self) -> [(u8, u32, u32); 4] {
        [
            (1, self.line1_in, self.line1_out),
            (2, self.line2_in, self.line2_out),
            (3, self.line3_in, self.line3_out),
            (4, self.line4_in, self.line4_out),
        ]
    }
}

/// Build the query string parameters for a report request
pub fn build_query(
    sensor: &SensorConfig,
    window: &TimeWindow,
    granularity: Granularity,
) -> Vec<(&'static str, String)> {
    let linetype = match sensor.lines.as_slice() {
        [single] => single.to_string(),
        _ => "all".to_string(),
    };
    // end_time is inclusive on the device
    let end = window.end - chrono::Duration::seconds(1);

    vec![
        ("report_type", REPORT_TYPE_LINES.to_string()),
        ("statistics_type", granularity.as_str().to_string()),
        ("linetype", linetype),
        ("start_time", format_device_time(window.start, sensor.utc_offset)),
        ("end_time", format_device_time(end, sensor.utc_offset)),
    ]
}

/// Decode a report body into one record per period
///
/// Timestamps are converted from device time to UTC and aligned to the
/// period start; lines outside the sensor's filter are dropped.
pub fn parse_report(
    body: &str,
    sensor: &SensorConfig,
    granularity: Granularity,
) -> Result<Vec<CountRecord>, SensorError> {
    let rows = match serde_json::from_str::<ReportBody>(body) {
        Ok(ReportBody::Wrapped { data }) => data,
        Ok(ReportBody::Rows(rows)) => rows,
        Err(e) => return Err(SensorError::Decode(e.to_string())),
    };

    let mut by_period: BTreeMap<DateTime<Utc>, CountRecord> = BTreeMap::new();
    for row in rows {
        let parsed = parse_device_time(&row.time, sensor.utc_offset)?;
        let timestamp = align(parsed, granularity, sensor.utc_offset);
        let record = by_period.entry(timestamp).or_insert_with(|| {
            CountRecord::new(
                sensor.id.clone(),
                sensor.store_id.clone(),
                sensor.org_id.clone(),
                timestamp,
            )
        });
        for (line, in_count, out_count) in row.columns() {
            if sensor.lines.contains(&line) {
                record
                    .add_line(line, in_count, out_count)
                    .map_err(|e| SensorError::Decode(e.to_string()))?;
            }
        }
    }

    Ok(by_period.into_values().collect())
}

/// HTTP client for sensor report endpoints
pub struct SensorClient {
    http: reqwest::Client,
}

impl SensorClient {
    /// Create the client once for reuse (connection pooling)
    pub fn new(timeout: Duration) -> Result<Self, SensorError> {
        let http = reqwest::Client::builder().timeout(timeout).http1_only().build()?;
        Ok(Self { http })
    }

    fn basic_auth_header(username: &str, password: &str) -> String {
        let credentials = format!("{}:{}", username, password);
        format!("Basic {}", STANDARD.encode(credentials.as_bytes()))
    }
}

#[async_trait]
impl SensorSource for SensorClient {
    async fn fetch(
        &self,
        sensor: &SensorConfig,
        window: &TimeWindow,
        granularity: Granularity,
    ) -> Result<Vec<CountRecord>, SensorError> {
        let url = sensor.report_url();
        let query = build_query(sensor, window, granularity);

        let mut request = self.http.get(&url).query(&query).header("Accept", "application/json");
        if let Some(username) = &sensor.username {
            let password = sensor.password.as_deref().unwrap_or("");
            request = request.header("Authorization", Self::basic_auth_header(username, password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(SensorError::HttpStatus {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        debug!(sensor_id = %sensor.id, bytes = %body.len(), "sensor_report_received");
        parse_report(&body, sensor, granularity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::timestamp::parse_utc_offset;
    use chrono::TimeZone;

    fn sensor(lines: Vec<u8>, offset: &str) -> SensorConfig {
        SensorConfig {
            id: "pc-01".into(),
            store_id: "store-1".into(),
            org_id: "org-1".into(),
            base_url: "http://10.0.0.5".to_string(),
            path: "/cgi-bin/report.cgi".to_string(),
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            utc_offset: parse_utc_offset(offset).unwrap(),
            lines,
            enabled: true,
        }
    }

    fn utc(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).single().unwrap()
    }

    #[test]
    fn test_build_query_all_lines() {
        let s = sensor(vec![1, 2, 3, 4], "+02:00");
        let window = TimeWindow::new(utc(8), utc(12));
        let query = build_query(&s, &window, Granularity::Hourly);

        assert!(query.contains(&("report_type", "0".to_string())));
        assert!(query.contains(&("statistics_type", "hourly".to_string())));
        assert!(query.contains(&("linetype", "all".to_string())));
        assert!(query.contains(&("start_time", "2024-05-01 10:00:00".to_string())));
        assert!(query.contains(&("end_time", "2024-05-01 13:59:59".to_string())));
    }

    #[test]
    fn test_build_query_single_line_filter() {
        let s = sensor(vec![2], "Z");
        let window = TimeWindow::new(utc(8), utc(12));
        let query = build_query(&s, &window, Granularity::Daily);
        assert!(query.contains(&("linetype", "2".to_string())));
        assert!(query.contains(&("statistics_type", "daily".to_string())));
    }

    #[test]
    fn test_parse_wrapped_report_converts_to_utc() {
        let s = sensor(vec![1, 2, 3, 4], "+02:00");
        let body = r#"{"data": [
            {"time": "2024-05-01 13:00:00", "line1_in": 10, "line1_out": 7, "line2_in": 3},
            {"time": "2024-05-01 12:00:00", "line1_in": 4, "line1_out": 4}
        ]}"#;
        let records = parse_report(body, &s, Granularity::Hourly).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, utc(10));
        assert_eq!(records[1].timestamp, utc(11));
        assert_eq!(records[1].total_in(), 13);
        assert_eq!(records[1].total_out(), 7);
        assert_eq!(records[1].sensor_id.as_str(), "pc-01");
    }

    #[test]
    fn test_parse_sums_rows_with_same_time() {
        let s = sensor(vec![1, 2, 3, 4], "Z");
        let body = r#"[
            {"time": "2024-05-01 11:00:00", "line1_in": 2, "line1_out": 1},
            {"time": "2024-05-01 11:00:00", "line1_in": 3, "line2_out": 5},
            {"time": "2024-05-01 11:15:00", "line4_in": 1}
        ]"#;
        let records = parse_report(body, &s, Granularity::Hourly).unwrap();

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.line(1).map(|l| (l.in_count, l.out_count)), Some((5, 1)));
        assert_eq!(r.line(2).map(|l| l.out_count), Some(5));
        assert_eq!(r.line(4).map(|l| l.in_count), Some(1));
        assert_eq!(r.total_in(), 6);
        assert_eq!(r.total_out(), 6);
    }

    #[test]
    fn test_parse_applies_line_filter() {
        let s = sensor(vec![1], "Z");
        let body = r#"[{"time": "2024-05-01 11:00:00", "line1_in": 2, "line3_in": 40}]"#;
        let records = parse_report(body, &s, Granularity::Hourly).unwrap();
        assert_eq!(records[0].total_in(), 2);
        assert!(records[0].line(3).is_none());
    }

    #[test]
    fn test_parse_empty_report() {
        let s = sensor(vec![1, 2, 3, 4], "Z");
        assert!(parse_report(r#"{"data": []}"#, &s, Granularity::Hourly).unwrap().is_empty());
        assert!(parse_report("[]", &s, Granularity::Hourly).unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let s = sensor(vec![1, 2, 3, 4], "Z");
        assert!(matches!(
            parse_report("<html>login</html>", &s, Granularity::Hourly),
            Err(SensorError::Decode(_))
        ));
        assert!(matches!(
            parse_report(r#"[{"time": "soon"}]"#, &s, Granularity::Hourly),
            Err(SensorError::Timestamp(_))
        ));
    }

    #[test]
    fn test_basic_auth_header() {
        assert_eq!(SensorClient::basic_auth_header("admin", "secret"), "Basic YWRtaW46c2VjcmV0");
    }
}
