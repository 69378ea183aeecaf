//! Timestamp model
//!
//! Sensors report wall-clock time in their own configured offset
//! (`2024-05-01 13:00:00`), the table store hands back RFC 3339-ish strings
//! in several shapes. Everything inside the crate is `DateTime<Utc>`.

use crate::domain::types::Granularity;
use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};

/// Device-local formats accepted from sensor reports, most common first
const DEVICE_FORMATS: [&str; 4] =
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"];

/// Format used when sending start/end times to a sensor
const DEVICE_QUERY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    #[error("invalid timestamp: {0:?}")]
    Invalid(String),
    #[error("utc offset out of range: {0:?}")]
    OffsetOutOfRange(String),
    #[error("lookback of {0} periods is out of range")]
    LookbackOutOfRange(u32),
}

/// Half-open time range `[start, end)` in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of the last `hours` hours ending at `now` (not aligned)
    pub fn trailing_hours(now: DateTime<Utc>, hours: i64) -> Self {
        Self { start: now - chrono::Duration::hours(hours), end: now }
    }

    #[inline]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Period starts covered by the window, stepping by the granularity
    pub fn period_starts(&self, granularity: Granularity) -> impl Iterator<Item = DateTime<Utc>> {
        let step = granularity.period();
        let end = self.end;
        std::iter::successors(Some(self.start), move |prev| Some(*prev + step))
            .take_while(move |ts| *ts < end)
    }
}

/// Parse a UTC offset as configured on a sensor
///
/// Accepts `Z`, `UTC`, `+02:00`, `-0530`, `+2`, `+02`.
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset, TimestampError> {
    let trimmed = s.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| TimestampError::OffsetOutOfRange(s.into()));
    }

    let (sign, rest) = match trimmed.as_bytes().first() {
        Some(b'+') => (1, &trimmed[1..]),
        Some(b'-') => (-1, &trimmed[1..]),
        _ => return Err(TimestampError::Invalid(s.to_string())),
    };

    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(TimestampError::Invalid(s.to_string()));
    }

    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>(), Ok(0)),
        4 => (digits[..2].parse::<i32>(), digits[2..].parse::<i32>()),
        _ => return Err(TimestampError::Invalid(s.to_string())),
    };
    let (hours, minutes) = match (hours, minutes) {
        (Ok(h), Ok(m)) => (h, m),
        _ => return Err(TimestampError::Invalid(s.to_string())),
    };

    if hours > 14 || minutes > 59 {
        return Err(TimestampError::OffsetOutOfRange(s.to_string()));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| TimestampError::OffsetOutOfRange(s.to_string()))
}

/// Parse a sensor's local wall-clock string into UTC
pub fn parse_device_time(s: &str, offset: FixedOffset) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = s.trim();
    let naive = DEVICE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| TimestampError::Invalid(s.to_string()))?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| TimestampError::Invalid(s.to_string()))
}

/// Render a UTC instant as the sensor's local wall-clock string
pub fn format_device_time(dt: DateTime<Utc>, offset: FixedOffset) -> String {
    dt.with_timezone(&offset).format(DEVICE_QUERY_FORMAT).to_string()
}

/// Parse a timestamp as returned by the table store
///
/// Handles `Z` and numeric offsets, fractional seconds, a space instead of
/// `T`, Postgres short offsets (`+00`) and naive values (taken as UTC).
pub fn parse_backend_timestamp(s: &str) -> Result<DateTime<Utc>, TimestampError> {
    let normalized = s.trim().replacen(' ', "T", 1);

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(expanded) = expand_short_offset(&normalized) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&expanded) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| TimestampError::Invalid(s.to_string()))
}

/// `...+02` -> `...+02:00`
fn expand_short_offset(s: &str) -> Option<String> {
    let tail = s.get(s.len().checked_sub(3)?..)?;
    let mut chars = tail.chars();
    let sign = chars.next()?;
    if (sign == '+' || sign == '-') && chars.all(|c| c.is_ascii_digit()) && s.contains('T') {
        Some(format!("{s}:00"))
    } else {
        None
    }
}

/// Canonical wire form for the table store (`2024-05-01T11:00:00Z`)
pub fn to_backend_string(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Align an instant to the start of its period in the device's local time
///
/// Hour boundaries follow the device clock, so a `+05:30` sensor's hours
/// start at :30 UTC.
pub fn align(dt: DateTime<Utc>, granularity: Granularity, offset: FixedOffset) -> DateTime<Utc> {
    let local = dt.with_timezone(&offset).naive_local();
    let truncated = match granularity {
        Granularity::Hourly => local.with_minute(0).and_then(|t| t.with_second(0)),
        Granularity::Daily => local.date().and_hms_opt(0, 0, 0),
    }
    .and_then(|t| t.with_nanosecond(0));

    truncated
        .and_then(|naive| offset.from_local_datetime(&naive).single())
        .map(|aligned| aligned.with_timezone(&Utc))
        .unwrap_or(dt)
}

/// Polling window: the current (partial) period plus `lookback` full ones
pub fn poll_window(
    now: DateTime<Utc>,
    granularity: Granularity,
    lookback: u32,
    offset: FixedOffset,
) -> Result<TimeWindow, TimestampError> {
    let out_of_range = || TimestampError::LookbackOutOfRange(lookback);
    let period = granularity.period();
    let end = align(now, granularity, offset)
        .checked_add_signed(period)
        .ok_or_else(out_of_range)?;
    let periods = i32::try_from(lookback)
        .ok()
        .and_then(|n| n.checked_add(1))
        .ok_or_else(out_of_range)?;
    let start = period
        .checked_mul(periods)
        .and_then(|span| end.checked_sub_signed(span))
        .ok_or_else(out_of_range)?;
    Ok(TimeWindow { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().unwrap()
    }

    #[test]
    fn test_parse_utc_offset_variants() {
        assert_eq!(parse_utc_offset("+02:00").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_utc_offset("-0530").unwrap().local_minus_utc(), -19800);
        assert_eq!(parse_utc_offset("+2").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_utc_offset("+02").unwrap().local_minus_utc(), 7200);
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
    }

    #[test]
    fn test_parse_utc_offset_rejects_garbage() {
        assert!(matches!(parse_utc_offset("02:00"), Err(TimestampError::Invalid(_))));
        assert!(matches!(parse_utc_offset("+ab"), Err(TimestampError::Invalid(_))));
        assert!(matches!(parse_utc_offset("+15:00"), Err(TimestampError::OffsetOutOfRange(_))));
    }

    #[test]
    fn test_parse_device_time_applies_offset() {
        let offset = parse_utc_offset("+02:00").unwrap();
        let ts = parse_device_time("2024-05-01 13:00:00", offset).unwrap();
        assert_eq!(ts, utc(2024, 5, 1, 11, 0, 0));

        let ts = parse_device_time("2024-05-01T13:00", offset).unwrap();
        assert_eq!(ts, utc(2024, 5, 1, 11, 0, 0));
    }

    #[test]
    fn test_parse_device_time_crosses_midnight() {
        let offset = parse_utc_offset("-05:00").unwrap();
        let ts = parse_device_time("2024-05-01 22:00:00", offset).unwrap();
        assert_eq!(ts, utc(2024, 5, 2, 3, 0, 0));
    }

    #[test]
    fn test_parse_device_time_invalid() {
        let offset = parse_utc_offset("Z").unwrap();
        assert!(parse_device_time("yesterday", offset).is_err());
        assert!(parse_device_time("2024-13-01 00:00:00", offset).is_err());
    }

    #[test]
    fn test_format_device_time_inverse() {
        let offset = parse_utc_offset("+02:00").unwrap();
        let ts = utc(2024, 5, 1, 11, 0, 0);
        let s = format_device_time(ts, offset);
        assert_eq!(s, "2024-05-01 13:00:00");
        assert_eq!(parse_device_time(&s, offset).unwrap(), ts);
    }

    #[test]
    fn test_backend_timestamp_variants_agree() {
        let expected = utc(2024, 5, 1, 11, 0, 0);
        for s in [
            "2024-05-01T11:00:00Z",
            "2024-05-01T11:00:00+00:00",
            "2024-05-01T13:00:00+02:00",
            "2024-05-01 11:00:00+00",
            "2024-05-01T11:00:00.000000+00:00",
            "2024-05-01T11:00:00",
            "2024-05-01 11:00:00",
        ] {
            assert_eq!(parse_backend_timestamp(s).unwrap(), expected, "input {s}");
        }
    }

    #[test]
    fn test_backend_timestamp_invalid() {
        assert!(parse_backend_timestamp("").is_err());
        assert!(parse_backend_timestamp("2024-05-01").is_err());
        assert!(parse_backend_timestamp("not a time").is_err());
    }

    #[test]
    fn test_to_backend_string() {
        assert_eq!(to_backend_string(utc(2024, 5, 1, 11, 0, 0)), "2024-05-01T11:00:00Z");
    }

    #[test]
    fn test_align_hourly_and_daily() {
        let utc0 = parse_utc_offset("Z").unwrap();
        let ts = utc(2024, 5, 1, 11, 42, 17);
        assert_eq!(align(ts, Granularity::Hourly, utc0), utc(2024, 5, 1, 11, 0, 0));
        assert_eq!(align(ts, Granularity::Daily, utc0), utc(2024, 5, 1, 0, 0, 0));

        // Device midnight at +02:00 is 22:00 UTC the day before
        let plus2 = parse_utc_offset("+02:00").unwrap();
        assert_eq!(align(ts, Granularity::Daily, plus2), utc(2024, 4, 30, 22, 0, 0));
    }

    #[test]
    fn test_align_half_hour_offset() {
        let offset = parse_utc_offset("+05:30").unwrap();
        let ts = utc(2024, 5, 1, 11, 10, 0);
        assert_eq!(align(ts, Granularity::Hourly, offset), utc(2024, 5, 1, 10, 30, 0));
    }

    #[test]
    fn test_poll_window_includes_current_hour() {
        let offset = parse_utc_offset("Z").unwrap();
        let now = utc(2024, 5, 1, 11, 20, 0);
        let window = poll_window(now, Granularity::Hourly, 3, offset).unwrap();
        assert_eq!(window.start, utc(2024, 5, 1, 8, 0, 0));
        assert_eq!(window.end, utc(2024, 5, 1, 12, 0, 0));
        assert!(window.contains(utc(2024, 5, 1, 11, 0, 0)));
        assert!(!window.contains(window.end));
        assert_eq!(window.period_starts(Granularity::Hourly).count(), 4);
    }

    #[test]
    fn test_poll_window_rejects_huge_lookback() {
        let offset = parse_utc_offset("Z").unwrap();
        let now = utc(2024, 5, 1, 9, 20, 0);
        assert_eq!(
            poll_window(now, Granularity::Hourly, u32::MAX, offset),
            Err(TimestampError::LookbackOutOfRange(u32::MAX))
        );
        assert_eq!(
            poll_window(now, Granularity::Daily, 100_000_000, offset),
            Err(TimestampError::LookbackOutOfRange(100_000_000))
        );
    }
}
