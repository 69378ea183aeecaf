//! Error taxonomy for the sensor and store clients
//!
//! Library code returns these typed errors; binaries wrap them in `anyhow`.
//! `Retryable` decides which failures the retry driver may try again.

use crate::domain::timestamp::TimestampError;
use crate::domain::types::RowError;

/// Maximum response body kept in an error message
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("sensor request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("sensor returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("sensor report could not be decoded: {0}")]
    Decode(String),

    #[error(transparent)]
    Timestamp(#[from] TimestampError),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("store returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Unique constraint on (sensor_id, timestamp) rejected a plain insert
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("store response could not be decoded: {0}")]
    Decode(String),

    #[error("invalid stored row: {0}")]
    InvalidRow(#[from] RowError),

    #[error("refusing to delete without a filter")]
    UnfilteredDelete,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate sensor id {0:?}")]
    DuplicateSensor(String),

    #[error("sensor {sensor:?}: line {line} is outside 1..=4")]
    InvalidLine { sensor: String, line: u8 },

    #[error("sensor {sensor:?}: {source}")]
    InvalidOffset { sensor: String, source: TimestampError },

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("{field} = {value} exceeds maximum {max}")]
    OutOfRange { field: &'static str, value: u64, max: u64 },
}

/// Whether an operation failing with this error may succeed on a later try
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// 5xx and 429 are transient, other statuses are not
#[inline]
pub fn status_is_retryable(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn request_is_retryable(e: &reqwest::Error) -> bool {
    if e.is_timeout() || e.is_connect() {
        return true;
    }
    e.status().map(|s| status_is_retryable(s.as_u16())).unwrap_or(false)
}

impl Retryable for SensorError {
    fn is_retryable(&self) -> bool {
        match self {
            SensorError::Request(e) => request_is_retryable(e),
            SensorError::HttpStatus { status, .. } => status_is_retryable(*status),
            SensorError::Decode(_) | SensorError::Timestamp(_) => false,
        }
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Request(e) => request_is_retryable(e),
            StoreError::HttpStatus { status, .. } => status_is_retryable(*status),
            StoreError::DuplicateKey(_)
            | StoreError::Decode(_)
            | StoreError::InvalidRow(_)
            | StoreError::UnfilteredDelete => false,
        }
    }
}

/// Cut a response body down for logging and error messages
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.trim().to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", body[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_retryability() {
        assert!(status_is_retryable(500));
        assert!(status_is_retryable(503));
        assert!(status_is_retryable(429));
        assert!(!status_is_retryable(400));
        assert!(!status_is_retryable(401));
        assert!(!status_is_retryable(404));
        assert!(!status_is_retryable(409));
    }

    #[test]
    fn test_store_error_retryability() {
        assert!(StoreError::HttpStatus { status: 502, body: String::new() }.is_retryable());
        assert!(!StoreError::DuplicateKey("23505".into()).is_retryable());
        assert!(!StoreError::UnfilteredDelete.is_retryable());
    }

    #[test]
    fn test_sensor_error_retryability() {
        assert!(SensorError::HttpStatus { status: 500, body: String::new() }.is_retryable());
        assert!(!SensorError::HttpStatus { status: 401, body: String::new() }.is_retryable());
        assert!(!SensorError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("  short  "), "short");
        let long = "é".repeat(400);
        let cut = truncate_body(&long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= MAX_ERROR_BODY + 3);
    }
}
