//! Domain models - people-counting records and the timestamp model
//!
//! This module contains the canonical data types used throughout the system:
//! - `CountRecord` - one period of line counters for one sensor
//! - `StoredRecord` - a record as read back from the table store
//! - `RecordRow` - flat wire shape of the counts table
//! - `timestamp` - device-local and backend time parsing, period alignment

pub mod timestamp;
pub mod types;

// Re-export commonly used types at module level
pub use timestamp::{TimeWindow, TimestampError};
pub use types::{CountRecord, Granularity, OrgId, RecordKey, SensorId, StoreId, StoredRecord};
