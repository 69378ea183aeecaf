//! Services - ingestion and diagnostics logic
//!
//! - `poller` - Polling scheduler (fetch, reconcile, upsert per cycle)
//! - `reconcile` - Dedup and upsert planning against stored rows
//! - `retry` - Exponential backoff for transient failures
//! - `diagnostics` - Future-dated rows, insert origin, gaps, freshness
//! - `monitor` - Row count watcher

pub mod diagnostics;
pub mod monitor;
pub mod poller;
pub mod reconcile;
pub mod retry;

// Re-export commonly used types
pub use poller::{CycleReport, PollSettings, Poller, SensorOutcome};
pub use reconcile::{plan_upsert, UpsertPlan};
pub use retry::{retry, RetryPolicy};
