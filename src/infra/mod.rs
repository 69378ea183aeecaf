//! Infrastructure - configuration, errors, and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults, env secrets)
//! - `error` - Typed errors for the sensor and store clients
//! - `metrics` - Lock-free metrics collection

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{Config, SensorConfig};
pub use error::{Retryable, SensorError, StoreError};
pub use metrics::Metrics;
