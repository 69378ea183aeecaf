//! IO modules - external system interfaces
//!
//! - `sensor` - HTTP client for the sensors' CGI report API
//! - `store` - REST table store client and in-memory store
//! - `health` - /health and Prometheus /metrics HTTP endpoint

pub mod health;
pub mod sensor;
pub mod store;

// Re-export commonly used types
pub use health::{start_health_server, HealthState};
pub use sensor::{SensorClient, SensorSource};
pub use store::{CountStore, MemoryStore, RecordFilter, RestStore};
