//! counter-sync library
//!
//! People-counting ingestion: sensor polling, idempotent upsert into the
//! counts table, and operator diagnostics. Exposes modules for integration
//! testing and the two binaries.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
