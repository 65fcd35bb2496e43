//! LogFlume - Multi-Tenant Log Ingestion Engine
//!
//! Accepts structured log records over HTTP, makes them durable in a
//! segmented write-ahead log before acknowledging, bulk-loads them into a
//! time-series store through a worker pool, and fans committed records out
//! to live websocket subscribers. Tenants are isolated by per-project API
//! credentials.

pub mod auth;
pub mod config;
pub mod hub;
pub mod ingest;
pub mod metrics;
pub mod record;
pub mod server;
pub mod store;
pub mod wal;

pub use config::Config;

/// LogFlume version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for LogFlume setup paths
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
