//! Store interfaces: the columnar log store and its collaborators
//!
//! The pipeline talks to the outside world through three narrow traits. The
//! production implementation is Postgres with the Timescale extension
//! (`postgres.rs`); `memory.rs` backs the test suite.

pub mod memory;
pub mod postgres;

use crate::auth::context::ProjectRole;
use crate::record::LogRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use postgres::PostgresStore;

/// Store-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A project's ingest credential row.
#[derive(Debug, Clone)]
pub struct ProjectCredential {
    pub project_id: i32,
    pub owner_user_id: i32,
    /// Argon2 hash of the API secret; the plaintext secret is never stored.
    pub secret_hash: String,
}

/// A bounded search over one project's records.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub project_id: i32,
    /// Full-text query; `None` lists most-recent records.
    pub text: Option<String>,
    pub limit: i64,
    pub offset: i64,
    /// Lower timestamp bound derived from the project's retention window.
    pub since: DateTime<Utc>,
}

/// The columnar time-series store the workers load into.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Bulk-insert a macro-batch in column order
    /// `(timestamp, level, message, service, project_id, data)`.
    async fn bulk_load(&self, records: &[LogRecord]) -> Result<(), StoreError>;

    /// Global high-water mark: the newest record timestamp in the store.
    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Bounded search, newest first.
    async fn search(&self, request: &SearchRequest) -> Result<Vec<LogRecord>, StoreError>;
}

/// Credential lookup for the validation cache's miss path.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credential_by_key(
        &self,
        api_key: &str,
    ) -> Result<Option<ProjectCredential>, StoreError>;
}

/// The external projects collaborator, reduced to what the core needs:
/// membership roles and the plan-derived retention window.
#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    /// Role `user_id` holds on `project_id`; `None` means no access.
    async fn role(
        &self,
        project_id: i32,
        user_id: i32,
    ) -> Result<Option<ProjectRole>, StoreError>;

    /// Retention window for the project, in days.
    async fn retention_days(&self, project_id: i32) -> Result<i64, StoreError>;
}
