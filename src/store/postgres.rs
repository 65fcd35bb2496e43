//! Postgres/Timescale-backed store
//!
//! Owns the schema for the `logs` hypertable (partitioned on timestamp and
//! project) plus the `projects`/`project_members` tables the credential and
//! role lookups read. Row contents for those tables are managed by the
//! external account and billing services; this process only reads them.

use crate::auth::context::ProjectRole;
use crate::record::LogRecord;
use crate::store::{
    CredentialStore, LogStore, ProjectCredential, ProjectDirectory, SearchRequest, StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Rows per INSERT statement; 6 binds per row keeps each statement well
/// under the Postgres bind-parameter limit.
const INSERT_CHUNK: usize = 1_000;

/// How often the retention sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with the pool shape the write path needs: enough connections
    /// for parallel workers plus request handlers.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(100)
            .min_connections(10)
            .idle_timeout(Duration::from_secs(15 * 60))
            .connect(url)
            .await?;
        info!("connected to postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the logs hypertable, the full-text trigger, and the project
    /// tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb;")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id SERIAL PRIMARY KEY,
                owner_user_id INTEGER NOT NULL,
                name VARCHAR(255) UNIQUE NOT NULL,
                api_key VARCHAR(255) UNIQUE NOT NULL,
                api_secret_hash VARCHAR(255) NOT NULL,
                retention_days INTEGER NOT NULL DEFAULT 30,
                created_at TIMESTAMPTZ DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_projects_api_key ON projects(api_key);")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_members (
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL,
                role VARCHAR(50) NOT NULL DEFAULT 'viewer',
                joined_at TIMESTAMPTZ DEFAULT NOW(),
                PRIMARY KEY (project_id, user_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
                timestamp TIMESTAMPTZ NOT NULL,
                project_id INTEGER NOT NULL,
                level VARCHAR(50) NOT NULL,
                message TEXT,
                service VARCHAR(100),
                data JSONB DEFAULT '{}'::jsonb,
                search_vector TSVECTOR
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            SELECT create_hypertable('logs', 'timestamp',
                partitioning_column => 'project_id',
                number_partitions => 10,
                chunk_time_interval => INTERVAL '1 day',
                if_not_exists => TRUE);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE OR REPLACE FUNCTION update_log_search_vector()
            RETURNS TRIGGER AS $$
            BEGIN
                NEW.search_vector = to_tsvector('simple',
                    COALESCE(NEW.level, '') || ' ' ||
                    COALESCE(NEW.service, '') || ' ' ||
                    COALESCE(NEW.message, ''));
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("DROP TRIGGER IF EXISTS ts_vector_update ON logs;")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"
            CREATE TRIGGER ts_vector_update
            BEFORE INSERT ON logs
            FOR EACH ROW
            EXECUTE FUNCTION update_log_search_vector();
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_data ON logs USING GIN (data);")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_logs_search ON logs USING GIN (search_vector);",
        )
        .execute(&self.pool)
        .await?;

        info!("store schema ready");
        Ok(())
    }

    /// Spawn the periodic retention sweep: delete rows older than each
    /// project's retention window, with a coarse safety net for chunks no
    /// window covers anymore.
    pub fn spawn_retention_sweeper(
        &self,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!("retention sweep started");
                        let swept = sqlx::query(
                            r#"
                            DELETE FROM logs l
                            USING projects p
                            WHERE l.project_id = p.id
                              AND l.timestamp < NOW() - (p.retention_days * INTERVAL '1 day');
                            "#,
                        )
                        .execute(&pool)
                        .await;
                        match swept {
                            Ok(result) => {
                                info!(rows = result.rows_affected(), "retention sweep complete")
                            }
                            Err(e) => error!(error = %e, "retention sweep failed"),
                        }

                        if let Err(e) =
                            sqlx::query("SELECT drop_chunks('logs', INTERVAL '60 days');")
                                .execute(&pool)
                                .await
                        {
                            warn!(error = %e, "retention safety net failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[async_trait]
impl LogStore for PostgresStore {
    async fn bulk_load(&self, records: &[LogRecord]) -> Result<(), StoreError> {
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO logs (timestamp, level, message, service, project_id, data) ",
            );
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.timestamp)
                    .push_bind(&record.level)
                    .push_bind(&record.message)
                    .push_bind(&record.service)
                    .push_bind(record.project_id)
                    .push_bind(record.data.as_ref().map(Json));
            });
            builder.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let latest: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT MAX(timestamp) FROM logs")
                .fetch_one(&self.pool)
                .await?;
        Ok(latest)
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<LogRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, level, message, service, project_id, data
            FROM logs
            WHERE project_id = $1
              AND timestamp >= $2
              AND ($3::text IS NULL OR search_vector @@ plainto_tsquery('simple', $3))
            ORDER BY timestamp DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(request.project_id)
        .bind(request.since)
        .bind(request.text.as_deref())
        .bind(request.limit)
        .bind(request.offset)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let data: Option<Json<Map<String, Value>>> = row.try_get("data")?;
            records.push(LogRecord {
                timestamp: row.try_get("timestamp")?,
                level: row.try_get::<Option<String>, _>("level")?.unwrap_or_default(),
                message: row
                    .try_get::<Option<String>, _>("message")?
                    .unwrap_or_default(),
                service: row
                    .try_get::<Option<String>, _>("service")?
                    .unwrap_or_default(),
                project_id: row.try_get("project_id")?,
                data: data.map(|json| json.0),
                segment_id: 0,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl CredentialStore for PostgresStore {
    async fn credential_by_key(
        &self,
        api_key: &str,
    ) -> Result<Option<ProjectCredential>, StoreError> {
        let row = sqlx::query(
            "SELECT id, owner_user_id, api_secret_hash FROM projects WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(ProjectCredential {
                project_id: row.try_get("id")?,
                owner_user_id: row.try_get("owner_user_id")?,
                secret_hash: row.try_get("api_secret_hash")?,
            }),
            None => None,
        })
    }
}

#[async_trait]
impl ProjectDirectory for PostgresStore {
    async fn role(
        &self,
        project_id: i32,
        user_id: i32,
    ) -> Result<Option<ProjectRole>, StoreError> {
        let is_owner: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM projects WHERE id = $1 AND owner_user_id = $2)",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        if is_owner {
            return Ok(Some(ProjectRole::Owner));
        }

        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM project_members WHERE project_id = $1 AND user_id = $2",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(role.as_deref().and_then(ProjectRole::parse))
    }

    async fn retention_days(&self, project_id: i32) -> Result<i64, StoreError> {
        let days: Option<i32> =
            sqlx::query_scalar("SELECT retention_days FROM projects WHERE id = $1")
                .bind(project_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(days.unwrap_or(30) as i64)
    }
}
