//! Postgres-backed job store.
//!
//! One row per pipeline in `pipelines`, the full record kept as JSONB next to
//! the columns used for lookups. Compare-and-swap is a single conditional
//! `UPDATE ... WHERE revision = $expected`; zero affected rows means either
//! the row is missing or another writer won.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (create only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use docpipe_core::{DocumentId, IndexName, Pipeline};

use super::{JobStateStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipelines (
    index_name   TEXT        NOT NULL,
    document_id  TEXT        NOT NULL,
    revision     BIGINT      NOT NULL CHECK (revision > 0),
    status       TEXT        NOT NULL,
    record       JSONB       NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (index_name, document_id)
)
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect to `database_url` with a default pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `pipelines` table if it does not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

fn status_label(pipeline: &Pipeline) -> Result<String, StoreError> {
    match serde_json::to_value(pipeline.status)? {
        JsonValue::String(s) => Ok(s),
        other => Err(StoreError::Serialization(format!(
            "unexpected status encoding: {other}"
        ))),
    }
}

fn to_db_revision(revision: u64) -> Result<i64, StoreError> {
    i64::try_from(revision)
        .map_err(|_| StoreError::Storage(format!("revision {revision} out of range")))
}

#[async_trait]
impl JobStateStore for PostgresJobStore {
    #[instrument(skip(self, pipeline), fields(index = %pipeline.index, document_id = %pipeline.document_id), err)]
    async fn create(&self, pipeline: &Pipeline) -> Result<u64, StoreError> {
        let mut stored = pipeline.clone();
        stored.revision = 1;
        let record = serde_json::to_value(&stored)?;

        sqlx::query(
            r#"
            INSERT INTO pipelines
                (index_name, document_id, revision, status, record, created_at, updated_at)
            VALUES ($1, $2, 1, $3, $4, $5, $6)
            "#,
        )
        .bind(pipeline.index.as_str())
        .bind(pipeline.document_id.as_str())
        .bind(status_label(pipeline)?)
        .bind(record)
        .bind(pipeline.created_at)
        .bind(pipeline.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::already_exists(&pipeline.index, &pipeline.document_id)
            } else {
                map_sqlx_error("create", e)
            }
        })?;

        Ok(1)
    }

    #[instrument(skip(self), fields(index = %index, document_id = %document_id), err)]
    async fn load(
        &self,
        index: &IndexName,
        document_id: &DocumentId,
    ) -> Result<Pipeline, StoreError> {
        let row = sqlx::query(
            "SELECT revision, record FROM pipelines WHERE index_name = $1 AND document_id = $2",
        )
        .bind(index.as_str())
        .bind(document_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load", e))?
        .ok_or_else(|| StoreError::not_found(index, document_id))?;

        let revision: i64 = row
            .try_get("revision")
            .map_err(|e| map_sqlx_error("load", e))?;
        let record: JsonValue = row
            .try_get("record")
            .map_err(|e| map_sqlx_error("load", e))?;

        let mut pipeline: Pipeline = serde_json::from_value(record)?;
        pipeline.revision = revision as u64;
        Ok(pipeline)
    }

    #[instrument(skip(self, pipeline), fields(index = %pipeline.index, document_id = %pipeline.document_id), err(level = "debug"))]
    async fn compare_and_swap(
        &self,
        pipeline: &Pipeline,
        expected: u64,
    ) -> Result<u64, StoreError> {
        let next = expected + 1;
        let mut stored = pipeline.clone();
        stored.revision = next;
        let record = serde_json::to_value(&stored)?;
        let updated_at: DateTime<Utc> = pipeline.updated_at;

        let result = sqlx::query(
            r#"
            UPDATE pipelines
               SET revision = $1, status = $2, record = $3, updated_at = $4
             WHERE index_name = $5 AND document_id = $6 AND revision = $7
            "#,
        )
        .bind(to_db_revision(next)?)
        .bind(status_label(pipeline)?)
        .bind(record)
        .bind(updated_at)
        .bind(pipeline.index.as_str())
        .bind(pipeline.document_id.as_str())
        .bind(to_db_revision(expected)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        if result.rows_affected() == 1 {
            return Ok(next);
        }

        let actual: Option<i64> = sqlx::query_scalar(
            "SELECT revision FROM pipelines WHERE index_name = $1 AND document_id = $2",
        )
        .bind(pipeline.index.as_str())
        .bind(pipeline.document_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        match actual {
            Some(actual) => Err(StoreError::Conflict {
                expected,
                actual: actual as u64,
            }),
            None => Err(StoreError::not_found(
                &pipeline.index,
                &pipeline.document_id,
            )),
        }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
