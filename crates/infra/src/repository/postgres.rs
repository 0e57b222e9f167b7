//! Postgres-backed job repository.
//!
//! ## Tables
//!
//! - `jobs`: one row per campaign, joined with `apps` for the app name
//! - `templates`: `(app_id, name, locale)` with `defaults`/`body` as JSONB
//! - `job_events`: append-only stage tags
//!
//! Every counter update is a single `UPDATE ... SET x = x + $n` statement.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use herald_core::{AppId, Job, JobId, JobStatus, PastTimeStrategy, Service, Template};

use super::{JobRepository, StoreError, TagState, TotalsDelta};

#[derive(Debug, Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn execute(&self, operation: &str, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>) -> Result<u64, StoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected())
    }

    async fn execute_on_job(
        &self,
        operation: &str,
        id: JobId,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), StoreError> {
        match self.execute(operation, query).await? {
            0 => Err(StoreError::NotFound(format!("job {id}"))),
            _ => Ok(()),
        }
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Database(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        sqlx::Error::PoolClosed => StoreError::Database(format!("connection pool closed in {operation}")),
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

const JOB_COLUMNS: &str = r#"
    j.id, j.app_id, a.name AS app_name, j.service, j.template_name, j.filters,
    j.csv_path, j.context, j.metadata, j.expires_at, j.starts_at, j.localized,
    j.past_time_strategy, j.control_group, j.db_page_size, j.total_batches,
    j.completed_batches, j.total_tokens, j.total_users, j.completed_tokens,
    j.completed_at, j.control_group_csv_path, j.batches_ready, j.status,
    j.created_by, j.created_at, j.updated_at
"#;

fn json_object(value: Option<Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());
    let domain = |e: herald_core::DomainError| StoreError::Decode(e.to_string());

    let filters: Option<Value> = row.try_get("filters").map_err(decode)?;
    let filters: BTreeMap<String, String> = match filters {
        Some(v @ Value::Object(_)) => serde_json::from_value(v).map_err(|e| StoreError::Decode(e.to_string()))?,
        _ => BTreeMap::new(),
    };
    let service: String = row.try_get("service").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;
    let strategy: String = row.try_get("past_time_strategy").map_err(decode)?;
    let db_page_size: i32 = row.try_get("db_page_size").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
        app_id: AppId::from_uuid(row.try_get::<Uuid, _>("app_id").map_err(decode)?),
        app_name: row.try_get("app_name").map_err(decode)?,
        service: service.parse::<Service>().map_err(domain)?,
        template_name: row.try_get("template_name").map_err(decode)?,
        filters,
        csv_path: row.try_get::<Option<String>, _>("csv_path").map_err(decode)?.unwrap_or_default(),
        context: json_object(row.try_get("context").map_err(decode)?),
        metadata: json_object(row.try_get("metadata").map_err(decode)?),
        expires_at: row.try_get("expires_at").map_err(decode)?,
        starts_at: row.try_get("starts_at").map_err(decode)?,
        localized: row.try_get("localized").map_err(decode)?,
        past_time_strategy: PastTimeStrategy::parse(&strategy),
        control_group: row.try_get("control_group").map_err(decode)?,
        db_page_size: u32::try_from(db_page_size).unwrap_or(0),
        total_batches: row.try_get("total_batches").map_err(decode)?,
        completed_batches: row.try_get("completed_batches").map_err(decode)?,
        total_tokens: row.try_get("total_tokens").map_err(decode)?,
        total_users: row.try_get("total_users").map_err(decode)?,
        completed_tokens: row.try_get("completed_tokens").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        control_group_csv_path: row
            .try_get::<Option<String>, _>("control_group_csv_path")
            .map_err(decode)?
            .unwrap_or_default(),
        batches_ready: row.try_get("batches_ready").map_err(decode)?,
        status: status.parse::<JobStatus>().map_err(domain)?,
        created_by: row.try_get::<Option<String>, _>("created_by").map_err(decode)?.unwrap_or_default(),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let filters = serde_json::to_value(&job.filters).map_err(|e| StoreError::Decode(e.to_string()))?;
        self.execute(
            "insert_job",
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, app_id, service, template_name, filters, csv_path, context,
                    metadata, expires_at, starts_at, localized, past_time_strategy,
                    control_group, db_page_size, total_batches, completed_batches,
                    total_tokens, total_users, completed_tokens, completed_at,
                    control_group_csv_path, batches_ready, status, created_by,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                        $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.app_id.as_uuid())
            .bind(job.service.as_str())
            .bind(&job.template_name)
            .bind(filters)
            .bind(&job.csv_path)
            .bind(Value::Object(job.context.clone()))
            .bind(Value::Object(job.metadata.clone()))
            .bind(job.expires_at)
            .bind(job.starts_at)
            .bind(job.localized)
            .bind(job.past_time_strategy.as_str())
            .bind(job.control_group)
            .bind(i32::try_from(job.db_page_size).unwrap_or(i32::MAX))
            .bind(job.total_batches)
            .bind(job.completed_batches)
            .bind(job.total_tokens)
            .bind(job.total_users)
            .bind(job.completed_tokens)
            .bind(job.completed_at)
            .bind(&job.control_group_csv_path)
            .bind(job.batches_ready)
            .bind(job.status.as_str())
            .bind(&job.created_by)
            .bind(job.created_at)
            .bind(job.updated_at),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs j JOIN apps a ON a.id = j.app_id WHERE j.id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(app_id = %app_id), err)]
    async fn templates(&self, app_id: AppId, names: &[&str]) -> Result<Vec<Template>, StoreError> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT name, locale, defaults, body
            FROM templates
            WHERE app_id = $1 AND name = ANY($2)
            "#,
        )
        .bind(app_id.as_uuid())
        .bind(names)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_templates", e))?;

        rows.iter()
            .map(|row| {
                let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());
                let name: String = row.try_get("name").map_err(decode)?;
                let locale: String = row.try_get("locale").map_err(decode)?;
                let body = json_object(row.try_get("body").map_err(decode)?);
                let defaults = json_object(row.try_get("defaults").map_err(decode)?);
                Ok(Template::new(name, locale, body).with_defaults(defaults))
            })
            .collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn add_totals(&self, id: JobId, delta: TotalsDelta) -> Result<(), StoreError> {
        self.execute_on_job(
            "add_totals",
            id,
            sqlx::query(
                r#"
                UPDATE jobs
                SET total_batches = coalesce(total_batches, 0) + $2,
                    total_users = coalesce(total_users, 0) + $3,
                    total_tokens = coalesce(total_tokens, 0) + $4,
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(delta.batches)
            .bind(delta.users)
            .bind(delta.tokens),
        )
        .await
    }

    async fn set_range_totals(&self, id: JobId, total_batches: i64, total_tokens: i64) -> Result<(), StoreError> {
        self.execute_on_job(
            "set_range_totals",
            id,
            sqlx::query(
                "UPDATE jobs SET total_batches = $2, total_tokens = $3, updated_at = now() WHERE id = $1",
            )
            .bind(id.as_uuid())
            .bind(total_batches)
            .bind(total_tokens),
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn record_batch(&self, id: JobId, completed_tokens: i64) -> Result<(), StoreError> {
        self.execute_on_job(
            "record_batch",
            id,
            sqlx::query(
                r#"
                UPDATE jobs
                SET completed_tokens = completed_tokens + $2,
                    completed_batches = completed_batches + 1,
                    updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(id.as_uuid())
            .bind(completed_tokens),
        )
        .await
    }

    async fn mark_batches_ready(&self, id: JobId) -> Result<(), StoreError> {
        self.execute_on_job(
            "mark_batches_ready",
            id,
            sqlx::query("UPDATE jobs SET batches_ready = TRUE, updated_at = now() WHERE id = $1")
                .bind(id.as_uuid()),
        )
        .await
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn try_complete(&self, id: JobId, at_nanos: i64) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET completed_at = $2, updated_at = now()
            WHERE id = $1
              AND completed_at = 0
              AND batches_ready
              AND total_batches IS NOT NULL
              AND completed_batches >= total_batches
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .bind(at_nanos)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_complete", e))?;
        Ok(row.is_some())
    }

    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        self.execute_on_job(
            "set_status",
            id,
            sqlx::query("UPDATE jobs SET status = $2, updated_at = now() WHERE id = $1")
                .bind(id.as_uuid())
                .bind(status.as_str()),
        )
        .await
    }

    async fn set_csv_path(&self, id: JobId, path: &str) -> Result<(), StoreError> {
        self.execute_on_job(
            "set_csv_path",
            id,
            sqlx::query("UPDATE jobs SET csv_path = $2, updated_at = now() WHERE id = $1")
                .bind(id.as_uuid())
                .bind(path),
        )
        .await
    }

    async fn set_control_group_csv_path(&self, id: JobId, path: &str) -> Result<(), StoreError> {
        self.execute_on_job(
            "set_control_group_csv_path",
            id,
            sqlx::query("UPDATE jobs SET control_group_csv_path = $2, updated_at = now() WHERE id = $1")
                .bind(id.as_uuid())
                .bind(path),
        )
        .await
    }

    async fn tag(&self, id: JobId, stage: &str, state: TagState, message: &str) -> Result<(), StoreError> {
        self.execute(
            "tag_job",
            sqlx::query(
                "INSERT INTO job_events (job_id, stage, state, message, created_at) VALUES ($1, $2, $3, $4, now())",
            )
            .bind(id.as_uuid())
            .bind(stage)
            .bind(state.as_str())
            .bind(message),
        )
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.execute("ping", sqlx::query("SELECT 1")).await?;
        Ok(())
    }
}
