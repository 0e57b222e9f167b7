//! Postgres token tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use herald_core::{filter, User};

use super::{validate_table_name, TokenStore};
use crate::repository::postgres::map_sqlx_error;
use crate::repository::StoreError;

const USER_COLUMNS: &str = "user_id, token, locale, tz, seq_id";

#[derive(Debug, Clone)]
pub struct PostgresTokenStore {
    pool: Arc<PgPool>,
}

impl PostgresTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    pub fn from_arc(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

fn quoted(table: &str) -> Result<String, StoreError> {
    validate_table_name(table)?;
    Ok(format!("\"{table}\""))
}

/// `" AND <clause>"`, or nothing for an empty filter map.
fn and_clause(filters: &BTreeMap<String, String>) -> String {
    match filter::compile(filters) {
        clause if clause.is_empty() => String::new(),
        clause => format!(" AND {clause}"),
    }
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> Result<User, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Decode(e.to_string());
    let user_id: String = row.try_get("user_id").map_err(decode)?;
    let token: String = row.try_get("token").map_err(decode)?;
    let locale: Option<String> = row.try_get("locale").map_err(decode)?;
    let tz: Option<String> = row.try_get("tz").map_err(decode)?;
    let seq_id: i64 = row.try_get("seq_id").map_err(decode)?;
    Ok(User::new(user_id, token)
        .with_locale(locale.unwrap_or_default())
        .with_tz(tz.unwrap_or_default())
        .with_seq_id(seq_id))
}

#[async_trait]
impl TokenStore for PostgresTokenStore {
    #[instrument(skip(self, filters), err)]
    async fn count(&self, table: &str, filters: &BTreeMap<String, String>) -> Result<i64, StoreError> {
        let clause = filter::compile(filters);
        let mut sql = format!("SELECT count(*) AS total FROM {}", quoted(table)?);
        if !clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause);
        }
        let row = sqlx::query(&sql)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_tokens", e))?;
        row.try_get("total").map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn page_end_seq_id(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        after: i64,
        limit: u32,
    ) -> Result<Option<i64>, StoreError> {
        let sql = format!(
            "SELECT max(q.seq_id) AS last FROM (SELECT seq_id FROM {} WHERE seq_id > $1{} ORDER BY seq_id ASC LIMIT $2) AS q",
            quoted(table)?,
            and_clause(filters)
        );
        let row = sqlx::query(&sql)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("page_end_seq_id", e))?;
        row.try_get("last").map_err(|e| StoreError::Decode(e.to_string()))
    }

    #[instrument(skip(self, filters), err)]
    async fn page(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        after: i64,
        limit: u32,
    ) -> Result<Vec<User>, StoreError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM {} WHERE seq_id > $1{} ORDER BY seq_id ASC LIMIT $2",
            quoted(table)?,
            and_clause(filters)
        );
        let rows = sqlx::query(&sql)
            .bind(after)
            .bind(i64::from(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("token_page", e))?;
        rows.iter().map(user_from_row).collect()
    }

    #[instrument(skip(self, user_ids), fields(ids = user_ids.len()), err)]
    async fn by_user_ids(&self, table: &str, user_ids: &[String]) -> Result<Vec<User>, StoreError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM {} WHERE user_id = ANY($1)", quoted(table)?);
        let rows = sqlx::query(&sql)
            .bind(user_ids.to_vec())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tokens_by_user_ids", e))?;
        rows.iter().map(user_from_row).collect()
    }

    #[instrument(skip(self, filters), err)]
    async fn by_seq_range(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        from: i64,
        to: i64,
    ) -> Result<Vec<User>, StoreError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM {} WHERE seq_id >= $1 AND seq_id < $2{}",
            quoted(table)?,
            and_clause(filters)
        );
        let rows = sqlx::query(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tokens_by_seq_range", e))?;
        rows.iter().map(user_from_row).collect()
    }

    async fn max_seq_id(&self, table: &str) -> Result<Option<i64>, StoreError> {
        let sql = format!("SELECT max(seq_id) AS last FROM {}", quoted(table)?);
        let row = sqlx::query(&sql)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("max_seq_id", e))?;
        row.try_get("last").map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn estimated_rows(&self, table: &str) -> Result<i64, StoreError> {
        validate_table_name(table)?;
        let row = sqlx::query("SELECT reltuples::BIGINT AS estimate FROM pg_class WHERE relname = $1")
            .bind(table)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("estimated_rows", e))?;
        match row {
            Some(row) => row.try_get("estimate").map_err(|e| StoreError::Decode(e.to_string())),
            None => Ok(0),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}
