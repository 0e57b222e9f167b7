//! Device-token tables, one per `{app}_{service}`.
//!
//! Pages are addressed by `seq_id` (keyset pagination), never by OFFSET, so
//! concurrent inserts into a table do not shift pages under a running job.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use herald_core::User;

use crate::repository::StoreError;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryTokenStore;
pub use postgres::PostgresTokenStore;

/// One keyset page of a filtered token table, carried by DB-to-CSV units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenQuery {
    pub table: String,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
    /// Exclusive lower bound on `seq_id`.
    pub after_seq_id: i64,
    pub limit: u32,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Rows of `table` matching `filters`.
    async fn count(&self, table: &str, filters: &BTreeMap<String, String>) -> Result<i64, StoreError>;

    /// Largest `seq_id` of the page starting after `after`, `None` past the end.
    async fn page_end_seq_id(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        after: i64,
        limit: u32,
    ) -> Result<Option<i64>, StoreError>;

    /// Up to `limit` matching rows with `seq_id > after`, in `seq_id` order.
    async fn page(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        after: i64,
        limit: u32,
    ) -> Result<Vec<User>, StoreError>;

    /// Every token row of the given users.
    async fn by_user_ids(&self, table: &str, user_ids: &[String]) -> Result<Vec<User>, StoreError>;

    /// Matching rows with `from <= seq_id < to`.
    async fn by_seq_range(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        from: i64,
        to: i64,
    ) -> Result<Vec<User>, StoreError>;

    async fn max_seq_id(&self, table: &str) -> Result<Option<i64>, StoreError>;

    /// Planner row estimate; cheap on very large tables.
    async fn estimated_rows(&self, table: &str) -> Result<i64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Table names are built from app names, so only `[A-Za-z0-9_]` is accepted.
pub fn validate_table_name(table: &str) -> Result<(), StoreError> {
    if !table.is_empty() && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(table.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names() {
        assert!(validate_table_name("game_gcm").is_ok());
        assert!(validate_table_name("Game2_apns").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("game; drop table jobs").is_err());
        assert!(validate_table_name("game\"gcm").is_err());
    }

    #[test]
    fn token_query_defaults_filters() {
        let q: TokenQuery =
            serde_json::from_str(r#"{"table":"game_gcm","after_seq_id":0,"limit":10}"#).unwrap();
        assert!(q.filters.is_empty());
    }
}
