//! In-memory token tables for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use herald_core::{filter, User};

use super::{validate_table_name, TokenStore};
use crate::repository::StoreError;

/// Token tables keyed by name; rows kept in `seq_id` order.
#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tables: RwLock<HashMap<String, Vec<User>>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("token store lock poisoned".to_string())
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rows; a zero `seq_id` is replaced with the next one.
    pub fn insert(&self, table: &str, users: impl IntoIterator<Item = User>) -> Result<(), StoreError> {
        validate_table_name(table)?;
        let mut tables = self.tables.write().map_err(poisoned)?;
        let rows = tables.entry(table.to_string()).or_default();
        let mut next = rows.iter().map(|u| u.seq_id).max().unwrap_or(0) + 1;
        for mut user in users {
            if user.seq_id == 0 {
                user.seq_id = next;
            }
            next = next.max(user.seq_id + 1);
            rows.push(user);
        }
        rows.sort_by_key(|u| u.seq_id);
        Ok(())
    }

    fn select(
        &self,
        table: &str,
        keep: impl Fn(&User) -> bool,
    ) -> Result<Vec<User>, StoreError> {
        validate_table_name(table)?;
        let tables = self.tables.read().map_err(poisoned)?;
        let rows = tables
            .get(table)
            .ok_or_else(|| StoreError::Database(format!("relation \"{table}\" does not exist")))?;
        Ok(rows.iter().filter(|u| keep(u)).cloned().collect())
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn count(&self, table: &str, filters: &BTreeMap<String, String>) -> Result<i64, StoreError> {
        Ok(self.select(table, |u| filter::matches(filters, u))?.len() as i64)
    }

    async fn page_end_seq_id(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        after: i64,
        limit: u32,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .page(table, filters, after, limit)
            .await?
            .last()
            .map(|u| u.seq_id))
    }

    async fn page(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        after: i64,
        limit: u32,
    ) -> Result<Vec<User>, StoreError> {
        let mut rows = self.select(table, |u| u.seq_id > after && filter::matches(filters, u))?;
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn by_user_ids(&self, table: &str, user_ids: &[String]) -> Result<Vec<User>, StoreError> {
        self.select(table, |u| user_ids.contains(&u.user_id))
    }

    async fn by_seq_range(
        &self,
        table: &str,
        filters: &BTreeMap<String, String>,
        from: i64,
        to: i64,
    ) -> Result<Vec<User>, StoreError> {
        self.select(table, |u| u.seq_id >= from && u.seq_id < to && filter::matches(filters, u))
    }

    async fn max_seq_id(&self, table: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.select(table, |_| true)?.last().map(|u| u.seq_id))
    }

    async fn estimated_rows(&self, table: &str) -> Result<i64, StoreError> {
        Ok(self.select(table, |_| true)?.len() as i64)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryTokenStore {
        let store = InMemoryTokenStore::new();
        store
            .insert(
                "game_gcm",
                (0..10).map(|i| {
                    User::new(format!("u{i}"), format!("t{i}"))
                        .with_locale(if i % 2 == 0 { "en" } else { "fr" })
                }),
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn keyset_pages_cover_filtered_rows() {
        let store = store();
        let filters = BTreeMap::from([("locale".to_string(), "en".to_string())]);
        assert_eq!(store.count("game_gcm", &filters).await.unwrap(), 5);

        let mut after = 0;
        let mut seen = Vec::new();
        while let Some(end) = store.page_end_seq_id("game_gcm", &filters, after, 2).await.unwrap() {
            let page = store.page("game_gcm", &filters, after, 2).await.unwrap();
            assert_eq!(page.last().map(|u| u.seq_id), Some(end));
            seen.extend(page.into_iter().map(|u| u.user_id));
            after = end;
        }
        assert_eq!(seen, vec!["u0", "u2", "u4", "u6", "u8"]);
    }

    #[tokio::test]
    async fn seq_ranges_are_half_open() {
        let store = store();
        let rows = store.by_seq_range("game_gcm", &BTreeMap::new(), 1, 4).await.unwrap();
        assert_eq!(rows.iter().map(|u| u.seq_id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(store.max_seq_id("game_gcm").await.unwrap(), Some(10));
    }

    #[tokio::test]
    async fn missing_table_is_an_error() {
        let store = InMemoryTokenStore::new();
        assert!(store.count("game_apns", &BTreeMap::new()).await.is_err());
    }
}
