//! Queue storage: trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use super::types::{DeadLetterEntry, QueuedUnit, UnitId, UnitStatus};

/// Storage behind the named queues.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Enqueue a new unit.
    async fn enqueue(&self, unit: QueuedUnit) -> Result<UnitId, QueueStoreError>;

    /// Claim the next ready unit of `queue`, marking it running.
    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedUnit>, QueueStoreError>;

    /// Persist the outcome of an attempt.
    async fn update(&self, unit: &QueuedUnit) -> Result<(), QueueStoreError>;

    /// Move a unit to the dead-letter queue.
    async fn dead_letter(&self, unit: QueuedUnit, reason: String) -> Result<(), QueueStoreError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueStoreError>;

    /// Move a dead-lettered unit back to pending with a fresh attempt count.
    async fn retry_dead_letter(&self, id: UnitId) -> Result<QueuedUnit, QueueStoreError>;

    /// Units of `queue` that have not finished yet, oldest first.
    async fn pending(&self, queue: &str) -> Result<Vec<QueuedUnit>, QueueStoreError>;

    async fn stats(&self) -> Result<QueueStats, QueueStoreError>;
}

/// Queue store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueStoreError {
    #[error("unit not found: {0}")]
    NotFound(UnitId),
    #[error("unit already exists: {0}")]
    AlreadyExists(UnitId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

fn poisoned<T>(_: T) -> QueueStoreError {
    QueueStoreError::Storage("queue lock poisoned".to_string())
}

fn is_waiting(unit: &QueuedUnit) -> bool {
    matches!(unit.status, UnitStatus::Pending | UnitStatus::Failed { .. })
}

/// In-memory queue store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    units: RwLock<HashMap<UnitId, QueuedUnit>>,
    dead_letters: RwLock<HashMap<UnitId, DeadLetterEntry>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, unit: QueuedUnit) -> Result<UnitId, QueueStoreError> {
        let mut units = self.units.write().map_err(poisoned)?;
        if units.contains_key(&unit.id) {
            return Err(QueueStoreError::AlreadyExists(unit.id));
        }
        let id = unit.id;
        units.insert(id, unit);
        Ok(id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedUnit>, QueueStoreError> {
        let mut units = self.units.write().map_err(poisoned)?;
        let now = Utc::now();

        let next = units
            .values()
            .filter(|u| u.queue == queue && is_waiting(u) && u.is_ready_at(now))
            .min_by_key(|u| (u.scheduled_at.unwrap_or(u.created_at), u.created_at))
            .map(|u| u.id);

        Ok(next.and_then(|id| {
            units.get_mut(&id).map(|unit| {
                unit.mark_running();
                unit.clone()
            })
        }))
    }

    async fn update(&self, unit: &QueuedUnit) -> Result<(), QueueStoreError> {
        let mut units = self.units.write().map_err(poisoned)?;
        if !units.contains_key(&unit.id) {
            return Err(QueueStoreError::NotFound(unit.id));
        }
        units.insert(unit.id, unit.clone());
        Ok(())
    }

    async fn dead_letter(&self, mut unit: QueuedUnit, reason: String) -> Result<(), QueueStoreError> {
        let mut units = self.units.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        unit.status = UnitStatus::DeadLettered {
            error: reason.clone(),
            attempts: unit.attempt,
        };
        unit.updated_at = Utc::now();

        units.remove(&unit.id);
        dls.insert(unit.id, DeadLetterEntry::new(unit, reason));
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueStoreError> {
        let dls = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn retry_dead_letter(&self, id: UnitId) -> Result<QueuedUnit, QueueStoreError> {
        let mut units = self.units.write().map_err(poisoned)?;
        let mut dls = self.dead_letters.write().map_err(poisoned)?;

        let entry = dls.remove(&id).ok_or(QueueStoreError::NotFound(id))?;
        let mut unit = entry.unit;
        unit.status = UnitStatus::Pending;
        unit.attempt = 0;
        unit.scheduled_at = None;
        unit.updated_at = Utc::now();
        unit.history.clear();

        units.insert(unit.id, unit.clone());
        Ok(unit)
    }

    async fn pending(&self, queue: &str) -> Result<Vec<QueuedUnit>, QueueStoreError> {
        let units = self.units.read().map_err(poisoned)?;
        let mut result: Vec<_> = units
            .values()
            .filter(|u| u.queue == queue && !u.status.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|u| u.created_at);
        Ok(result)
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let units = self.units.read().map_err(poisoned)?;
        let dls = self.dead_letters.read().map_err(poisoned)?;

        let mut stats = QueueStats::default();
        for unit in units.values() {
            match &unit.status {
                UnitStatus::Pending => stats.pending += 1,
                UnitStatus::Running => stats.running += 1,
                UnitStatus::Completed => stats.completed += 1,
                UnitStatus::Failed { .. } => stats.failed += 1,
                UnitStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        stats.dead_lettered += dls.len();
        Ok(stats)
    }
}

#[async_trait]
impl<S: QueueStore + ?Sized> QueueStore for Arc<S> {
    async fn enqueue(&self, unit: QueuedUnit) -> Result<UnitId, QueueStoreError> {
        (**self).enqueue(unit).await
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedUnit>, QueueStoreError> {
        (**self).claim_next(queue).await
    }

    async fn update(&self, unit: &QueuedUnit) -> Result<(), QueueStoreError> {
        (**self).update(unit).await
    }

    async fn dead_letter(&self, unit: QueuedUnit, reason: String) -> Result<(), QueueStoreError> {
        (**self).dead_letter(unit, reason).await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueStoreError> {
        (**self).list_dead_letters(limit).await
    }

    async fn retry_dead_letter(&self, id: UnitId) -> Result<QueuedUnit, QueueStoreError> {
        (**self).retry_dead_letter(id).await
    }

    async fn pending(&self, queue: &str) -> Result<Vec<QueuedUnit>, QueueStoreError> {
        (**self).pending(queue).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        (**self).stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn enqueue_and_claim_per_queue() {
        let store = InMemoryQueueStore::new();
        let id = store
            .enqueue(QueuedUnit::new("dispatch", serde_json::json!({"n": 1})))
            .await
            .unwrap();

        assert!(store.claim_next("csv_split").await.unwrap().is_none());

        let claimed = store.claim_next("dispatch").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, UnitStatus::Running);
        assert_eq!(claimed.attempt, 1);

        assert!(store.claim_next("dispatch").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_in_fifo_order() {
        let store = InMemoryQueueStore::new();
        let first = QueuedUnit::new("q", serde_json::json!(1));
        let mut second = QueuedUnit::new("q", serde_json::json!(2));
        second.created_at = first.created_at + chrono::Duration::milliseconds(5);
        let first_id = first.id;
        store.enqueue(second).await.unwrap();
        store.enqueue(first).await.unwrap();

        assert_eq!(store.claim_next("q").await.unwrap().unwrap().id, first_id);
    }

    #[tokio::test]
    async fn delayed_units_wait() {
        let store = InMemoryQueueStore::new();
        store
            .enqueue(QueuedUnit::new("q", serde_json::json!({})).scheduled_in(Duration::from_secs(3600)))
            .await
            .unwrap();
        assert!(store.claim_next("q").await.unwrap().is_none());
        assert_eq!(store.pending("q").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dead_letter_flow() {
        let store = InMemoryQueueStore::new();
        let unit = QueuedUnit::new("q", serde_json::json!({}));
        let id = unit.id;
        store.enqueue(unit).await.unwrap();

        let claimed = store.claim_next("q").await.unwrap().unwrap();
        store.dead_letter(claimed, "fatal".to_string()).await.unwrap();

        assert!(store.pending("q").await.unwrap().is_empty());
        let dls = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].unit.id, id);

        let retried = store.retry_dead_letter(id).await.unwrap();
        assert_eq!(retried.status, UnitStatus::Pending);
        assert!(store.list_dead_letters(10).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().pending, 1);
    }
}
