//! Redis-backed queue store.
//!
//! ## Layout
//!
//! - `{prefix}:queue:{name}`: sorted set of unit ids scored by ready time (ms)
//! - `{prefix}:units`: hash of unit id -> unit JSON
//! - `{prefix}:dead`: hash of unit id -> dead-letter entry JSON
//!
//! Claiming pops the lowest-scored ready id with a Lua script so two workers
//! never claim the same unit.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::store::{QueueStats, QueueStore, QueueStoreError};
use super::types::{DeadLetterEntry, QueuedUnit, UnitId, UnitStatus};

const DEFAULT_PREFIX: &str = "herald";

const CLAIM_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
  return false
end
redis.call('ZREM', KEYS[1], ids[1])
return redis.call('HGET', KEYS[2], ids[1])
"#;

#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore").field("prefix", &self.prefix).finish()
    }
}

fn command_error(op: &str, e: redis::RedisError) -> QueueStoreError {
    QueueStoreError::Storage(format!("{op} failed: {e}"))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, QueueStoreError> {
    serde_json::to_string(value).map_err(|e| QueueStoreError::Storage(format!("serialization: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, QueueStoreError> {
    serde_json::from_str(raw).map_err(|e| QueueStoreError::Storage(format!("deserialization: {e}")))
}

fn ready_score(unit: &QueuedUnit) -> i64 {
    unit.scheduled_at.unwrap_or(unit.created_at).timestamp_millis()
}

impl RedisQueueStore {
    /// Connect to Redis at `redis_url`.
    pub async fn connect(redis_url: &str, prefix: Option<String>) -> Result<Self, QueueStoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueStoreError::Storage(format!("connection: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueStoreError::Storage(format!("connection: {e}")))?;
        Ok(Self::from_connection(conn, prefix))
    }

    pub fn from_connection(conn: ConnectionManager, prefix: Option<String>) -> Self {
        Self {
            conn,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
        }
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn units_key(&self) -> String {
        format!("{}:units", self.prefix)
    }

    fn dead_key(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    async fn all_units(&self) -> Result<Vec<QueuedUnit>, QueueStoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.units_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HVALS", e))?;
        raw.iter().map(|r| decode(r)).collect()
    }

    async fn write_unit(&self, unit: &QueuedUnit) -> Result<(), QueueStoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.units_key())
            .arg(unit.id.to_string())
            .arg(encode(unit)?)
            .ignore();
        if matches!(unit.status, UnitStatus::Pending | UnitStatus::Failed { .. }) {
            pipe.cmd("ZADD")
                .arg(self.queue_key(&unit.queue))
                .arg(ready_score(unit))
                .arg(unit.id.to_string())
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_error("HSET/ZADD", e))
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip(self, unit), fields(queue = %unit.queue, unit_id = %unit.id), err)]
    async fn enqueue(&self, unit: QueuedUnit) -> Result<UnitId, QueueStoreError> {
        self.write_unit(&unit).await?;
        Ok(unit.id)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedUnit>, QueueStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(self.queue_key(queue))
            .key(self.units_key())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command_error("claim script", e))?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut unit: QueuedUnit = decode(&raw)?;
        unit.mark_running();
        self.write_unit(&unit).await?;
        Ok(Some(unit))
    }

    async fn update(&self, unit: &QueuedUnit) -> Result<(), QueueStoreError> {
        if unit.status == UnitStatus::Completed {
            let mut conn = self.conn.clone();
            return redis::cmd("HDEL")
                .arg(self.units_key())
                .arg(unit.id.to_string())
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| command_error("HDEL", e));
        }
        self.write_unit(unit).await
    }

    async fn dead_letter(&self, mut unit: QueuedUnit, reason: String) -> Result<(), QueueStoreError> {
        unit.status = UnitStatus::DeadLettered {
            error: reason.clone(),
            attempts: unit.attempt,
        };
        unit.updated_at = Utc::now();
        let id = unit.id.to_string();
        let queue_key = self.queue_key(&unit.queue);
        let entry = encode(&DeadLetterEntry::new(unit, reason))?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("HDEL").arg(self.units_key()).arg(&id).ignore()
            .cmd("ZREM").arg(queue_key).arg(&id).ignore()
            .cmd("HSET").arg(self.dead_key()).arg(&id).arg(entry).ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_error("dead letter", e))
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueStoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.dead_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HVALS", e))?;
        let mut entries = raw.iter().map(|r| decode::<DeadLetterEntry>(r)).collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.dead_lettered_at);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn retry_dead_letter(&self, id: UnitId) -> Result<QueuedUnit, QueueStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.dead_key())
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HGET", e))?;
        let entry: DeadLetterEntry = decode(&raw.ok_or(QueueStoreError::NotFound(id))?)?;

        let mut unit = entry.unit;
        unit.status = UnitStatus::Pending;
        unit.attempt = 0;
        unit.scheduled_at = None;
        unit.updated_at = Utc::now();
        unit.history.clear();

        redis::cmd("HDEL")
            .arg(self.dead_key())
            .arg(id.to_string())
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| command_error("HDEL", e))?;
        self.write_unit(&unit).await?;
        Ok(unit)
    }

    async fn pending(&self, queue: &str) -> Result<Vec<QueuedUnit>, QueueStoreError> {
        let mut units: Vec<_> = self
            .all_units()
            .await?
            .into_iter()
            .filter(|u| u.queue == queue && !u.status.is_terminal())
            .collect();
        units.sort_by_key(|u| u.created_at);
        Ok(units)
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let mut stats = QueueStats::default();
        for unit in self.all_units().await? {
            match unit.status {
                UnitStatus::Pending => stats.pending += 1,
                UnitStatus::Running => stats.running += 1,
                UnitStatus::Completed => stats.completed += 1,
                UnitStatus::Failed { .. } => stats.failed += 1,
                UnitStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        let mut conn = self.conn.clone();
        let dead: usize = redis::cmd("HLEN")
            .arg(self.dead_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("HLEN", e))?;
        stats.dead_lettered += dead;
        Ok(stats)
    }
}
