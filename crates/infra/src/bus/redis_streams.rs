//! Redis Streams-backed push bus.
//!
//! ## Layout
//!
//! - **Stream key**: `{prefix}:{topic}`, one stream per app/service topic
//! - **Fields**: `topic`, `payload` (JSON)
//!
//! Downstream senders read the streams with their own consumer groups; this
//! side only appends. Streams are capped with `MAXLEN ~` so an idle consumer
//! cannot grow them without bound.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tracing::instrument;

use super::{BusError, PushBus};

const DEFAULT_PREFIX: &str = "herald:push";

/// Default approximate cap per stream.
const DEFAULT_MAX_LEN: u64 = 1_000_000;

#[derive(Clone)]
pub struct RedisStreamsPushBus {
    conn: ConnectionManager,
    prefix: String,
    max_len: u64,
}

impl std::fmt::Debug for RedisStreamsPushBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsPushBus")
            .field("prefix", &self.prefix)
            .field("max_len", &self.max_len)
            .finish()
    }
}

impl RedisStreamsPushBus {
    /// Connect to Redis at `redis_url`; `prefix` defaults to `herald:push`.
    pub async fn connect(redis_url: &str, prefix: Option<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url).map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self::from_connection(conn, prefix))
    }

    pub fn from_connection(conn: ConnectionManager, prefix: Option<String>) -> Self {
        Self {
            conn,
            prefix: prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            max_len: DEFAULT_MAX_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = max_len;
        self
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.prefix, topic)
    }
}

#[async_trait]
impl PushBus for RedisStreamsPushBus {
    #[instrument(skip(self, payload), fields(stream_key = %self.stream_key(topic)), err)]
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), BusError> {
        let body = serde_json::to_string(payload).map_err(|e| BusError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(topic))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*")
            .arg("topic")
            .arg(topic)
            .arg("payload")
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                message: format!("XADD failed: {e}"),
            })?;
        Ok(())
    }
}
