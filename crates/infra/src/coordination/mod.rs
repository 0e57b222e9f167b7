//! Cross-instance coordination primitives.
//!
//! Every piece of operational state the pipeline shares between stage
//! instances (processed pages, parked units, failure counters, stage
//! progress, upload trackers) lives behind [`Coordination`]. The operations
//! map one-to-one onto Redis commands and each is atomic on its own.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::InMemoryCoordination;
#[cfg(feature = "redis")]
pub use redis_store::RedisCoordination;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinationError {
    #[error("coordination connection error: {0}")]
    Connection(String),

    #[error("coordination command error: {0}")]
    Command(String),

    /// Key holds a value of another type.
    #[error("wrong type for key {0}")]
    WrongType(String),
}

/// Redis-shaped coordination store.
#[async_trait]
pub trait Coordination: Send + Sync {
    /// Append to a list, returning its length after the push.
    async fn rpush(&self, key: &str, value: &str) -> Result<u64, CoordinationError>;

    /// Pop the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>, CoordinationError>;

    async fn llen(&self, key: &str) -> Result<u64, CoordinationError>;

    /// Add to a set, returning whether the member is new.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, CoordinationError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, CoordinationError>;

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError>;

    async fn del(&self, key: &str) -> Result<(), CoordinationError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CoordinationError>;

    /// Increment a counter, giving it `ttl` if it has no expiry yet.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, CoordinationError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CoordinationError>;

    /// `SET key value NX EX ttl`; true when the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, CoordinationError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), CoordinationError>;

    /// `HSETNX`; true when the field was absent and is now `value`.
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool, CoordinationError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, CoordinationError>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, CoordinationError>;

    async fn hincrby(&self, key: &str, field: &str, by: i64) -> Result<i64, CoordinationError>;

    async fn ping(&self) -> Result<(), CoordinationError>;
}
