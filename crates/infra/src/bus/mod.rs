//! Push bus: the downstream hand-off of rendered pushes.
//!
//! Every rendered push is published to a topic named after its app and
//! service. Delivery to the provider happens elsewhere.

use async_trait::async_trait;
use serde_json::Value;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use memory::InMemoryPushBus;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsPushBus;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

#[async_trait]
pub trait PushBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &Value) -> Result<(), BusError>;
}
