//! Named work queues with retry, backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `QueuedUnit`: one unit of stage work with its retry policy and history
//! - `QueueStore`: persistence for units (in-memory, or Redis with the `redis` feature)
//! - `QueueExecutor`: worker pools per queue running registered handlers
//! - `DeadLetterEntry`: units that failed fatally or exhausted their retries

pub mod executor;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;

pub use executor::{
    ExecutorConfig, ExecutorStats, Outcome, QueueConfig, QueueExecutor, QueueExecutorHandle,
    UnitHandler,
};
#[cfg(feature = "redis")]
pub use redis_store::RedisQueueStore;
pub use store::{InMemoryQueueStore, QueueStats, QueueStore, QueueStoreError};
pub use types::{
    Attempt, Backoff, DeadLetterEntry, QueuedUnit, RetryPolicy, UnitId, UnitResult, UnitStatus,
};
