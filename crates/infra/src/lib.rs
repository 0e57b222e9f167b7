//! Infrastructure layer: Postgres, Redis, blob storage, bus and the job-queue runtime.
//!
//! Every adapter sits behind a trait with an in-memory implementation so the
//! pipeline can run end to end in tests. Redis-backed adapters are compiled
//! with the `redis` feature.

pub mod blob;
pub mod bus;
pub mod coordination;
pub mod db;
pub mod notifier;
pub mod queue;
pub mod repository;
pub mod tokens;

pub use blob::{BlobError, BlobStore, CompletedPart, InMemoryBlobStore, LocalFsBlobStore, MultipartUpload, RangeRead};
pub use bus::{BusError, InMemoryPushBus, PushBus};
pub use coordination::{Coordination, CoordinationError, InMemoryCoordination};
pub use notifier::{InMemoryNotifier, Notification, Notifier, NotifyError, TracingNotifier};
pub use repository::{InMemoryJobRepository, JobRepository, JobTag, PostgresJobRepository, StoreError, TagState, TotalsDelta};
pub use tokens::{InMemoryTokenStore, PostgresTokenStore, TokenQuery, TokenStore};

#[cfg(feature = "redis")]
pub use bus::RedisStreamsPushBus;
#[cfg(feature = "redis")]
pub use coordination::RedisCoordination;
