//! Job repository: the authoritative campaign rows.
//!
//! Counter mutations are expressed as increments so concurrent stage
//! instances never read-modify-write a job in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use herald_core::{AppId, Job, JobId, JobStatus, Template};

pub mod memory;
pub mod postgres;

pub use memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;

/// Storage error shared by the Postgres-backed adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Outcome recorded by a stage on a job, for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagState {
    Running,
    Success,
    Fail,
}

impl TagState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagState::Running => "running",
            TagState::Success => "success",
            TagState::Fail => "fail",
        }
    }
}

/// One tag written by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTag {
    pub stage: String,
    pub state: TagState,
    pub message: String,
}

/// Increments applied to a job's totals in one statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TotalsDelta {
    pub batches: i64,
    pub users: i64,
    pub tokens: i64,
}

impl TotalsDelta {
    pub fn is_empty(&self) -> bool {
        self.batches == 0 && self.users == 0 && self.tokens == 0
    }
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Templates of `app_id` named in `names`, every locale.
    async fn templates(&self, app_id: AppId, names: &[&str]) -> Result<Vec<Template>, StoreError>;

    /// `total_batches = coalesce(total_batches, 0) + ?` and friends.
    async fn add_totals(&self, id: JobId, delta: TotalsDelta) -> Result<(), StoreError>;

    /// Overwrite totals for seq-range jobs, whose batches are known upfront.
    async fn set_range_totals(&self, id: JobId, total_batches: i64, total_tokens: i64) -> Result<(), StoreError>;

    /// Count one finished batch and the tokens it delivered.
    async fn record_batch(&self, id: JobId, completed_tokens: i64) -> Result<(), StoreError>;

    /// Flag that every batch of the job has been scheduled.
    async fn mark_batches_ready(&self, id: JobId) -> Result<(), StoreError>;

    /// Set `completed_at` if the job is ready, unfinished, and every batch is
    /// done. True for exactly one caller.
    async fn try_complete(&self, id: JobId, at_nanos: i64) -> Result<bool, StoreError>;

    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError>;

    /// Point a filter job at the CSV materialised from its token table.
    async fn set_csv_path(&self, id: JobId, path: &str) -> Result<(), StoreError>;

    async fn set_control_group_csv_path(&self, id: JobId, path: &str) -> Result<(), StoreError>;

    async fn tag(&self, id: JobId, stage: &str, state: TagState, message: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
