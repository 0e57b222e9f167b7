//! `herald-worker`: the campaign batch pipeline.
//!
//! A job fans out through named queues:
//!
//! - `csv_split` / `db_to_csv`: turn the audience into CSV byte ranges
//! - `create_batches` / `create_batches_from_filters`: page, bucket and schedule
//! - `dispatch` / `direct_dispatch`: render and publish one batch
//! - `job_completed` / `resume_job`: completion and pause handling
//!
//! All shared state lives in the job repository and the coordination store,
//! so any number of worker processes can serve the same queues.

pub mod breaker;
pub mod config;
pub mod error;
pub mod handler;
pub mod keys;
pub mod messages;
pub mod orchestrator;
pub mod pages;
pub mod paused;
pub mod services;
pub mod stage_status;
pub mod stages;

pub use config::{ConfigError, FilterPipeline, QueueSettings, WorkerConfig};
pub use error::{StageError, StageErrorKind};
pub use messages::{BatchPart, Envelope, QueueName, StageMessage};
pub use orchestrator::Orchestrator;
pub use services::Services;
