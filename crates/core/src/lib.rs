//! `herald-core`: campaign domain building blocks.
//!
//! This crate contains **pure domain** logic (no infrastructure concerns):
//! the job model, audience filters, template rendering, timezone bucketing,
//! control groups and provider payloads.

pub mod audience;
pub mod csv;
pub mod error;
pub mod filter;
pub mod id;
pub mod job;
pub mod payload;
pub mod template;
pub mod user;

pub use error::{DomainError, DomainResult};
pub use id::{AppId, JobId};
pub use job::{Job, JobSource, JobStatus, PastTimeStrategy, Service};
pub use template::{Template, TemplateCatalog};
pub use user::User;
