//! Operator notifications about campaigns.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{info, warn};

use herald_core::{Job, JobId};

#[derive(Debug, Clone, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Every batch of `job` has been dispatched.
    async fn job_completed(&self, job: &Job) -> Result<(), NotifyError>;

    /// Dispatch of `job` was suspended after repeated failures.
    async fn circuit_break(&self, job: &Job) -> Result<(), NotifyError>;
}

/// Writes notifications to the log; used when no mail relay is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn job_completed(&self, job: &Job) -> Result<(), NotifyError> {
        info!(
            job_id = %job.id,
            app = %job.app_name,
            created_by = %job.created_by,
            total_tokens = job.total_tokens,
            completed_tokens = job.completed_tokens,
            "job completed"
        );
        Ok(())
    }

    async fn circuit_break(&self, job: &Job) -> Result<(), NotifyError> {
        warn!(
            job_id = %job.id,
            app = %job.app_name,
            created_by = %job.created_by,
            "job circuit break"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    JobCompleted(JobId),
    CircuitBreak(JobId),
}

/// Records notifications for assertions.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record(&self, n: Notification) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .map_err(|_| NotifyError("notifier lock poisoned".to_string()))?
            .push(n);
        Ok(())
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn job_completed(&self, job: &Job) -> Result<(), NotifyError> {
        self.record(Notification::JobCompleted(job.id))
    }

    async fn circuit_break(&self, job: &Job) -> Result<(), NotifyError> {
        self.record(Notification::CircuitBreak(job.id))
    }
}
