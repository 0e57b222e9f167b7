//! Per-job circuit breaker over failed dispatch batches.

use std::time::Duration;

use tracing::{info, warn};

use herald_core::{Job, JobStatus};

use crate::error::StageError;
use crate::keys;
use crate::services::Services;

/// Window of the failed-batches counter.
pub const FAILURE_WINDOW: Duration = Duration::from_secs(7 * 24 * 3600);

/// Guards the circuit-break notification against repeats.
pub const NOTIFY_WINDOW: Duration = Duration::from_secs(60);

pub struct CircuitBreaker<'a> {
    services: &'a Services,
}

impl<'a> CircuitBreaker<'a> {
    pub fn new(services: &'a Services) -> Self {
        Self { services }
    }

    /// Count one failed batch of `job`; returns whether the job is now broken.
    pub async fn record_failure(&self, job: &Job) -> Result<bool, StageError> {
        let failed = self
            .services
            .coord
            .incr_with_ttl(&keys::failed_batches(job.id), FAILURE_WINDOW)
            .await?;
        let total = job.total_batches.unwrap_or(0).max(1);
        let ratio = failed as f64 / total as f64;
        if ratio < self.services.config.max_batch_failure {
            return Ok(false);
        }

        self.services.repo.set_status(job.id, JobStatus::CircuitBreak).await?;
        warn!(job_id = %job.id, failed, total, "failure threshold crossed; job circuit broken");

        let first = self
            .services
            .coord
            .set_nx_ex(&keys::circuit_break(job.id), "1", NOTIFY_WINDOW)
            .await?;
        if first {
            self.services.notifier.circuit_break(job).await?;
            info!(job_id = %job.id, "circuit break notification sent");
        }
        Ok(true)
    }

    /// Like [`record_failure`](Self::record_failure) but never fails; used
    /// while another error is already being reported.
    pub async fn record_failure_logged(&self, job: &Job) {
        if let Err(e) = self.record_failure(job).await {
            warn!(job_id = %job.id, error = %e, "failed to record batch failure");
        }
    }
}
