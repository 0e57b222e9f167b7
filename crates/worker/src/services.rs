//! Connections shared by every stage handler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use herald_core::{Job, JobId};
use herald_infra::queue::{QueueStore, QueuedUnit, UnitId};
use herald_infra::{BlobStore, Coordination, JobRepository, Notifier, PushBus, TokenStore};

use crate::config::WorkerConfig;
use crate::error::StageError;
use crate::messages::{Envelope, StageMessage};

/// Every adapter the pipeline talks to, injected once at startup.
#[derive(Clone)]
pub struct Services {
    pub repo: Arc<dyn JobRepository>,
    pub tokens: Arc<dyn TokenStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub bus: Arc<dyn PushBus>,
    pub coord: Arc<dyn Coordination>,
    pub queue: Arc<dyn QueueStore>,
    pub notifier: Arc<dyn Notifier>,
    pub config: Arc<WorkerConfig>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Services {
    /// Enqueue `message` for immediate processing.
    pub async fn enqueue(&self, message: StageMessage) -> Result<UnitId, StageError> {
        self.push(self.unit(&message)?).await
    }

    /// Enqueue `message` to become ready at `at`.
    pub async fn enqueue_at(&self, message: StageMessage, at: DateTime<Utc>) -> Result<UnitId, StageError> {
        self.push(self.unit(&message)?.scheduled_at(at)).await
    }

    /// Enqueue `message` to become ready after `delay`.
    pub async fn enqueue_in(&self, message: StageMessage, delay: Duration) -> Result<UnitId, StageError> {
        self.push(self.unit(&message)?.scheduled_in(delay)).await
    }

    /// Re-enqueue an already encoded envelope.
    pub async fn enqueue_envelope(&self, envelope: &Envelope) -> Result<UnitId, StageError> {
        let queue = envelope.message.queue();
        let unit = QueuedUnit::new(queue.as_str(), envelope.to_value()?)
            .with_retry_policy(self.config.retry_policy(queue));
        self.push(unit).await
    }

    fn unit(&self, message: &StageMessage) -> Result<QueuedUnit, StageError> {
        let queue = message.queue();
        let payload = Envelope::new(message.clone()).to_value()?;
        Ok(QueuedUnit::new(queue.as_str(), payload).with_retry_policy(self.config.retry_policy(queue)))
    }

    async fn push(&self, unit: QueuedUnit) -> Result<UnitId, StageError> {
        let queue = unit.queue.clone();
        let id = self.queue.enqueue(unit).await?;
        debug!(unit_id = %id, queue = %queue, "unit enqueued");
        Ok(id)
    }

    /// Load a job, failing when the row is gone.
    pub async fn load_job(&self, id: JobId) -> Result<Job, StageError> {
        self.repo.get(id).await?.ok_or(StageError::JobNotFound(id))
    }
}
