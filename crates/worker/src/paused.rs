//! Dispatch units parked while a job is paused or circuit-broken.

use std::sync::Arc;
use std::time::Duration;

use herald_core::JobId;
use herald_infra::{Coordination, CoordinationError};

use crate::keys;

/// Parked units outlive a pause by at most this long.
pub const PAUSED_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// FIFO list of serialized envelopes.
#[derive(Clone)]
pub struct PausedQueue {
    coord: Arc<dyn Coordination>,
    key: String,
}

impl PausedQueue {
    pub fn new(coord: Arc<dyn Coordination>, job: JobId) -> Self {
        Self {
            coord,
            key: keys::paused_jobs(job),
        }
    }

    pub async fn park(&self, raw: &str) -> Result<u64, CoordinationError> {
        let len = self.coord.rpush(&self.key, raw).await?;
        self.coord.expire(&self.key, PAUSED_TTL).await?;
        Ok(len)
    }

    /// Oldest parked unit, `None` once drained.
    pub async fn pop(&self) -> Result<Option<String>, CoordinationError> {
        self.coord.lpop(&self.key).await
    }

    pub async fn len(&self) -> Result<u64, CoordinationError> {
        self.coord.llen(&self.key).await
    }

    pub async fn clear(&self) -> Result<(), CoordinationError> {
        self.coord.del(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_infra::InMemoryCoordination;

    #[tokio::test]
    async fn pops_in_park_order() {
        let coord = Arc::new(InMemoryCoordination::new());
        let job = JobId::new();
        let queue = PausedQueue::new(coord.clone(), job);

        queue.park("a").await.unwrap();
        queue.park("b").await.unwrap();
        assert!(coord.ttl(&keys::paused_jobs(job)).is_some());

        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("a"));
        assert_eq!(queue.pop().await.unwrap().as_deref(), Some("b"));
        assert_eq!(queue.pop().await.unwrap(), None);
    }
}
