//! Processed-page markers used to resume a re-executed job.

use std::sync::Arc;

use herald_core::JobId;
use herald_infra::{Coordination, CoordinationError};

use crate::keys;

#[derive(Clone)]
pub struct PageTracker {
    coord: Arc<dyn Coordination>,
    key: String,
}

impl PageTracker {
    pub fn new(coord: Arc<dyn Coordination>, job: JobId) -> Self {
        Self {
            coord,
            key: keys::processed_pages(job),
        }
    }

    /// A job is being re-executed once any of its pages was marked.
    pub async fn is_reexecution(&self) -> Result<bool, CoordinationError> {
        self.coord.exists(&self.key).await
    }

    pub async fn mark_processed(&self, page: u64) -> Result<(), CoordinationError> {
        self.coord.sadd(&self.key, &page.to_string()).await.map(|_| ())
    }

    pub async fn is_processed(&self, page: u64) -> Result<bool, CoordinationError> {
        self.coord.sismember(&self.key, &page.to_string()).await
    }

    /// Record that the timezone bucket `tz` of `page` was enqueued.
    pub async fn mark_bucket(&self, page: u64, tz: &str) -> Result<(), CoordinationError> {
        self.coord.sadd(&self.key, &bucket_member(page, tz)).await.map(|_| ())
    }

    pub async fn is_bucket_processed(&self, page: u64, tz: &str) -> Result<bool, CoordinationError> {
        self.coord.sismember(&self.key, &bucket_member(page, tz)).await
    }
}

fn bucket_member(page: u64, tz: &str) -> String {
    format!("{page}/{tz}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_infra::InMemoryCoordination;

    #[tokio::test]
    async fn first_mark_turns_job_into_reexecution() {
        let tracker = PageTracker::new(Arc::new(InMemoryCoordination::new()), JobId::new());
        assert!(!tracker.is_reexecution().await.unwrap());

        tracker.mark_processed(3).await.unwrap();
        tracker.mark_processed(3).await.unwrap();

        assert!(tracker.is_reexecution().await.unwrap());
        assert!(tracker.is_processed(3).await.unwrap());
        assert!(!tracker.is_processed(4).await.unwrap());
    }

    #[tokio::test]
    async fn bucket_marks_do_not_finish_the_page() {
        let tracker = PageTracker::new(Arc::new(InMemoryCoordination::new()), JobId::new());
        tracker.mark_bucket(7, "+0100").await.unwrap();

        assert!(tracker.is_reexecution().await.unwrap());
        assert!(tracker.is_bucket_processed(7, "+0100").await.unwrap());
        assert!(!tracker.is_bucket_processed(7, "-0500").await.unwrap());
        assert!(!tracker.is_processed(7).await.unwrap());
    }
}
