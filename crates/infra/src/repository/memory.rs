//! In-memory job repository for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use herald_core::{AppId, Job, JobId, JobStatus, Template};

use super::{JobRepository, JobTag, StoreError, TagState, TotalsDelta};

#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
    templates: RwLock<Vec<(AppId, Template)>>,
    tags: RwLock<HashMap<JobId, Vec<JobTag>>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("repository lock poisoned".to_string())
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_template(&self, app_id: AppId, template: Template) -> Result<(), StoreError> {
        self.templates.write().map_err(poisoned)?.push((app_id, template));
        Ok(())
    }

    /// Tags written for `id`, oldest first.
    pub fn tags(&self, id: JobId) -> Vec<JobTag> {
        self.tags
            .read()
            .ok()
            .and_then(|t| t.get(&id).cloned())
            .unwrap_or_default()
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut Job)) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        f(job);
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().map_err(poisoned)?.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().map_err(poisoned)?.get(&id).cloned())
    }

    async fn templates(&self, app_id: AppId, names: &[&str]) -> Result<Vec<Template>, StoreError> {
        Ok(self
            .templates
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|(app, t)| *app == app_id && names.contains(&t.name.as_str()))
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn add_totals(&self, id: JobId, delta: TotalsDelta) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.total_batches = Some(job.total_batches.unwrap_or(0) + delta.batches);
            job.total_users += delta.users;
            job.total_tokens += delta.tokens;
        })
    }

    async fn set_range_totals(&self, id: JobId, total_batches: i64, total_tokens: i64) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.total_batches = Some(total_batches);
            job.total_tokens = total_tokens;
        })
    }

    async fn record_batch(&self, id: JobId, completed_tokens: i64) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.completed_tokens += completed_tokens;
            job.completed_batches += 1;
        })
    }

    async fn mark_batches_ready(&self, id: JobId) -> Result<(), StoreError> {
        self.update(id, |job| job.batches_ready = true)
    }

    async fn try_complete(&self, id: JobId, at_nanos: i64) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let done = job.completed_at == 0
            && job.batches_ready
            && job.total_batches.is_some_and(|total| job.completed_batches >= total);
        if done {
            job.completed_at = at_nanos;
            job.updated_at = Utc::now();
        }
        Ok(done)
    }

    async fn set_status(&self, id: JobId, status: JobStatus) -> Result<(), StoreError> {
        self.update(id, |job| job.status = status)
    }

    async fn set_csv_path(&self, id: JobId, path: &str) -> Result<(), StoreError> {
        self.update(id, |job| job.csv_path = path.to_string())
    }

    async fn set_control_group_csv_path(&self, id: JobId, path: &str) -> Result<(), StoreError> {
        self.update(id, |job| job.control_group_csv_path = path.to_string())
    }

    async fn tag(&self, id: JobId, stage: &str, state: TagState, message: &str) -> Result<(), StoreError> {
        self.tags.write().map_err(poisoned)?.entry(id).or_default().push(JobTag {
            stage: stage.to_string(),
            state,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::Service;

    fn job() -> Job {
        Job::new(AppId::new(), "game", Service::Gcm, "welcome").with_csv_path("a.csv")
    }

    #[tokio::test]
    async fn totals_accumulate() {
        let repo = InMemoryJobRepository::new();
        let job = job();
        repo.insert(&job).await.unwrap();

        let delta = TotalsDelta { batches: 2, users: 10, tokens: 12 };
        repo.add_totals(job.id, delta).await.unwrap();
        repo.add_totals(job.id, delta).await.unwrap();

        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.total_batches, Some(4));
        assert_eq!(stored.total_users, 20);
        assert_eq!(stored.total_tokens, 24);
    }

    #[tokio::test]
    async fn completion_requires_ready_flag_and_all_batches() {
        let repo = InMemoryJobRepository::new();
        let job = job();
        repo.insert(&job).await.unwrap();
        repo.add_totals(job.id, TotalsDelta { batches: 2, ..Default::default() }).await.unwrap();

        repo.record_batch(job.id, 5).await.unwrap();
        repo.record_batch(job.id, 5).await.unwrap();
        assert!(!repo.try_complete(job.id, 1).await.unwrap());

        repo.mark_batches_ready(job.id).await.unwrap();
        assert!(repo.try_complete(job.id, 7).await.unwrap());
        assert!(!repo.try_complete(job.id, 8).await.unwrap());

        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.completed_at, 7);
        assert_eq!(stored.completed_tokens, 10);
    }

    #[tokio::test]
    async fn updates_on_missing_job_fail() {
        let repo = InMemoryJobRepository::new();
        assert!(matches!(
            repo.set_status(JobId::new(), JobStatus::Paused).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
