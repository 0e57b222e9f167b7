//! Hierarchical stage progress, kept in coordination hashes for operators.
//!
//! A stage lives in hash `{job}-{key}` with `description`, `max` and
//! `current` fields, and is listed in the job's index hash `{job}` under its
//! key. Sub-stage keys are derived from insertion order: the second child of
//! stage `1` is `1.2`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use herald_core::JobId;
use herald_infra::{Coordination, CoordinationError};

use crate::keys;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StageStatusError {
    #[error("can't create a stage with 0 max progress")]
    ZeroMax,

    #[error("stage is already finished")]
    Finished,

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

pub struct StageStatus {
    coord: Arc<dyn Coordination>,
    job: JobId,
    key: String,
    max: u64,
    completed: AtomicBool,
    children: AtomicUsize,
}

impl std::fmt::Debug for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageStatus")
            .field("job", &self.job)
            .field("key", &self.key)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl StageStatus {
    pub async fn new(
        coord: Arc<dyn Coordination>,
        job: JobId,
        key: impl Into<String>,
        description: &str,
        max: u64,
    ) -> Result<Self, StageStatusError> {
        if max == 0 {
            return Err(StageStatusError::ZeroMax);
        }
        let key = key.into();
        let hash = keys::stage(job, &key);
        coord.hset(&hash, "description", description).await?;
        coord.hset(&keys::stage_index(job), &key, &hash).await?;
        coord.hset(&hash, "max", &max.to_string()).await?;
        coord.hset(&hash, "current", "0").await?;

        Ok(Self {
            coord,
            job,
            key,
            max,
            completed: AtomicBool::new(false),
            children: AtomicUsize::new(0),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Open the next child stage.
    pub async fn new_sub_stage(&self, description: &str, max: u64) -> Result<StageStatus, StageStatusError> {
        if max == 0 {
            return Err(StageStatusError::ZeroMax);
        }
        let index = self.children.fetch_add(1, Ordering::SeqCst) + 1;
        StageStatus::new(
            self.coord.clone(),
            self.job,
            format!("{}.{index}", self.key),
            description,
            max,
        )
        .await
    }

    pub async fn incr_progress(&self) -> Result<u64, StageStatusError> {
        if self.is_completed() {
            return Err(StageStatusError::Finished);
        }
        let current = self
            .coord
            .hincrby(&keys::stage(self.job, &self.key), "current", 1)
            .await?;
        let current = u64::try_from(current).unwrap_or(0);
        if current >= self.max {
            self.completed.store(true, Ordering::SeqCst);
        }
        Ok(current)
    }
}
