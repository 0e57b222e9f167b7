//! Job entry points and executor wiring.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{info, instrument};

use herald_core::{DomainError, Job, JobId, JobSource, JobStatus};
use herald_infra::queue::{ExecutorConfig, QueueConfig, QueueExecutor, QueueExecutorHandle, QueueStore, QueueStoreError};
use herald_infra::tokens::TokenQuery;

use crate::config::FilterPipeline;
use crate::error::StageError;
use crate::handler::StageHandler;
use crate::keys;
use crate::messages::{QueueName, StageMessage};
use crate::services::Services;
use crate::stages::{complete_if_done, discover_pages, now_nanos};

/// Owns the pipeline's services; every stage runs through it.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    services: Services,
}

impl Orchestrator {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Validate and store `job`, then start the pipeline for its audience.
    #[instrument(skip(self, job), fields(job_id = %job.id, app = %job.app_name), err)]
    pub async fn create_job(&self, job: Job) -> Result<JobId, StageError> {
        job.validate()?;
        self.services.repo.insert(&job).await?;

        match job.source() {
            JobSource::Csv(_) => {
                self.schedule(StageMessage::CsvSplit { job_id: job.id }, start_at(&job))
                    .await?;
            }
            JobSource::Filters(_) => match self.services.config.filter_pipeline {
                FilterPipeline::Csv => {
                    self.start_db_to_csv(&job).await?;
                }
                FilterPipeline::Pages => {
                    self.schedule(StageMessage::CreateBatchesFromFilters { job_id: job.id }, start_at(&job))
                        .await?;
                }
                FilterPipeline::Direct => {
                    self.create_direct_batches(&job).await?;
                }
            },
        }
        info!("job created");
        Ok(job.id)
    }

    /// Fan a filter job out into DB-to-CSV units, one per keyset page.
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn start_db_to_csv(&self, job: &Job) -> Result<u32, StageError> {
        let services = &self.services;
        let table = job.token_table();
        let count = services.tokens.count(&table, &job.filters).await?;
        if count == 0 {
            return Err(DomainError::validation("no users matching the filters").into());
        }

        let page_size = job.page_size(services.config.db_page_size);
        let cursors = discover_pages(services, &table, &job.filters, page_size).await?;
        let total_parts = cursors.len() as u32;
        let key = format!("{}/{}.csv", services.config.csv_folder, job.id);
        let upload = services.blobs.start_multipart(&key).await?;

        let at = start_at(job);
        for (idx, after) in cursors.into_iter().enumerate() {
            let message = StageMessage::DbToCsv {
                job_id: job.id,
                query: TokenQuery {
                    table: table.clone(),
                    filters: job.filters.clone(),
                    after_seq_id: after,
                    limit: page_size,
                },
                upload: upload.clone(),
                part_number: idx as u32 + 1,
                total_parts,
            };
            self.schedule(message, at).await?;
        }
        info!(users = count, total_parts, key = %key, "db to csv started");
        Ok(total_parts)
    }

    /// Schedule fixed `seq_id` ranges covering the whole token table.
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn create_direct_batches(&self, job: &Job) -> Result<i64, StageError> {
        let services = &self.services;
        let table = job.token_table();
        let Some(max_seq_id) = services.tokens.max_seq_id(&table).await? else {
            return Err(DomainError::validation("no users matching the filters").into());
        };

        let size = services.config.direct_batch_size;
        let ranges: Vec<(i64, i64)> = (0..=max_seq_id / size).map(|i| (i * size, i * size + size)).collect();
        let total_batches = ranges.len() as i64;
        let estimated = services.tokens.estimated_rows(&table).await?.max(1);
        services.repo.set_range_totals(job.id, total_batches, estimated).await?;

        let at = start_at(job);
        for (from, to) in ranges {
            let message = StageMessage::DirectDispatch {
                job_id: job.id,
                smallest_seq_id: from,
                biggest_seq_id: to,
            };
            self.schedule(message, at).await?;
        }
        services.repo.mark_batches_ready(job.id).await?;
        complete_if_done(services, job.id).await?;
        info!(total_batches, estimated_tokens = estimated, "direct batches scheduled");
        Ok(total_batches)
    }

    pub async fn pause_job(&self, id: JobId) -> Result<(), StageError> {
        self.services.repo.set_status(id, JobStatus::Paused).await?;
        info!(job_id = %id, "job paused");
        Ok(())
    }

    pub async fn stop_job(&self, id: JobId) -> Result<(), StageError> {
        self.services.repo.set_status(id, JobStatus::Stopped).await?;
        info!(job_id = %id, "job stopped");
        Ok(())
    }

    /// Run a paused or circuit-broken job again and replay its parked units.
    pub async fn resume_job(&self, id: JobId) -> Result<(), StageError> {
        let services = &self.services;
        services.repo.set_status(id, JobStatus::Running).await?;
        services.coord.del(&keys::failed_batches(id)).await?;
        services.coord.del(&keys::circuit_break(id)).await?;
        services.enqueue(StageMessage::ResumeJob { job_id: id }).await?;
        info!(job_id = %id, "job resumed");
        Ok(())
    }

    /// Reachability of the repository, the token store and coordination.
    pub async fn health(&self) -> Result<(), StageError> {
        self.services.repo.ping().await?;
        self.services.tokens.ping().await?;
        self.services.coord.ping().await?;
        Ok(())
    }

    /// Executor with the stage handler registered on every queue.
    pub fn executor(&self) -> QueueExecutor<Arc<dyn QueueStore>> {
        let mut executor = QueueExecutor::new(Arc::new(self.services.queue.clone()));
        let handler = Arc::new(StageHandler::new(self.services.clone()));
        for queue in QueueName::ALL {
            executor.register_handler(queue.as_str(), handler.clone());
        }
        executor
    }

    /// Start worker pools sized from the configuration.
    pub fn spawn(&self) -> QueueExecutorHandle {
        let config = &self.services.config;
        let mut executor_config = ExecutorConfig::default()
            .with_name("herald-worker")
            .with_poll_interval(config.poll_interval);
        for queue in QueueName::ALL {
            executor_config = executor_config.with_queue(QueueConfig::new(queue.as_str(), config.queue(queue).concurrency));
        }
        self.executor().spawn(executor_config)
    }

    /// Process every ready unit; used by tests and one-shot runs.
    pub async fn run_until_idle(&self) -> Result<usize, QueueStoreError> {
        self.executor().run_until_idle().await
    }

    async fn schedule(&self, message: StageMessage, at: Option<DateTime<Utc>>) -> Result<(), StageError> {
        match at {
            Some(at) => self.services.enqueue_at(message, at).await?,
            None => self.services.enqueue(message).await?,
        };
        Ok(())
    }
}

/// Delay for jobs starting in the future; localized jobs are timed per
/// timezone bucket instead.
fn start_at(job: &Job) -> Option<DateTime<Utc>> {
    if job.localized || job.starts_at <= now_nanos() {
        return None;
    }
    Some(Utc.timestamp_nanos(job.starts_at))
}
