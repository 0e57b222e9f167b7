//! Queue boundary: decode a unit, run its stage, classify the outcome.

use async_trait::async_trait;
use tracing::{Instrument, error, info_span, warn};

use herald_infra::TagState;
use herald_infra::queue::{QueuedUnit, UnitHandler, UnitResult};

use crate::error::{StageError, StageErrorKind};
use crate::messages::{Envelope, StageMessage};
use crate::services::Services;
use crate::stages::{batch_creation, csv_split, db_to_csv, dispatch, job_completed, resume};

/// Runs every stage; registered once per queue.
#[derive(Debug, Clone)]
pub struct StageHandler {
    services: Services,
}

impl StageHandler {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Run the stage of `envelope`.
    pub async fn run(&self, envelope: &Envelope) -> Result<(), StageError> {
        let services = &self.services;
        match &envelope.message {
            StageMessage::CsvSplit { job_id } => {
                let parts = csv_split::run(services, *job_id).await?;
                self.tag_success(envelope, &format!("split into {parts} parts")).await;
            }
            StageMessage::DbToCsv {
                job_id,
                query,
                upload,
                part_number,
                total_parts,
            } => {
                db_to_csv::run(services, *job_id, query, upload, *part_number, *total_parts).await?;
            }
            StageMessage::CreateBatches(part) => {
                let totals = batch_creation::from_csv(services, part).await?;
                self.tag_success(
                    envelope,
                    &format!("part {} scheduled {} batches", part.part, totals.batches),
                )
                .await;
            }
            StageMessage::CreateBatchesFromFilters { job_id } => {
                let totals = batch_creation::from_filters(services, *job_id).await?;
                self.tag_success(envelope, &format!("scheduled {} batches", totals.batches))
                    .await;
            }
            StageMessage::Dispatch {
                job_id,
                compressed_users,
                ..
            } => {
                dispatch::run_bucket(services, envelope, *job_id, compressed_users).await?;
            }
            StageMessage::DirectDispatch {
                job_id,
                smallest_seq_id,
                biggest_seq_id,
            } => {
                dispatch::run_range(services, envelope, *job_id, *smallest_seq_id, *biggest_seq_id).await?;
            }
            StageMessage::JobCompleted { job_id } => {
                job_completed::run(services, *job_id).await?;
                self.tag_success(envelope, "notification sent").await;
            }
            StageMessage::ResumeJob { job_id } => {
                let resumed = resume::run(services, *job_id).await?;
                self.tag_success(envelope, &format!("resumed {resumed} units")).await;
            }
        }
        Ok(())
    }

    async fn tag_success(&self, envelope: &Envelope, message: &str) {
        self.tag(envelope, TagState::Success, message).await;
    }

    async fn tag(&self, envelope: &Envelope, state: TagState, message: &str) {
        let job_id = envelope.message.job_id();
        let stage = envelope.message.queue();
        if let Err(e) = self.services.repo.tag(job_id, stage.as_str(), state, message).await {
            warn!(job_id = %job_id, stage = %stage, error = %e, "failed to tag job");
        }
    }
}

#[async_trait]
impl UnitHandler for StageHandler {
    async fn handle(&self, unit: &QueuedUnit) -> UnitResult {
        let envelope = match Envelope::from_value(&unit.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(unit_id = %unit.id, queue = %unit.queue, error = %e, "undecodable unit");
                return UnitResult::Fatal(e.to_string());
            }
        };
        let stage = envelope.message.queue();
        if stage.as_str() != unit.queue {
            let reason = format!("{stage} message on queue {}", unit.queue);
            error!(unit_id = %unit.id, reason = %reason, "unit on the wrong queue");
            return UnitResult::Fatal(reason);
        }

        let span = info_span!("stage", stage = %stage, job_id = %envelope.message.job_id(), attempt = unit.attempt);
        match self.run(&envelope).instrument(span).await {
            Ok(()) => UnitResult::Success,
            Err(e) => {
                let kind = e.kind();
                warn!(unit_id = %unit.id, stage = %stage, kind = ?kind, error = %e, "stage failed");
                self.tag(&envelope, TagState::Fail, &e.to_string()).await;
                match kind {
                    StageErrorKind::Fatal => UnitResult::Fatal(e.to_string()),
                    StageErrorKind::Retryable => UnitResult::Retry(e.to_string()),
                }
            }
        }
    }
}
