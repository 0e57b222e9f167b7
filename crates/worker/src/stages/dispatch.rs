//! Dispatch: render and publish one batch of pushes.
//!
//! The bucket variant carries its users; the range variant queries a
//! `seq_id` range of the token table and withholds the control group itself,
//! since no Batch Creation runs on that path.

use std::collections::BTreeSet;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, instrument, warn};

use herald_core::audience::extract_slice_control_group;
use herald_core::payload::{build_push, topic_for};
use herald_core::{Job, JobId, JobStatus, TemplateCatalog, User};
use herald_infra::TotalsDelta;

use super::{complete_if_done, page_seed, persist_control_group};
use crate::breaker::CircuitBreaker;
use crate::error::StageError;
use crate::messages::{Envelope, decompress_users};
use crate::paused::PausedQueue;
use crate::services::Services;

/// What happened to one dispatch unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The job expired or was stopped.
    Dropped,
    /// The job is paused or circuit-broken; the unit waits for a resume.
    Parked,
    Delivered { published: usize, failed: usize },
}

/// Deliver a bucket of users.
#[instrument(skip(services, envelope, compressed_users), fields(job_id = %job_id), err)]
pub async fn run_bucket(
    services: &Services,
    envelope: &Envelope,
    job_id: JobId,
    compressed_users: &str,
) -> Result<DispatchOutcome, StageError> {
    let job = services.load_job(job_id).await?;
    if let Some(outcome) = gate(services, &job, envelope).await? {
        return Ok(outcome);
    }
    let result = match decompress_users(compressed_users) {
        Ok(users) => deliver(services, &job, users).await,
        Err(e) => Err(e),
    };
    on_failure(services, &job, result).await
}

/// Query and deliver the users of `[smallest_seq_id, biggest_seq_id)`.
#[instrument(skip(services, envelope), fields(job_id = %job_id, from = smallest_seq_id, to = biggest_seq_id), err)]
pub async fn run_range(
    services: &Services,
    envelope: &Envelope,
    job_id: JobId,
    smallest_seq_id: i64,
    biggest_seq_id: i64,
) -> Result<DispatchOutcome, StageError> {
    let job = services.load_job(job_id).await?;
    if let Some(outcome) = gate(services, &job, envelope).await? {
        return Ok(outcome);
    }
    let result = match range_users(services, &job, smallest_seq_id, biggest_seq_id).await {
        Ok(users) => deliver(services, &job, users).await,
        Err(e) => Err(e),
    };
    on_failure(services, &job, result).await
}

/// Token rows of the range, minus the control group.
async fn range_users(services: &Services, job: &Job, from: i64, to: i64) -> Result<Vec<User>, StageError> {
    let mut users = services
        .tokens
        .by_seq_range(&job.token_table(), &job.filters, from, to)
        .await?;
    if job.control_group > 0.0 && !users.is_empty() {
        let mut rng = StdRng::seed_from_u64(page_seed(job.id, from as u64));
        let withheld = extract_slice_control_group(&mut users, job.control_group, &mut rng);
        let ids: Vec<String> = withheld.into_iter().map(|u| u.user_id).collect();
        persist_control_group(services, job, &ids).await?;
    }
    services
        .repo
        .add_totals(
            job.id,
            TotalsDelta {
                users: users.len() as i64,
                ..TotalsDelta::default()
            },
        )
        .await?;
    Ok(users)
}

/// Expired, stopped, paused and broken jobs never reach delivery.
async fn gate(services: &Services, job: &Job, envelope: &Envelope) -> Result<Option<DispatchOutcome>, StageError> {
    if job.is_expired(Utc::now()) {
        debug!(job_id = %job.id, "job expired; batch dropped");
        return Ok(Some(DispatchOutcome::Dropped));
    }
    if job.status == JobStatus::Stopped {
        debug!(job_id = %job.id, "job stopped; batch dropped");
        return Ok(Some(DispatchOutcome::Dropped));
    }
    if job.status.parks_units() {
        let parked = PausedQueue::new(services.coord.clone(), job.id)
            .park(&envelope.to_json()?)
            .await?;
        info!(job_id = %job.id, status = job.status.as_str(), parked, "batch parked");
        return Ok(Some(DispatchOutcome::Parked));
    }
    Ok(None)
}

async fn on_failure(
    services: &Services,
    job: &Job,
    result: Result<DispatchOutcome, StageError>,
) -> Result<DispatchOutcome, StageError> {
    if result.is_err() {
        CircuitBreaker::new(services).record_failure_logged(job).await;
    }
    result
}

/// Render, publish and account for one batch.
///
/// Every template a user could receive is resolved before the first publish,
/// so a missing template fails the batch without partial sends. Individual
/// publish failures only reduce the delivered count.
pub(crate) async fn deliver(services: &Services, job: &Job, users: Vec<User>) -> Result<DispatchOutcome, StageError> {
    let names = job.template_names();
    let templates = services.repo.templates(job.app_id, &names).await?;
    let catalog = TemplateCatalog::build(&names, templates)?;

    let locales: BTreeSet<&str> = users.iter().map(|u| u.locale.as_str()).collect();
    for name in &names {
        for locale in &locales {
            catalog.for_locale(name, locale)?;
        }
    }

    let topic = topic_for(&services.config.topic_template, &job.app_name, job.service);
    let mut rng = StdRng::from_entropy();
    let now = Utc::now();
    let mut failed = 0usize;

    for user in &users {
        let name = catalog.pick_name(&mut rng)?;
        let message = catalog.for_locale(name, &user.locale)?.render(&job.context)?;
        let push = build_push(job, user, name, message, now, &mut rng);
        if let Err(e) = services.bus.publish(&topic, &push).await {
            failed += 1;
            warn!(job_id = %job.id, user_id = %user.user_id, error = %e, "publish failed");
        }
    }

    let published = users.len() - failed;
    if !users.is_empty() {
        let ratio = failed as f64 / users.len() as f64;
        if ratio > services.config.max_user_failure_in_batch {
            warn!(job_id = %job.id, failed, total = users.len(), "too many failed publishes in batch");
            CircuitBreaker::new(services).record_failure_logged(job).await;
        }
    }

    services.repo.record_batch(job.id, published as i64).await?;
    debug!(job_id = %job.id, published, failed, topic = %topic, "batch delivered");
    complete_if_done(services, job.id).await?;
    Ok(DispatchOutcome::Delivered { published, failed })
}
