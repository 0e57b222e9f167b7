//! Stream a filtered token table into a multipart CSV upload.
//!
//! Each unit uploads one keyset page as one part and records the part in the
//! job's upload tracker. The unit whose push completes the set of part
//! numbers finishes the upload and hands the job to CSV Split.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use herald_core::csv::{USER_IDS_HEADER, render_column};
use herald_core::{DomainError, JobId, JobStatus};
use herald_infra::tokens::TokenQuery;
use herald_infra::{CompletedPart, MultipartUpload, TagState};

use crate::error::StageError;
use crate::keys;
use crate::messages::StageMessage;
use crate::services::Services;

pub const STAGE: &str = "db_to_csv";

const TRACKER_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// What a DB-to-CSV unit ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    Skipped,
    Uploaded,
    Finalized,
}

#[instrument(skip(services, query, upload), fields(job_id = %job_id, part = part_number), err)]
pub async fn run(
    services: &Services,
    job_id: JobId,
    query: &TokenQuery,
    upload: &MultipartUpload,
    part_number: u32,
    total_parts: u32,
) -> Result<PartOutcome, StageError> {
    let job = services.load_job(job_id).await?;
    if job.status == JobStatus::Stopped {
        info!("job stopped; part skipped");
        return Ok(PartOutcome::Skipped);
    }

    let tracker = keys::uploaded_parts(job_id);
    let uploaded = parse_parts(&services.coord.lrange_all(&tracker).await?)?;
    if holds_every_part(&uploaded, total_parts) {
        // a previous finalizer failed after every part was in
        finalize(services, job_id, upload, total_parts).await?;
        return Ok(PartOutcome::Finalized);
    }
    if uploaded.iter().any(|p| p.part_number == part_number) {
        debug!("part already uploaded");
        return Ok(PartOutcome::Skipped);
    }

    let users = services
        .tokens
        .page(&query.table, &query.filters, query.after_seq_id, query.limit)
        .await?;
    let ids = claim_users(services, job_id, part_number, users.iter().map(|u| u.user_id.as_str())).await?;
    let header = (part_number == 1).then_some(USER_IDS_HEADER);
    let body = render_column(header, ids.iter().copied());

    let completed = services.blobs.upload_part(upload, part_number, body).await?;
    let entry = serde_json::to_string(&completed).map_err(|e| StageError::message(e.to_string()))?;
    let len = services.coord.rpush(&tracker, &entry).await?;
    services.coord.expire(&tracker, TRACKER_TTL).await?;
    debug!(rows = users.len(), users = ids.len(), uploaded = len, total_parts, "part uploaded");

    // a concurrent redelivery may have pushed a part twice
    if len >= u64::from(total_parts)
        && holds_every_part(&parse_parts(&services.coord.lrange_all(&tracker).await?)?, total_parts)
    {
        finalize(services, job_id, upload, total_parts).await?;
        return Ok(PartOutcome::Finalized);
    }
    Ok(PartOutcome::Uploaded)
}

/// Keep the ids of this page that no other part exported.
///
/// Every user id is claimed job-wide by the first part that writes it, so a
/// user with tokens on several pages appears in the CSV once. A retried part
/// keeps the ids it claimed before.
async fn claim_users<'a>(
    services: &Services,
    job_id: JobId,
    part_number: u32,
    ids: impl Iterator<Item = &'a str>,
) -> Result<Vec<&'a str>, StageError> {
    let key = keys::exported_users(job_id);
    let owner = part_number.to_string();
    let mut seen = HashSet::new();
    let mut claimed = Vec::new();
    for id in ids {
        if !seen.insert(id) {
            continue;
        }
        let ours = services.coord.hsetnx(&key, id, &owner).await?
            || services.coord.hget(&key, id).await?.as_deref() == Some(owner.as_str());
        if ours {
            claimed.push(id);
        }
    }
    services.coord.expire(&key, TRACKER_TTL).await?;
    Ok(claimed)
}

fn holds_every_part(parts: &[CompletedPart], total_parts: u32) -> bool {
    let distinct: HashSet<u32> = parts.iter().map(|p| p.part_number).collect();
    distinct.len() as u64 == u64::from(total_parts)
}

fn parse_parts(entries: &[String]) -> Result<Vec<CompletedPart>, StageError> {
    entries
        .iter()
        .map(|raw| {
            serde_json::from_str::<CompletedPart>(raw)
                .map_err(|e| StageError::from(DomainError::invariant(format!("corrupt upload tracker entry: {e}"))))
        })
        .collect()
}

async fn finalize(
    services: &Services,
    job_id: JobId,
    upload: &MultipartUpload,
    total_parts: u32,
) -> Result<(), StageError> {
    let tracker = keys::uploaded_parts(job_id);
    // a part uploaded twice is stored under its latest etag
    let latest: BTreeMap<u32, CompletedPart> = parse_parts(&services.coord.lrange_all(&tracker).await?)?
        .into_iter()
        .map(|p| (p.part_number, p))
        .collect();
    let parts: Vec<CompletedPart> = latest.into_values().collect();
    if parts.len() as u64 != u64::from(total_parts) {
        warn!(job_id = %job_id, parts = parts.len(), total_parts, "upload tracker is missing parts");
        return Err(DomainError::invariant("upload tracker does not hold every part").into());
    }

    services.blobs.complete_multipart(upload, &parts).await?;
    services.repo.set_csv_path(job_id, &upload.key).await?;
    services.enqueue(StageMessage::CsvSplit { job_id }).await?;

    if let Err(e) = services
        .repo
        .tag(job_id, STAGE, TagState::Success, &format!("uploaded {total_parts} parts"))
        .await
    {
        warn!(job_id = %job_id, error = %e, "failed to tag job");
    }
    services.coord.del(&tracker).await?;
    services.coord.del(&keys::exported_users(job_id)).await?;
    info!(job_id = %job_id, key = %upload.key, total_parts, "csv upload completed");
    Ok(())
}
