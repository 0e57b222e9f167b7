//! Job-Completed: export the control group and notify operators.

use tracing::{info, instrument};

use herald_core::JobId;
use herald_core::csv::{CONTROL_GROUP_HEADER, render_column};

use crate::error::StageError;
use crate::keys;
use crate::services::Services;

/// Write the withheld users of a job to its control-group CSV.
///
/// Returns how many ids were exported. Ids withheld twice (a re-executed
/// page) are written once.
pub async fn flush_control_group(services: &Services, job_id: JobId, path: &str) -> Result<usize, StageError> {
    let key = keys::control_group(job_id);
    let mut ids = services.coord.lrange_all(&key).await?;
    if ids.is_empty() || path.is_empty() {
        return Ok(0);
    }
    ids.sort();
    ids.dedup();

    let body = render_column(Some(CONTROL_GROUP_HEADER), ids.iter().map(String::as_str));
    services.blobs.put(path, body).await?;
    services.coord.del(&key).await?;
    Ok(ids.len())
}

#[instrument(skip(services), fields(job_id = %job_id), err)]
pub async fn run(services: &Services, job_id: JobId) -> Result<(), StageError> {
    let job = services.load_job(job_id).await?;

    let exported = flush_control_group(services, job_id, &job.control_group_csv_path).await?;
    if exported > 0 {
        info!(path = %job.control_group_csv_path, users = exported, "control group exported");
    }

    services.notifier.job_completed(&job).await?;
    info!(
        completed_tokens = job.completed_tokens,
        total_tokens = job.total_tokens,
        "completion notification sent"
    );
    Ok(())
}
