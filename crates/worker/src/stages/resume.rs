//! Resume: replay parked dispatch units once a job runs again.

use tracing::{info, instrument, warn};

use herald_core::{JobId, JobStatus};

use crate::error::StageError;
use crate::messages::Envelope;
use crate::paused::PausedQueue;
use crate::services::Services;

/// Drain the job's paused queue into the dispatch queues, oldest first.
///
/// Returns how many units were re-enqueued. A stopped job has its parked
/// units discarded instead.
#[instrument(skip(services), fields(job_id = %job_id), err)]
pub async fn run(services: &Services, job_id: JobId) -> Result<usize, StageError> {
    let job = services.load_job(job_id).await?;
    let paused = PausedQueue::new(services.coord.clone(), job_id);

    if job.status == JobStatus::Stopped {
        paused.clear().await?;
        info!("job stopped; parked units discarded");
        return Ok(0);
    }

    let mut resumed = 0;
    while let Some(raw) = paused.pop().await? {
        match Envelope::from_json(&raw) {
            Ok(envelope) => {
                if let Err(e) = services.enqueue_envelope(&envelope).await {
                    paused.park(&raw).await?;
                    return Err(e);
                }
                resumed += 1;
            }
            Err(e) => warn!(error = %e, "dropping undecodable parked unit"),
        }
    }

    info!(resumed, "parked units re-enqueued");
    Ok(resumed)
}
