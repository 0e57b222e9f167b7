//! Partition an uploaded CSV into byte ranges, one Batch Creation unit each.

use tracing::{info, instrument};

use herald_core::csv::{check_header, plan_parts};
use herald_core::{JobId, JobStatus};

use crate::error::StageError;
use crate::messages::{BatchPart, StageMessage};
use crate::services::Services;

/// Bytes fetched to check the header and learn the object size.
const HEAD_LEN: u64 = 8;

#[instrument(skip(services), fields(job_id = %job_id), err)]
pub async fn run(services: &Services, job_id: JobId) -> Result<u64, StageError> {
    let job = services.load_job(job_id).await?;
    if job.status == JobStatus::Stopped {
        info!("job stopped; csv split skipped");
        return Ok(0);
    }

    let head = services.blobs.read_range(&job.csv_path, 0, HEAD_LEN).await?;
    check_header(&head.bytes)?;

    let parts = plan_parts(head.total_size, services.config.csv_part_size);
    let total_parts = parts.len() as u64;
    for range in parts {
        services
            .enqueue(StageMessage::CreateBatches(BatchPart {
                job_id,
                start: range.start,
                size: range.size,
                total_parts,
                total_size: head.total_size,
                part: range.part,
            }))
            .await?;
    }

    info!(total_size = head.total_size, total_parts, "csv split into parts");
    Ok(total_parts)
}
