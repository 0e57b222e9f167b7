//! Batch Creation: turn an audience into Dispatch units.
//!
//! The CSV variant handles one byte-range part of the job's CSV; the filters
//! variant pages the filtered token table directly. Both share the page pool
//! in [`super::process_pages`].

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, instrument, warn};

use herald_core::audience::{check_control_group, control_group_size, extract_slice_control_group};
use herald_core::csv::{PartRange, ids_in_range};
use herald_core::{DomainError, Job, JobId, JobStatus};

use super::{
    PART_PAGE_STRIDE, Page, PageContext, PageSource, PageTotals, complete_if_done, discover_pages, page_seed,
    persist_control_group, process_pages,
};
use crate::error::StageError;
use crate::keys;
use crate::messages::BatchPart;
use crate::pages::PageTracker;
use crate::services::Services;
use crate::stage_status::StageStatus;

/// Stage index key of the filters variant.
const FILTERS_STAGE_KEY: &str = "1";

/// Create the batches of one CSV part.
#[instrument(skip(services, part), fields(job_id = %part.job_id, part = part.part), err)]
pub async fn from_csv(services: &Services, part: &BatchPart) -> Result<PageTotals, StageError> {
    let job = services.load_job(part.job_id).await?;
    if job.status == JobStatus::Stopped {
        info!("job stopped; part skipped");
        return Ok(PageTotals::default());
    }

    let range = PartRange {
        part: part.part,
        start: part.start,
        size: part.size,
    };
    let (from, to) = range.read_window(part.total_size);
    let chunk = services.blobs.read_range(&job.csv_path, from, to).await?;
    let mut ids = ids_in_range(&chunk.bytes, from, range.start, range.end());
    let mut seen = BTreeSet::new();
    ids.retain(|id| seen.insert(id.clone()));

    if job.control_group > 0.0 && !ids.is_empty() {
        let mut rng = StdRng::seed_from_u64(page_seed(job.id, part.part * PART_PAGE_STRIDE));
        let withheld = extract_slice_control_group(&mut ids, job.control_group, &mut rng);
        persist_control_group(services, &job, &withheld).await?;
    }

    let page_size = job.page_size(services.config.db_page_size) as usize;
    let pages: Vec<Page> = ids
        .chunks(page_size)
        .enumerate()
        .map(|(idx, chunk)| Page {
            number: part.part * PART_PAGE_STRIDE + idx as u64,
            source: PageSource::Ids(chunk.to_vec()),
        })
        .collect();
    debug!(ids = ids.len(), pages = pages.len(), "part read");

    let totals = run_pages(services, job, pages, None, false).await?;
    finish_part(services, part).await?;
    Ok(totals)
}

/// Record `part` as created; the part completing the set marks the job ready.
async fn finish_part(services: &Services, part: &BatchPart) -> Result<(), StageError> {
    let key = keys::created_parts(part.job_id);
    let len = services.coord.rpush(&key, &part.part.to_string()).await?;
    if len < part.total_parts {
        return Ok(());
    }
    // redelivered parts push twice, so count distinct entries
    let distinct: BTreeSet<String> = services.coord.lrange_all(&key).await?.into_iter().collect();
    if (distinct.len() as u64) < part.total_parts {
        return Ok(());
    }
    services.repo.mark_batches_ready(part.job_id).await?;
    info!(job_id = %part.job_id, total_parts = part.total_parts, "every part created");
    complete_if_done(services, part.job_id).await?;
    Ok(())
}

/// Create every batch of a filter job from its token table.
#[instrument(skip(services), fields(job_id = %job_id), err)]
pub async fn from_filters(services: &Services, job_id: JobId) -> Result<PageTotals, StageError> {
    let job = services.load_job(job_id).await?;
    if job.status == JobStatus::Stopped {
        info!("job stopped; batch creation skipped");
        return Ok(PageTotals::default());
    }

    let table = job.token_table();
    let count = services.tokens.count(&table, &job.filters).await?;
    if count == 0 {
        return Err(DomainError::validation("no users matching the filters").into());
    }
    let audience = count as usize;
    check_control_group(control_group_size(audience, job.control_group), audience)?;

    let page_size = job.page_size(services.config.db_page_size);
    let cursors = discover_pages(services, &table, &job.filters, page_size).await?;
    let pages: Vec<Page> = cursors
        .into_iter()
        .enumerate()
        .map(|(idx, after)| Page {
            number: idx as u64,
            source: PageSource::Keyset { after, limit: page_size },
        })
        .collect();
    info!(users = count, pages = pages.len(), "pages discovered");

    let root = StageStatus::new(
        services.coord.clone(),
        job_id,
        FILTERS_STAGE_KEY,
        "create batches from filters",
        1,
    )
    .await;
    let status = match &root {
        Ok(root) if !pages.is_empty() => match root.new_sub_stage("processing pages", pages.len() as u64).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                warn!(error = %e, "failed to open page stage");
                None
            }
        },
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "failed to open stage status");
            None
        }
    };

    let totals = run_pages(services, job, pages, status, true).await?;
    if let Ok(root) = &root {
        if let Err(e) = root.incr_progress().await {
            warn!(error = %e, "failed to report stage progress");
        }
    }
    services.repo.mark_batches_ready(job_id).await?;
    complete_if_done(services, job_id).await?;
    Ok(totals)
}

async fn run_pages(
    services: &Services,
    job: Job,
    pages: Vec<Page>,
    status: Option<StageStatus>,
    extract_control_group: bool,
) -> Result<PageTotals, StageError> {
    let tracker = PageTracker::new(services.coord.clone(), job.id);
    let reexecution = tracker.is_reexecution().await?;
    let job_id = job.id;
    let ctx = Arc::new(PageContext {
        services: services.clone(),
        job,
        tracker,
        reexecution,
        extract_control_group,
        status,
    });

    let (totals, error) = process_pages(ctx, pages, services.config.page_processing_concurrency).await;
    let delta = totals.into();
    if totals != PageTotals::default() {
        services.repo.add_totals(job_id, delta).await?;
    }
    info!(
        job_id = %job_id,
        batches = totals.batches,
        users = totals.users,
        tokens = totals.tokens,
        reexecution,
        "batches scheduled"
    );
    match error {
        Some(e) => Err(e),
        None => Ok(totals),
    }
}
