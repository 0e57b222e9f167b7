//! Stage handlers and the page machinery they share.
//!
//! Batch Creation turns an audience into pages, and each page into one
//! Dispatch unit per timezone bucket. Pages run on a bounded pool of
//! `page_processing_concurrency` tasks draining a channel; an aggregator task
//! sums what every page scheduled so the job totals are incremented once.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use herald_core::audience::{bucket_by_tz, control_group_share, localized_send_at, withhold};
use herald_core::{Job, JobId, User};
use herald_infra::TotalsDelta;

use crate::error::StageError;
use crate::keys;
use crate::messages::StageMessage;
use crate::pages::PageTracker;
use crate::services::Services;
use crate::stage_status::StageStatus;

pub mod batch_creation;
pub mod csv_split;
pub mod db_to_csv;
pub mod dispatch;
pub mod job_completed;
pub mod resume;

/// Offset between the page numbers of consecutive CSV parts.
pub const PART_PAGE_STRIDE: u64 = 1_000_000;

pub(crate) fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Deterministic per-page seed, so a re-executed page withholds the same users.
pub(crate) fn page_seed(job: JobId, page: u64) -> u64 {
    let id = job.as_uuid().as_u128();
    (id as u64) ^ ((id >> 64) as u64) ^ page
}

#[derive(Debug, Clone)]
pub(crate) enum PageSource {
    /// User ids read from a CSV part.
    Ids(Vec<String>),
    /// Keyset page of the filtered token table.
    Keyset { after: i64, limit: u32 },
}

#[derive(Debug, Clone)]
pub(crate) struct Page {
    pub number: u64,
    pub source: PageSource,
}

/// What a Batch Creation invocation added to the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTotals {
    pub batches: i64,
    pub users: i64,
    pub tokens: i64,
}

impl std::ops::AddAssign for PageTotals {
    fn add_assign(&mut self, rhs: Self) {
        self.batches += rhs.batches;
        self.users += rhs.users;
        self.tokens += rhs.tokens;
    }
}

impl From<PageTotals> for TotalsDelta {
    fn from(t: PageTotals) -> Self {
        TotalsDelta {
            batches: t.batches,
            users: t.users,
            tokens: t.tokens,
        }
    }
}

/// Everything a page worker needs; shared by every task of one invocation.
pub(crate) struct PageContext {
    pub services: Services,
    pub job: Job,
    pub tracker: PageTracker,
    /// Computed once per invocation: were any pages marked before it began.
    pub reexecution: bool,
    /// Withhold each keyset page's share of the control group (filter path).
    pub extract_control_group: bool,
    pub status: Option<StageStatus>,
}

impl PageContext {
    /// Schedule one page.
    ///
    /// A page is marked processed once every bucket is enqueued; buckets are
    /// marked one by one, so a retried page only enqueues what is missing.
    /// Whatever was enqueued is returned even when the page fails.
    async fn process(&self, page: Page) -> (PageTotals, Option<StageError>) {
        let number = page.number;
        let (users, users_count) = match self.load(page).await {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return (PageTotals::default(), None),
            Err(e) => return (PageTotals::default(), Some(e)),
        };

        let (scheduled, error) = self.schedule(number, users).await;
        if error.is_some() {
            return (scheduled, error);
        }
        if let Err(e) = self.tracker.mark_processed(number).await {
            return (scheduled, Some(e.into()));
        }

        if let Some(status) = &self.status {
            if let Err(e) = status.incr_progress().await {
                warn!(job_id = %self.job.id, page = number, error = %e, "failed to report page progress");
            }
        }

        debug!(job_id = %self.job.id, page = number, batches = scheduled.batches, "page scheduled");
        let totals = PageTotals {
            users: users_count,
            ..scheduled
        };
        (totals, None)
    }

    /// Users of a page, minus its control group share, and the number of
    /// users it accounts for. `None` when a previous run finished the page.
    async fn load(&self, page: Page) -> Result<Option<(Vec<User>, i64)>, StageError> {
        let job = &self.job;
        if self.reexecution && self.tracker.is_processed(page.number).await? {
            debug!(job_id = %job.id, page = page.number, "page already processed; skipping");
            return Ok(None);
        }

        let table = job.token_table();
        let (mut users, requested) = match &page.source {
            PageSource::Ids(ids) => (self.services.tokens.by_user_ids(&table, ids).await?, Some(ids.len())),
            PageSource::Keyset { after, limit } => {
                (self.services.tokens.page(&table, &job.filters, *after, *limit).await?, None)
            }
        };

        if let (true, PageSource::Keyset { limit, .. }) = (self.extract_control_group, &page.source) {
            // keyset pages are full except the last, so the offset is exact
            let offset = page.number as usize * *limit as usize;
            let size = control_group_share(offset, users.len(), job.control_group);
            let mut rng = StdRng::seed_from_u64(page_seed(job.id, page.number));
            let withheld = withhold(&mut users, size, &mut rng);
            let ids: Vec<String> = withheld.into_iter().map(|u| u.user_id).collect();
            persist_control_group(&self.services, job, &ids).await?;
        }

        let users_count = requested.unwrap_or(users.len()) as i64;
        Ok(Some((users, users_count)))
    }

    /// Enqueue one Dispatch unit per timezone bucket of `users`.
    ///
    /// Localized jobs schedule each bucket at the job's wall-clock start in
    /// that timezone; buckets whose time has passed follow the job's strategy.
    async fn schedule(&self, page: u64, users: Vec<User>) -> (PageTotals, Option<StageError>) {
        let mut totals = PageTotals::default();
        for (tz, bucket) in bucket_by_tz(users) {
            let len = bucket.len() as i64;
            match self.schedule_bucket(page, &tz, &bucket).await {
                Ok(true) => {
                    totals.batches += 1;
                    totals.tokens += len;
                }
                Ok(false) => {}
                Err(e) => return (totals, Some(e)),
            }
        }
        (totals, None)
    }

    /// Whether a new Dispatch unit was enqueued for the bucket.
    async fn schedule_bucket(&self, page: u64, tz: &str, bucket: &[User]) -> Result<bool, StageError> {
        let job = &self.job;
        let services = &self.services;
        if self.reexecution && self.tracker.is_bucket_processed(page, tz).await? {
            debug!(job_id = %job.id, page, tz = %tz, "bucket already scheduled");
            return Ok(false);
        }

        let message = StageMessage::dispatch(job.id, &job.app_name, bucket)?;
        if job.localized {
            match localized_send_at(job.starts_at, tz, job.past_time_strategy, Utc::now()) {
                Ok(Some(at)) => services.enqueue_at(message, at).await?,
                Ok(None) => {
                    debug!(job_id = %job.id, tz = %tz, "send time already passed; bucket skipped");
                    return Ok(false);
                }
                Err(e) => {
                    warn!(job_id = %job.id, tz = %tz, error = %e, "invalid timezone; sending bucket now");
                    services.enqueue(message).await?
                }
            }
        } else {
            services.enqueue(message).await?
        };

        if let Err(e) = self.tracker.mark_bucket(page, tz).await {
            // the unit is queued either way; a retry may enqueue it again
            warn!(job_id = %job.id, page, tz = %tz, error = %e, "failed to mark bucket");
        }
        Ok(true)
    }
}

/// Run `pages` through `concurrency` workers.
///
/// Returns what every page scheduled, failed pages included, together with
/// the first error, so callers account for partial progress before failing.
pub(crate) async fn process_pages(
    ctx: Arc<PageContext>,
    pages: Vec<Page>,
    concurrency: usize,
) -> (PageTotals, Option<StageError>) {
    let (page_tx, page_rx) = mpsc::channel(pages.len().max(1));
    for page in pages {
        if page_tx.send(page).await.is_err() {
            break;
        }
    }
    drop(page_tx);

    let page_rx = Arc::new(Mutex::new(page_rx));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(PageTotals, Option<StageError>)>();

    let aggregator = tokio::spawn(async move {
        let mut totals = PageTotals::default();
        let mut first_error = None;
        while let Some((page, error)) = result_rx.recv().await {
            totals += page;
            if let Some(e) = error {
                first_error.get_or_insert(e);
            }
        }
        (totals, first_error)
    });

    let mut workers = Vec::with_capacity(concurrency.max(1));
    for _ in 0..concurrency.max(1) {
        let ctx = ctx.clone();
        let page_rx = page_rx.clone();
        let result_tx = result_tx.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let next = page_rx.lock().await.recv().await;
                let Some(page) = next else { break };
                let number = page.number;
                let result = ctx.process(page).await;
                if let Some(e) = &result.1 {
                    warn!(job_id = %ctx.job.id, page = number, error = %e, "page failed");
                }
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    let mut join_error = None;
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "page worker aborted");
            join_error.get_or_insert(StageError::Worker(e.to_string()));
        }
    }

    match aggregator.await {
        Ok((totals, first_error)) => (totals, first_error.or(join_error)),
        Err(e) => (PageTotals::default(), Some(StageError::Worker(e.to_string()))),
    }
}

/// Remember withheld users and point the job at their future CSV.
pub(crate) async fn persist_control_group(services: &Services, job: &Job, ids: &[String]) -> Result<(), StageError> {
    if ids.is_empty() {
        return Ok(());
    }
    let key = keys::control_group(job.id);
    for id in ids {
        services.coord.rpush(&key, id).await?;
    }
    if job.control_group_csv_path.is_empty() {
        let path = control_group_path(services, job.id);
        services.repo.set_control_group_csv_path(job.id, &path).await?;
    }
    debug!(job_id = %job.id, withheld = ids.len(), "control group users withheld");
    Ok(())
}

pub(crate) fn control_group_path(services: &Services, job: JobId) -> String {
    format!("{}/{job}.csv", services.config.control_group_folder)
}

/// Complete the job if every batch is done; the single winner schedules the
/// Job-Completed stage.
pub(crate) async fn complete_if_done(services: &Services, job: JobId) -> Result<bool, StageError> {
    if !services.repo.try_complete(job, now_nanos()).await? {
        return Ok(false);
    }
    services
        .enqueue_in(StageMessage::JobCompleted { job_id: job }, services.config.completed_job_delay)
        .await?;
    info!(job_id = %job, "all batches dispatched; job completed");
    Ok(true)
}

/// Exclusive `seq_id` cursors of every keyset page of a filtered table.
pub(crate) async fn discover_pages(
    services: &Services,
    table: &str,
    filters: &BTreeMap<String, String>,
    page_size: u32,
) -> Result<Vec<i64>, StageError> {
    let mut cursors = Vec::new();
    let mut after = 0;
    while let Some(end) = services.tokens.page_end_seq_id(table, filters, after, page_size).await? {
        cursors.push(after);
        after = end;
    }
    Ok(cursors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_seed_depends_on_page() {
        let job = JobId::new();
        assert_eq!(page_seed(job, 3), page_seed(job, 3));
        assert_ne!(page_seed(job, 3), page_seed(job, 4));
    }

    #[test]
    fn totals_accumulate() {
        let mut totals = PageTotals::default();
        totals += PageTotals { batches: 2, users: 10, tokens: 12 };
        totals += PageTotals { batches: 1, users: 3, tokens: 3 };
        assert_eq!(totals, PageTotals { batches: 3, users: 13, tokens: 15 });
        assert_eq!(TotalsDelta::from(totals).tokens, 15);
    }
}
