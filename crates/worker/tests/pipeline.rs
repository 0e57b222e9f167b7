use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use serde_json::{Map, json};

use herald_core::filter;
use herald_core::{AppId, Job, JobId, JobStatus, PastTimeStrategy, Service, Template, User};
use herald_infra::queue::{
    DeadLetterEntry, InMemoryQueueStore, QueueStats, QueueStore, QueueStoreError, QueuedUnit, UnitId,
};
use herald_infra::tokens::TokenQuery;
use herald_infra::{
    BlobStore, InMemoryBlobStore, InMemoryCoordination, InMemoryJobRepository, InMemoryNotifier, InMemoryPushBus,
    InMemoryTokenStore, JobRepository, Notification, TagState,
};
use herald_worker::keys;
use herald_worker::paused::PausedQueue;
use herald_worker::stages::batch_creation;
use herald_worker::stages::db_to_csv::{self, PartOutcome};
use herald_worker::{FilterPipeline, Orchestrator, Services, WorkerConfig};

const TABLE: &str = "game_apns";

struct Harness {
    orchestrator: Orchestrator,
    repo: Arc<InMemoryJobRepository>,
    tokens: Arc<InMemoryTokenStore>,
    blobs: Arc<InMemoryBlobStore>,
    bus: Arc<InMemoryPushBus>,
    notifier: Arc<InMemoryNotifier>,
    queue: Arc<InMemoryQueueStore>,
    app_id: AppId,
}

impl Harness {
    fn new(configure: impl FnOnce(&mut WorkerConfig)) -> Self {
        let mut config = WorkerConfig {
            completed_job_delay: Duration::ZERO,
            retry_base_delay: Duration::ZERO,
            ..WorkerConfig::default()
        };
        configure(&mut config);

        let repo = Arc::new(InMemoryJobRepository::new());
        let tokens = Arc::new(InMemoryTokenStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let bus = Arc::new(InMemoryPushBus::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let queue = InMemoryQueueStore::arc();

        let app_id = AppId::new();
        let mut body = Map::new();
        body.insert("alert".to_string(), json!("Hello"));
        repo.add_template(app_id, Template::new("welcome", "en", body)).unwrap();

        let services = Services {
            repo: repo.clone(),
            tokens: tokens.clone(),
            blobs: blobs.clone(),
            bus: bus.clone(),
            coord: Arc::new(InMemoryCoordination::new()),
            queue: queue.clone(),
            notifier: notifier.clone(),
            config: Arc::new(config),
        };

        Self {
            orchestrator: Orchestrator::new(services),
            repo,
            tokens,
            blobs,
            bus,
            notifier,
            queue,
            app_id,
        }
    }

    fn services(&self) -> &Services {
        self.orchestrator.services()
    }

    fn seed_users(&self, users: impl IntoIterator<Item = User>) {
        self.tokens.insert(TABLE, users).unwrap();
    }

    fn job(&self) -> Job {
        Job::new(self.app_id, "game", Service::Apns, "welcome")
    }

    fn filter_job(&self) -> Job {
        self.job().with_filters(locale_filter("en"))
    }

    async fn csv_job(&self, ids: &[String]) -> Job {
        let key = format!("uploads/{}.csv", JobId::new());
        let mut body = String::from("userIds\n");
        for id in ids {
            body.push_str(id);
            body.push('\n');
        }
        self.blobs.put(&key, body.into_bytes()).await.unwrap();
        self.job().with_csv_path(key)
    }

    async fn load(&self, id: JobId) -> Job {
        self.repo.get(id).await.unwrap().unwrap()
    }

    async fn run(&self) -> usize {
        self.orchestrator.run_until_idle().await.unwrap()
    }
}

fn locale_filter(locale: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("locale".to_string(), locale.to_string())])
}

fn users(prefix: &str, n: usize, locale: &str) -> Vec<User> {
    (0..n)
        .map(|i| User::new(format!("{prefix}{i:05}"), format!("token-{prefix}{i}")).with_locale(locale))
        .collect()
}

fn ids(users: &[User]) -> Vec<String> {
    users.iter().map(|u| u.user_id.clone()).collect()
}

#[tokio::test]
async fn csv_job_dispatches_every_listed_user() {
    let h = Harness::new(|_| {});
    let audience = users("u", 25, "en");
    h.seed_users(audience.clone());
    h.seed_users(users("other", 5, "en"));

    let job = h.csv_job(&ids(&audience)).await;
    let id = h.orchestrator.create_job(job).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 25);
    let job = h.load(id).await;
    assert_eq!(job.total_users, 25);
    assert_eq!(job.total_tokens, 25);
    assert_eq!(job.completed_tokens, 25);
    assert_eq!(job.completed_batches, job.total_batches.unwrap());
    assert!(job.is_completed());
    assert_eq!(h.notifier.sent(), vec![Notification::JobCompleted(id)]);
}

#[tokio::test]
async fn csv_split_into_many_parts_counts_each_user_once() {
    let h = Harness::new(|c| c.csv_part_size = 64);
    let audience = users("u", 40, "en");
    h.seed_users(audience.clone());

    let job = h.csv_job(&ids(&audience)).await;
    let id = h.orchestrator.create_job(job).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 40);
    let job = h.load(id).await;
    assert_eq!(job.total_users, 40);
    assert_eq!(job.total_tokens, 40);
    assert!(job.is_completed());
}

#[tokio::test]
async fn control_group_is_withheld_and_exported() {
    let h = Harness::new(|_| {});
    let audience = users("u", 10, "en");
    h.seed_users(audience.clone());

    let job = h.csv_job(&ids(&audience)).await.with_control_group(0.4);
    let id = h.orchestrator.create_job(job).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 6);
    let job = h.load(id).await;
    assert_eq!(job.total_users, 6);
    assert!(!job.control_group_csv_path.is_empty());

    let export = String::from_utf8(h.blobs.get(&job.control_group_csv_path).await.unwrap()).unwrap();
    let mut lines = export.lines();
    assert_eq!(lines.next(), Some("controlGroupUserIds"));
    let withheld: Vec<&str> = lines.collect();
    assert_eq!(withheld.len(), 4);

    let published: Vec<String> = h
        .bus
        .published()
        .iter()
        .map(|(_, push)| push["metadata"]["userId"].as_str().unwrap().to_string())
        .collect();
    for user in &withheld {
        assert!(!published.iter().any(|p| p == user));
    }
}

#[tokio::test]
async fn filters_pages_pipeline_completes_job() {
    let h = Harness::new(|c| c.filter_pipeline = FilterPipeline::Pages);
    h.seed_users(users("en", 10_000, "en"));
    h.seed_users(users("de", 500, "de"));

    let id = h.orchestrator.create_job(h.filter_job()).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 10_000);
    let job = h.load(id).await;
    assert_eq!(job.total_users, 10_000);
    assert_eq!(job.completed_tokens, 10_000);
    assert_eq!(job.total_batches, Some(10));
    assert!(job.completed_at > 0);
    assert_eq!(h.notifier.sent(), vec![Notification::JobCompleted(id)]);
}

#[tokio::test]
async fn filters_csv_pipeline_completes_job() {
    let h = Harness::new(|c| c.filter_pipeline = FilterPipeline::Csv);
    h.seed_users(users("en", 10_000, "en"));
    h.seed_users(users("de", 500, "de"));

    let id = h.orchestrator.create_job(h.filter_job()).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 10_000);
    let job = h.load(id).await;
    assert_eq!(job.csv_path, format!("csv/{id}.csv"));
    assert_eq!(job.total_users, 10_000);
    assert!(job.is_completed());
    assert!(
        h.repo
            .tags(id)
            .iter()
            .any(|t| t.stage == db_to_csv::STAGE && t.state == TagState::Success)
    );
    assert_eq!(h.notifier.sent(), vec![Notification::JobCompleted(id)]);
}

#[tokio::test]
async fn direct_pipeline_dispatches_seq_ranges() {
    let h = Harness::new(|c| {
        c.filter_pipeline = FilterPipeline::Direct;
        c.direct_batch_size = 100;
    });
    h.seed_users(users("en", 200, "en"));
    h.seed_users(users("de", 50, "de"));

    let id = h.orchestrator.create_job(h.filter_job()).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 200);
    let job = h.load(id).await;
    assert_eq!(job.total_batches, Some(3));
    assert_eq!(job.completed_batches, 3);
    assert!(job.is_completed());
}

#[tokio::test]
async fn filter_job_without_matching_users_is_rejected() {
    let h = Harness::new(|c| c.filter_pipeline = FilterPipeline::Pages);
    h.seed_users(users("de", 5, "de"));

    let id = h.orchestrator.create_job(h.filter_job()).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 0);
    assert!(!h.load(id).await.is_completed());
    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert!(h.repo.tags(id).iter().any(|t| t.state == TagState::Fail));
}

#[tokio::test]
async fn batch_creation_rerun_schedules_nothing_new() {
    let h = Harness::new(|c| c.db_page_size = 10);
    h.seed_users(users("en", 35, "en"));
    let job = h.filter_job();
    let id = job.id;
    h.repo.insert(&job).await.unwrap();

    let first = batch_creation::from_filters(h.services(), id).await.unwrap();
    let pending = h.queue.stats().await.unwrap().pending;
    let second = batch_creation::from_filters(h.services(), id).await.unwrap();

    assert_eq!(first.batches, 4);
    assert_eq!(first.tokens, 35);
    assert_eq!(second.batches, 0);
    assert_eq!(h.queue.stats().await.unwrap().pending, pending);
    assert_eq!(h.load(id).await.total_tokens, 35);
}

#[tokio::test]
async fn db_to_csv_parts_can_arrive_out_of_order() {
    let h = Harness::new(|_| {});
    h.seed_users(users("en", 4, "en"));
    let job = h.filter_job().with_db_page_size(2);
    let id = job.id;
    h.repo.insert(&job).await.unwrap();

    let services = h.services();
    let upload = services.blobs.start_multipart(&format!("csv/{id}.csv")).await.unwrap();
    let query = |after| TokenQuery {
        table: TABLE.to_string(),
        filters: job.filters.clone(),
        after_seq_id: after,
        limit: 2,
    };

    let second = db_to_csv::run(services, id, &query(2), &upload, 2, 2).await.unwrap();
    assert_eq!(second, PartOutcome::Uploaded);
    let again = db_to_csv::run(services, id, &query(2), &upload, 2, 2).await.unwrap();
    assert_eq!(again, PartOutcome::Skipped);
    let first = db_to_csv::run(services, id, &query(0), &upload, 1, 2).await.unwrap();
    assert_eq!(first, PartOutcome::Finalized);

    let csv = String::from_utf8(h.blobs.get(&upload.key).await.unwrap()).unwrap();
    assert_eq!(csv, "userIds\nen00000\nen00001\nen00002\nen00003\n");
    assert_eq!(h.load(id).await.csv_path, upload.key);
}

#[tokio::test]
async fn circuit_break_parks_batches_until_resume() {
    let h = Harness::new(|c| {
        c.filter_pipeline = FilterPipeline::Pages;
        c.max_batch_failure = 0.4;
    });
    h.seed_users(users("a", 2, "en").into_iter().map(|u| u.with_tz("+0100")));
    h.seed_users(users("b", 2, "en").into_iter().map(|u| u.with_tz("+0200")));
    h.bus.reject_when(|_| true);

    let id = h.orchestrator.create_job(h.filter_job()).await.unwrap();
    h.run().await;

    let job = h.load(id).await;
    assert_eq!(job.status, JobStatus::CircuitBreak);
    assert_eq!(h.bus.count(), 0);
    assert_eq!(h.notifier.sent(), vec![Notification::CircuitBreak(id)]);
    let paused = PausedQueue::new(h.services().coord.clone(), id);
    assert_eq!(paused.len().await.unwrap(), 1);

    h.bus.reject_when(|_| false);
    h.orchestrator.resume_job(id).await.unwrap();
    h.run().await;

    assert_eq!(paused.len().await.unwrap(), 0);
    assert_eq!(h.bus.count(), 2);
    let job = h.load(id).await;
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.is_completed());
}

#[tokio::test]
async fn paused_job_delivers_after_resume() {
    let h = Harness::new(|c| {
        c.filter_pipeline = FilterPipeline::Pages;
        c.db_page_size = 2;
    });
    h.seed_users(users("en", 6, "en"));

    let id = h.orchestrator.create_job(h.filter_job()).await.unwrap();
    h.orchestrator.pause_job(id).await.unwrap();
    h.run().await;

    let paused = PausedQueue::new(h.services().coord.clone(), id);
    assert_eq!(paused.len().await.unwrap(), 3);
    assert_eq!(h.bus.count(), 0);

    h.orchestrator.resume_job(id).await.unwrap();
    h.run().await;

    let mut delivered: Vec<String> = h
        .bus
        .published()
        .iter()
        .map(|(_, push)| push["metadata"]["userId"].as_str().unwrap().to_string())
        .collect();
    delivered.sort();
    assert_eq!(delivered, ids(&users("en", 6, "en")));
    assert!(h.load(id).await.is_completed());
}

#[tokio::test]
async fn stopped_job_sends_nothing() {
    let h = Harness::new(|_| {});
    let audience = users("u", 5, "en");
    h.seed_users(audience.clone());

    let job = h.csv_job(&ids(&audience)).await;
    let id = h.orchestrator.create_job(job).await.unwrap();
    h.orchestrator.stop_job(id).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 0);
    assert!(!h.load(id).await.is_completed());
    assert!(h.notifier.sent().is_empty());
}

#[test]
fn filters_compile_to_sql_predicates() {
    let filters = BTreeMap::from([
        ("NOTregion".to_string(), "US,CA".to_string()),
        ("locale".to_string(), "en".to_string()),
    ]);
    assert_eq!(
        filter::compile(&filters),
        "(\"region\"!='US' AND \"region\"!='CA') AND (\"locale\"='en')"
    );
}

fn published_to(h: &Harness, user_id: &str) -> usize {
    h.bus
        .published()
        .iter()
        .filter(|(_, push)| push["metadata"]["userId"].as_str() == Some(user_id))
        .count()
}

#[tokio::test]
async fn control_group_share_of_a_one_row_last_page_completes() {
    let h = Harness::new(|c| {
        c.filter_pipeline = FilterPipeline::Pages;
        c.db_page_size = 10;
    });
    h.seed_users(users("en", 11, "en"));

    let id = h
        .orchestrator
        .create_job(h.filter_job().with_control_group(0.1))
        .await
        .unwrap();
    h.run().await;

    // ceil(11 * 0.1) = 2 withheld over both pages
    assert_eq!(h.bus.count(), 9);
    assert_eq!(h.queue.stats().await.unwrap().dead_lettered, 0);
    let job = h.load(id).await;
    assert!(job.is_completed());
    assert_eq!(job.total_users, 9);

    let export = String::from_utf8(h.blobs.get(&job.control_group_csv_path).await.unwrap()).unwrap();
    assert_eq!(export.lines().count(), 3);
}

#[tokio::test]
async fn control_group_larger_than_filtered_audience_fails_before_sending() {
    let h = Harness::new(|c| c.filter_pipeline = FilterPipeline::Pages);
    h.seed_users(users("en", 1, "en"));

    let id = h
        .orchestrator
        .create_job(h.filter_job().with_control_group(0.5))
        .await
        .unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 0);
    assert_eq!(h.queue.stats().await.unwrap().dead_lettered, 1);
    assert!(h.repo.tags(id).iter().any(|t| t.state == TagState::Fail));
}

#[tokio::test]
async fn direct_range_too_small_to_split_is_sent() {
    let h = Harness::new(|c| {
        c.filter_pipeline = FilterPipeline::Direct;
        c.direct_batch_size = 100;
    });
    h.seed_users(users("en", 101, "en"));

    let id = h
        .orchestrator
        .create_job(h.filter_job().with_control_group(0.1))
        .await
        .unwrap();
    h.run().await;

    assert_eq!(h.queue.stats().await.unwrap().dead_lettered, 0);
    let job = h.load(id).await;
    assert!(job.is_completed());
    let export = String::from_utf8(h.blobs.get(&job.control_group_csv_path).await.unwrap()).unwrap();
    let withheld = export.lines().count() - 1;
    assert!(withheld > 0);
    assert_eq!(h.bus.count() + withheld, 101);
}

#[tokio::test]
async fn user_with_far_apart_tokens_is_exported_once() {
    let h = Harness::new(|c| {
        c.filter_pipeline = FilterPipeline::Csv;
        c.db_page_size = 2;
        c.csv_part_size = 16;
    });
    h.seed_users([User::new("dup00", "token-phone").with_locale("en")]);
    h.seed_users(users("en", 10, "en"));
    h.seed_users([User::new("dup00", "token-tablet").with_locale("en")]);

    let id = h.orchestrator.create_job(h.filter_job()).await.unwrap();
    h.run().await;

    let job = h.load(id).await;
    assert!(job.is_completed());
    let csv = String::from_utf8(h.blobs.get(&job.csv_path).await.unwrap()).unwrap();
    assert_eq!(csv.lines().filter(|l| *l == "dup00").count(), 1);
    assert_eq!(csv.lines().count(), 12);

    // one push per device
    assert_eq!(published_to(&h, "dup00"), 2);
    assert_eq!(h.bus.count(), 12);
}

#[tokio::test]
async fn breaker_trips_when_failures_reach_the_threshold() {
    let h = Harness::new(|c| {
        c.filter_pipeline = FilterPipeline::Pages;
        c.max_batch_failure = 0.5;
    });
    h.seed_users(users("a", 2, "en").into_iter().map(|u| u.with_tz("+0100")));
    h.seed_users(users("b", 2, "en").into_iter().map(|u| u.with_tz("+0200")));
    h.bus
        .reject_when(|push| push["metadata"]["userId"].as_str().is_some_and(|id| id.starts_with('a')));

    let id = h.orchestrator.create_job(h.filter_job()).await.unwrap();
    h.run().await;

    // one failed batch out of two is exactly the threshold
    let job = h.load(id).await;
    assert_eq!(job.total_batches, Some(2));
    assert_eq!(job.status, JobStatus::CircuitBreak);
    assert!(h.notifier.sent().contains(&Notification::CircuitBreak(id)));
}

/// Queue store whose `fail_at`-th enqueue (1-based) fails once.
struct FlakyQueue {
    inner: Arc<InMemoryQueueStore>,
    enqueued: AtomicUsize,
    fail_at: usize,
}

#[async_trait]
impl QueueStore for FlakyQueue {
    async fn enqueue(&self, unit: QueuedUnit) -> Result<UnitId, QueueStoreError> {
        if self.enqueued.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_at {
            return Err(QueueStoreError::Storage("connection reset".to_string()));
        }
        self.inner.enqueue(unit).await
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<QueuedUnit>, QueueStoreError> {
        self.inner.claim_next(queue).await
    }

    async fn update(&self, unit: &QueuedUnit) -> Result<(), QueueStoreError> {
        self.inner.update(unit).await
    }

    async fn dead_letter(&self, unit: QueuedUnit, reason: String) -> Result<(), QueueStoreError> {
        self.inner.dead_letter(unit, reason).await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, QueueStoreError> {
        self.inner.list_dead_letters(limit).await
    }

    async fn retry_dead_letter(&self, id: UnitId) -> Result<QueuedUnit, QueueStoreError> {
        self.inner.retry_dead_letter(id).await
    }

    async fn pending(&self, queue: &str) -> Result<Vec<QueuedUnit>, QueueStoreError> {
        self.inner.pending(queue).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        self.inner.stats().await
    }
}

#[tokio::test]
async fn page_failing_midway_is_finished_by_the_retry() {
    let h = Harness::new(|c| c.db_page_size = 10);
    h.seed_users(users("a", 1, "en").into_iter().map(|u| u.with_tz("+0100")));
    h.seed_users(users("b", 1, "en").into_iter().map(|u| u.with_tz("+0200")));
    h.seed_users(users("c", 1, "en").into_iter().map(|u| u.with_tz("+0300")));
    let job = h.filter_job();
    let id = job.id;
    h.repo.insert(&job).await.unwrap();

    let flaky = Services {
        queue: Arc::new(FlakyQueue {
            inner: h.queue.clone(),
            enqueued: AtomicUsize::new(0),
            fail_at: 2,
        }),
        ..h.services().clone()
    };

    assert!(batch_creation::from_filters(&flaky, id).await.is_err());
    let job = h.load(id).await;
    assert_eq!(job.total_batches, Some(1));
    assert_eq!(job.total_tokens, 1);

    let retry = batch_creation::from_filters(&flaky, id).await.unwrap();
    assert_eq!(retry.batches, 2);
    let job = h.load(id).await;
    assert_eq!(job.total_batches, Some(3));
    assert_eq!(job.total_tokens, 3);
    assert_eq!(job.total_users, 3);
    assert_eq!(h.queue.pending("dispatch").await.unwrap().len(), 3);

    h.run().await;
    assert_eq!(h.bus.count(), 3);
    let job = h.load(id).await;
    assert_eq!(job.completed_batches, 3);
    assert!(job.is_completed());
}

#[tokio::test]
async fn db_to_csv_finalizes_despite_a_part_pushed_twice() {
    let h = Harness::new(|_| {});
    h.seed_users(users("en", 4, "en"));
    let job = h.filter_job().with_db_page_size(2);
    let id = job.id;
    h.repo.insert(&job).await.unwrap();

    let services = h.services();
    let upload = services.blobs.start_multipart(&format!("csv/{id}.csv")).await.unwrap();
    let query = |after| TokenQuery {
        table: TABLE.to_string(),
        filters: job.filters.clone(),
        after_seq_id: after,
        limit: 2,
    };

    let second = db_to_csv::run(services, id, &query(2), &upload, 2, 2).await.unwrap();
    assert_eq!(second, PartOutcome::Uploaded);

    // a concurrent redelivery of part 2 that slipped past the duplicate check
    let again = services
        .blobs
        .upload_part(&upload, 2, b"en00002\nen00003\n".to_vec())
        .await
        .unwrap();
    services
        .coord
        .rpush(&keys::uploaded_parts(id), &serde_json::to_string(&again).unwrap())
        .await
        .unwrap();

    let first = db_to_csv::run(services, id, &query(0), &upload, 1, 2).await.unwrap();
    assert_eq!(first, PartOutcome::Finalized);

    let csv = String::from_utf8(h.blobs.get(&upload.key).await.unwrap()).unwrap();
    assert_eq!(csv, "userIds\nen00000\nen00001\nen00002\nen00003\n");
    assert_eq!(h.load(id).await.csv_path, upload.key);
}

#[tokio::test]
async fn expired_job_drops_its_batches() {
    let h = Harness::new(|c| c.filter_pipeline = FilterPipeline::Pages);
    h.seed_users(users("en", 5, "en"));

    let mut job = h.filter_job();
    job.expires_at = (Utc::now() - ChronoDuration::seconds(1)).timestamp_nanos_opt().unwrap();
    let id = h.orchestrator.create_job(job).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 0);
    let paused = PausedQueue::new(h.services().coord.clone(), id);
    assert_eq!(paused.len().await.unwrap(), 0);
    let job = h.load(id).await;
    assert_eq!(job.total_batches, Some(1));
    assert_eq!(job.completed_batches, 0);
    assert!(!job.is_completed());
}

fn localized_job(h: &Harness, strategy: PastTimeStrategy) -> Job {
    let mut job = h.filter_job();
    job.localized = true;
    job.past_time_strategy = strategy;
    job.starts_at = (Utc::now() - ChronoDuration::hours(2)).timestamp_nanos_opt().unwrap();
    job
}

#[tokio::test]
async fn localized_bucket_past_its_time_is_skipped() {
    let h = Harness::new(|_| {});
    h.seed_users(users("en", 3, "en").into_iter().map(|u| u.with_tz("+0000")));
    let job = localized_job(&h, PastTimeStrategy::Skip);
    let id = job.id;
    h.repo.insert(&job).await.unwrap();

    let totals = batch_creation::from_filters(h.services(), id).await.unwrap();

    assert_eq!(totals.batches, 0);
    assert!(h.queue.pending("dispatch").await.unwrap().is_empty());
}

#[tokio::test]
async fn localized_bucket_past_its_time_moves_to_next_day() {
    let h = Harness::new(|_| {});
    h.seed_users(users("en", 3, "en").into_iter().map(|u| u.with_tz("+0000")));
    let job = localized_job(&h, PastTimeStrategy::NextDay);
    let id = job.id;
    h.repo.insert(&job).await.unwrap();

    let totals = batch_creation::from_filters(h.services(), id).await.unwrap();

    assert_eq!(totals.batches, 1);
    let pending = h.queue.pending("dispatch").await.unwrap();
    assert_eq!(pending.len(), 1);
    let expected = Utc.timestamp_nanos(job.starts_at) + ChronoDuration::hours(24);
    assert_eq!(pending[0].scheduled_at, Some(expected));
}

#[tokio::test]
async fn locale_without_template_falls_back_to_en() {
    let h = Harness::new(|c| c.filter_pipeline = FilterPipeline::Pages);
    h.seed_users(users("de", 3, "de"));

    let id = h
        .orchestrator
        .create_job(h.job().with_filters(locale_filter("de")))
        .await
        .unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 3);
    assert!(h.bus.published().iter().all(|(_, push)| push.to_string().contains("Hello")));
    assert!(h.load(id).await.is_completed());
}

#[tokio::test]
async fn missing_template_fails_the_batch_and_counts_it() {
    let h = Harness::new(|c| c.filter_pipeline = FilterPipeline::Pages);
    let mut body = Map::new();
    body.insert("alert".to_string(), json!("Salut"));
    h.repo.add_template(h.app_id, Template::new("promo", "fr", body)).unwrap();
    h.seed_users(users("de", 3, "de"));

    let job = Job::new(h.app_id, "game", Service::Apns, "promo").with_filters(locale_filter("de"));
    let id = h.orchestrator.create_job(job).await.unwrap();
    h.run().await;

    assert_eq!(h.bus.count(), 0);
    let failed = h.services().coord.get(&keys::failed_batches(id)).await.unwrap();
    assert_eq!(failed.as_deref(), Some("1"));
    assert!(
        h.repo
            .tags(id)
            .iter()
            .any(|t| t.state == TagState::Fail && t.message.contains("no template promo"))
    );
    // a single failed batch trips the default breaker, so the retry is parked
    let job = h.load(id).await;
    assert_eq!(job.status, JobStatus::CircuitBreak);
    assert!(!job.is_completed());
}
