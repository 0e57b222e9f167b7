//! Queue executor: worker pools per named queue, with retry and dead-letter
//! handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::store::{QueueStore, QueueStoreError};
use super::types::{QueuedUnit, UnitResult, UnitStatus};

/// Handler for the units of one queue.
#[async_trait]
pub trait UnitHandler: Send + Sync {
    async fn handle(&self, unit: &QueuedUnit) -> UnitResult;
}

/// Worker pool size of one queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency: concurrency.max(1),
        }
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How often idle workers poll their queue
    pub poll_interval: Duration,
    pub queues: Vec<QueueConfig>,
    /// Name for logging
    pub name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            queues: Vec::new(),
            name: "queue-executor".to_string(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// What happened to a unit after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    RetryScheduled,
    DeadLettered,
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub units_processed: u64,
    pub units_succeeded: u64,
    pub units_retried: u64,
    pub units_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct QueueExecutorHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl QueueExecutorHandle {
    /// Request graceful shutdown and wait for in-flight units to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        let mut stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Runs queued units through registered handlers.
pub struct QueueExecutor<S: QueueStore> {
    store: Arc<S>,
    handlers: HashMap<String, Arc<dyn UnitHandler>>,
}

impl<S: QueueStore + 'static> QueueExecutor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler of a queue.
    pub fn register_handler(&mut self, queue: impl Into<String>, handler: Arc<dyn UnitHandler>) {
        self.handlers.insert(queue.into(), handler);
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run one claimed unit and persist its outcome.
    pub async fn execute_one(&self, unit: &mut QueuedUnit) -> Result<Outcome, QueueStoreError> {
        let started = Utc::now();

        let result = match self.handlers.get(&unit.queue) {
            Some(handler) => handler.handle(unit).await,
            None => UnitResult::Fatal(format!("no handler for queue: {}", unit.queue)),
        };

        match result {
            UnitResult::Success => {
                unit.mark_completed(started);
                self.store.update(unit).await?;
                debug!(unit_id = %unit.id, queue = %unit.queue, "unit completed");
                Ok(Outcome::Completed)
            }
            UnitResult::Retry(error) => {
                unit.mark_failed(error.clone(), started);
                if matches!(unit.status, UnitStatus::DeadLettered { .. }) {
                    warn!(unit_id = %unit.id, queue = %unit.queue, error = %error, "unit dead-lettered after retries");
                    self.store.dead_letter(unit.clone(), error).await?;
                    Ok(Outcome::DeadLettered)
                } else {
                    debug!(unit_id = %unit.id, queue = %unit.queue, error = %error, "unit scheduled for retry");
                    self.store.update(unit).await?;
                    Ok(Outcome::RetryScheduled)
                }
            }
            UnitResult::Fatal(error) => {
                unit.mark_fatal(error.clone(), started);
                warn!(unit_id = %unit.id, queue = %unit.queue, error = %error, "unit failed fatally");
                self.store.dead_letter(unit.clone(), error).await?;
                Ok(Outcome::DeadLettered)
            }
        }
    }

    /// Process ready units of every registered queue until none is left.
    ///
    /// Returns the number of attempts made.
    pub async fn run_until_idle(&self) -> Result<usize, QueueStoreError> {
        let mut queues: Vec<String> = self.handlers.keys().cloned().collect();
        queues.sort();

        let mut attempts = 0;
        loop {
            let mut progressed = false;
            for queue in &queues {
                while let Some(mut unit) = self.store.claim_next(queue).await? {
                    self.execute_one(&mut unit).await?;
                    attempts += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(attempts);
            }
        }
    }

    /// Spawn the worker pools on the current tokio runtime.
    pub fn spawn(self, config: ExecutorConfig) -> QueueExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let executor = Arc::new(self);

        let mut workers = Vec::new();
        for queue in &config.queues {
            if !executor.handlers.contains_key(&queue.name) {
                warn!(executor = %config.name, queue = %queue.name, "queue has no handler; not starting workers");
                continue;
            }
            for slot in 0..queue.concurrency {
                workers.push(tokio::spawn(worker_loop(
                    executor.clone(),
                    queue.name.clone(),
                    slot,
                    config.poll_interval,
                    shutdown_rx.clone(),
                    stats.clone(),
                )));
            }
        }
        info!(executor = %config.name, workers = workers.len(), "queue executor started");

        QueueExecutorHandle {
            shutdown: shutdown_tx,
            workers,
            stats,
            started: Instant::now(),
        }
    }
}

fn with_stats(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

async fn worker_loop<S: QueueStore + 'static>(
    executor: Arc<QueueExecutor<S>>,
    queue: String,
    slot: usize,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    debug!(queue = %queue, slot, "queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match executor.store.claim_next(&queue).await {
            Ok(Some(mut unit)) => {
                with_stats(&stats, |s| s.current_running += 1);
                let outcome = executor.execute_one(&mut unit).await;
                with_stats(&stats, |s| {
                    s.current_running = s.current_running.saturating_sub(1);
                    s.units_processed += 1;
                    match outcome {
                        Ok(Outcome::Completed) => s.units_succeeded += 1,
                        Ok(Outcome::RetryScheduled) => s.units_retried += 1,
                        Ok(Outcome::DeadLettered) => s.units_dead_lettered += 1,
                        Err(_) => {}
                    }
                });
                if let Err(e) = outcome {
                    error!(queue = %queue, unit_id = %unit.id, error = %e, "failed to persist unit outcome");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "failed to claim unit");
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    debug!(queue = %queue, slot, "queue worker stopped");
}
