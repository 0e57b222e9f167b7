use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use herald_infra::queue::RedisQueueStore;
use herald_infra::{
    LocalFsBlobStore, PostgresJobRepository, PostgresTokenStore, RedisCoordination, RedisStreamsPushBus,
    TracingNotifier, db,
};
use herald_worker::{Orchestrator, Services, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    herald_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let pool = Arc::new(db::connect(&config.database_url).await.context("failed to connect to Postgres")?);
    let coord = RedisCoordination::connect(&config.redis_url)
        .await
        .context("failed to connect to Redis")?;
    let queue = RedisQueueStore::from_connection(coord.connection(), Some(config.queue_prefix.clone()));
    let bus = RedisStreamsPushBus::from_connection(coord.connection(), Some(config.bus_stream_prefix.clone()));

    let services = Services {
        repo: Arc::new(PostgresJobRepository::from_arc(pool.clone())),
        tokens: Arc::new(PostgresTokenStore::from_arc(pool)),
        blobs: Arc::new(LocalFsBlobStore::new(&config.blob_root)),
        bus: Arc::new(bus),
        coord: Arc::new(coord),
        queue: Arc::new(queue),
        notifier: Arc::new(TracingNotifier),
        config: Arc::new(config),
    };

    let orchestrator = Orchestrator::new(services);
    orchestrator.health().await.context("dependency health check failed")?;
    let handle = orchestrator.spawn();

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown requested; waiting for in-flight units");
    handle.shutdown().await;
    info!("worker stopped");
    Ok(())
}
