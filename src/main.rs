use std::sync::Arc;

use anyhow::Context;
use tokio::main;
use tracing::info;
use tracing_subscriber::EnvFilter;

use messaging_outbox::{
    DistributedCountingSemaphore, LogDispatcher, OutboxManager, OutboxStore,
    config::Config,
    infrastructure::{
        database,
        repositories::postgres::{PostgresOutboxRepository, PostgresSemaphoreRepository},
    },
};

#[main]
async fn main() -> anyhow::Result<()> {
    let config = Config::try_parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let pool = database::connect(&config.database_url, config.database_max_connections).await?;
    database::run_migrations(&pool).await?;

    let store = OutboxStore::new(
        PostgresOutboxRepository::new(pool.clone()),
        config.retry.strategy()?,
        config.store.clone(),
    )?;

    let mut manager = OutboxManager::new(
        Arc::new(store),
        Arc::new(LogDispatcher::new()),
        config.manager.clone(),
    )?;
    if let Some(semaphore) = &config.semaphore {
        let semaphore = DistributedCountingSemaphore::new(
            semaphore.name.clone(),
            semaphore.max_owners,
            semaphore.timeout,
            PostgresSemaphoreRepository::new(pool.clone()),
        )?;
        manager = manager.with_semaphore(Arc::new(semaphore), config.owner_id.clone());
    }

    info!(owner_id = %config.owner_id, "outbox relay running");
    let handle = manager.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    handle.shutdown().await;

    pool.close().await;
    Ok(())
}
