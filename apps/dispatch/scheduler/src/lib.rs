//! Dispatch scheduler process.

use core_config::redis::RedisConfig;
use core_config::{Environment, FromEnv};
use domain_dispatch::{BrokerClient, DispatchConfig, DispatchScheduler};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

pub async fn run() -> eyre::Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let redis_config = RedisConfig::from_env()?;
    let config = Arc::new(DispatchConfig::from_env()?);

    info!(
        redis = %redis_config.host,
        interval_secs = config.scheduler_interval_secs,
        "Starting dispatch scheduler"
    );

    let broker = Arc::new(BrokerClient::connect(&redis_config, config).await?);
    let scheduler = DispatchScheduler::new(broker);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    handle.await?;
    info!("Dispatch scheduler stopped");
    Ok(())
}
