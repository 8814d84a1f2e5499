//! Dispatch worker process: N workers over a shared broker connection.

use core_config::redis::RedisConfig;
use core_config::{Environment, FromEnv};
use domain_dispatch::{
    BrokerClient, DispatchConfig, DispatchWorker, EmailProvider, MailgunConfig, MailgunProvider,
    SendGridConfig, SendGridProvider, SmtpConfig, SmtpProvider, TemplateEngine,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

pub async fn run() -> eyre::Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    // Install the Prometheus recorder so the metrics facade has somewhere to
    // land; exposition is the deployment's concern.
    let _metrics_handle = PrometheusBuilder::new().install_recorder()?;

    let redis_config = RedisConfig::from_env()?;
    let config = Arc::new(DispatchConfig::from_env()?);

    info!(
        redis = %redis_config.host,
        workers = config.worker_concurrency,
        batch_size = config.batch_size,
        "Starting dispatch worker process"
    );

    let broker = Arc::new(BrokerClient::connect(&redis_config, config.clone()).await?);
    let templates = Arc::new(TemplateEngine::new()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers: JoinSet<()> = JoinSet::new();
    for i in 0..config.worker_concurrency {
        // Each worker owns its provider clients (and their connection
        // pools); only the broker connection is shared.
        let worker = DispatchWorker::new(
            format!("worker_{i}"),
            broker.clone(),
            build_providers()?,
            templates.clone(),
            config.clone(),
        );
        let shutdown = shutdown_rx.clone();
        workers.spawn(async move { worker.run(shutdown).await });
    }

    info!(count = config.worker_concurrency, "Dispatch workers running");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, draining in-flight batches");
    let _ = shutdown_tx.send(true);

    while workers.join_next().await.is_some() {}
    info!("Dispatch worker process stopped");
    Ok(())
}

/// Construct every provider the environment has credentials for. SMTP is
/// always present; it defaults to a local MailHog when unconfigured.
fn build_providers() -> eyre::Result<Vec<Arc<dyn EmailProvider>>> {
    let mut providers: Vec<Arc<dyn EmailProvider>> = Vec::new();

    providers.push(Arc::new(SmtpProvider::new(SmtpConfig::from_env())?));

    if let Ok(config) = SendGridConfig::from_env() {
        providers.push(Arc::new(SendGridProvider::new(config)?));
    }
    if let Ok(config) = MailgunConfig::from_env() {
        providers.push(Arc::new(MailgunProvider::new(config)?));
    }

    for provider in &providers {
        tracing::debug!(provider = provider.name(), "Email provider initialized");
    }

    Ok(providers)
}
