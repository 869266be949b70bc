//! RPC sidecar
//!
//! Owns the single upstream connection and shares it with local workers:
//! - Broker call and event channels on local TCP
//! - /health and /metrics over HTTP
//! - Dead-letter maintenance (cleanup plus bounded re-drive of failed
//!   upstream cancels)
//!
//! Ctrl+C stops accepting, closes the upstream session and exits.

use anyhow::{Context, Result};
use clap::Parser;
use sidecar_bins::common::{init_process, log_config, shutdown_signal, CommonArgs};
use sidecar_core::broker::{BrokerServer, SubscriptionBroker};
use sidecar_core::connection::ConnectionManager;
use sidecar_core::monitoring::{HealthMonitor, MetricsRegistry, MonitoringServer};
use sidecar_core::resilience::{CircuitBreakerRegistry, DeadLetterStore};
use sidecar_core::storage::JsonlFileRepository;
use sidecar_core::upstream::JsonRpcConnector;
use sidecar_core::SidecarConfig;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = CommonArgs::parse();
    let config = args.load_config()?;
    init_process(&config)?;

    info!("=== RPC Sidecar ===");
    log_config(&config);

    let (shutdown_tx, shutdown) = shutdown_signal()?;
    let result = run(config, shutdown).await;
    shutdown_tx.send_replace(true);

    if let Err(e) = &result {
        error!("sidecar stopped with error: {:#}", e);
    }
    result
}

async fn dead_letter_store(config: &SidecarConfig) -> Result<DeadLetterStore> {
    match &config.dead_letter.path {
        Some(path) => {
            let repo = JsonlFileRepository::open(path)
                .await
                .with_context(|| format!("failed to open dead-letter log {}", path.display()))?;
            Ok(DeadLetterStore::new(Arc::new(repo), config.dead_letter()))
        }
        None => Ok(DeadLetterStore::in_memory(config.dead_letter())),
    }
}

async fn run(config: SidecarConfig, shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
    let metrics = MetricsRegistry::new().context("failed to create metrics registry")?;
    let breakers = CircuitBreakerRegistry::new(config.circuit_breaker());

    let connection_config = config.connection();
    let breaker = breakers.get_with(&connection_config.name, connection_config.breaker.clone());
    let connector =
        JsonRpcConnector::new(config.json_rpc()?).context("failed to build upstream connector")?;
    let connection = ConnectionManager::with_parts(
        Arc::new(connector),
        connection_config,
        breaker,
        Some(metrics.clone()),
    );

    // A failed first connect is not fatal: recovery continues in the background
    if let Err(e) = connection.connect().await {
        warn!("initial upstream connect failed: {}", e);
    }

    let dead_letters = dead_letter_store(&config).await?;
    let broker = SubscriptionBroker::new(
        connection.clone(),
        Some(dead_letters.clone()),
        Some(metrics.clone()),
    );

    let mut tasks = Vec::new();

    // Dead-letter maintenance re-drives failed cancels through the broker
    let redrive_broker = broker.clone();
    tasks.push(tokio::spawn(dead_letters.clone().run_maintenance(
        config.maintenance(),
        move |payload| {
            let broker = redrive_broker.clone();
            async move { broker.redrive(payload).await }
        },
        shutdown.clone(),
    )));

    if config.monitoring.enabled {
        let health = HealthMonitor::new(connection.clone(), breakers.clone())
            .with_dead_letters(dead_letters.clone())
            .with_metrics(metrics.clone());
        let server = MonitoringServer::new(config.monitoring_server(), health, metrics.clone());
        let monitoring_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server.serve(monitoring_shutdown).await {
                error!("monitoring server failed: {:#}", e);
            }
        }));
    }

    // Blocks until shutdown or a bind failure
    let served = BrokerServer::new(broker, Some(metrics))
        .serve(config.broker_server(), shutdown)
        .await;

    info!("Shutting down...");
    connection.close().await;
    for task in tasks {
        task.abort();
    }

    served?;
    info!("=== Sidecar stopped ===");
    Ok(())
}
