//! Sidecar worker
//!
//! Connects to the local sidecar, subscribes to the given channels and
//! runs every event through decode -> dedup -> handler. The handler here
//! only logs; real workers swap in their own `EventHandler`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use sidecar_bins::common::{init_process, shutdown_signal, CommonArgs};
use sidecar_core::client::{WorkerClient, WorkerClientConfig};
use sidecar_core::pipeline::{ChainEvent, EventHandler, EventKind, EventPipeline, LogClassifier};
use sidecar_core::resilience::{DeadLetterStore, Deduplicator};
use sidecar_core::SidecarResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Worker attached to the RPC sidecar")]
struct WorkerArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Channel to subscribe, e.g. logs:<address> (repeatable)
    #[arg(long = "channel", required = true)]
    channels: Vec<String>,

    /// Log slot events too (very chatty)
    #[arg(long)]
    log_slots: bool,
}

/// Logs decoded events
struct LoggingHandler {
    log_slots: bool,
}

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &ChainEvent) -> SidecarResult<()> {
        match event.kind {
            EventKind::Slot if !self.log_slots => {}
            EventKind::Other | EventKind::Slot => debug!(
                kind = %event.kind,
                channel = %event.channel,
                slot = ?event.slot,
                "event"
            ),
            _ => info!(
                kind = %event.kind,
                channel = %event.channel,
                signature = event.signature.as_deref().unwrap_or("-"),
                target = event.target.as_deref().unwrap_or("-"),
                slot = ?event.slot,
                "chain event"
            ),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = WorkerArgs::parse();
    let config = args.common.load_config()?;
    init_process(&config)?;

    info!("=== Sidecar Worker ===");
    info!("Broker: call={} event={}", config.broker.call_addr, config.broker.event_addr);
    info!("Channels: {:?}", args.channels);

    let (_shutdown_tx, shutdown) = shutdown_signal()?;

    let client = WorkerClient::connect(WorkerClientConfig {
        call_addr: config.broker.call_addr,
        event_addr: config.broker.event_addr,
        request_timeout: Duration::from_millis(config.connection.call_timeout_ms),
        reconnect: config.backoff_policy(),
        max_reconnect_attempts: None,
    })
    .await
    .context("failed to connect to sidecar")?;

    let dedup = Arc::new(Deduplicator::new(config.dedup_window()));
    let dead_letters = DeadLetterStore::in_memory(config.dead_letter());
    let pipeline = Arc::new(
        EventPipeline::new(
            Arc::new(LogClassifier::new()),
            Arc::new(LoggingHandler {
                log_slots: args.log_slots,
            }),
            dedup.clone(),
            config.backoff_policy(),
        )
        .with_dead_letters(dead_letters.clone()),
    );

    let mut tasks = Vec::new();

    let sweep_interval = config.dedup_sweep_interval();
    let sweep_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        dedup.run_sweeper(sweep_interval, sweep_shutdown).await;
    }));

    let redrive_pipeline = pipeline.clone();
    tasks.push(tokio::spawn(dead_letters.run_maintenance(
        config.maintenance(),
        move |payload| {
            let pipeline = redrive_pipeline.clone();
            async move { pipeline.redrive(payload).await }
        },
        shutdown.clone(),
    )));

    for channel in &args.channels {
        let events = client
            .subscribe(channel)
            .await
            .with_context(|| format!("failed to subscribe to {}", channel))?;
        let pipeline = pipeline.clone();
        let channel_shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            pipeline.run(events, channel_shutdown).await;
        }));
    }

    let mut shutdown_wait = shutdown.clone();
    if shutdown_wait.wait_for(|stop| *stop).await.is_err() {
        error!("shutdown signal dropped");
    }

    info!("Shutting down...");
    for channel in &args.channels {
        if let Err(e) = client.unsubscribe(channel).await {
            debug!(channel = %channel, error = %e, "unsubscribe on shutdown failed");
        }
    }
    client.close();
    for task in tasks {
        let _ = task.await;
    }

    let stats = pipeline.stats();
    info!("=== Final Statistics ===");
    info!("Handled: {}", stats.handled.load(std::sync::atomic::Ordering::Relaxed));
    info!("Duplicates: {}", stats.duplicates.load(std::sync::atomic::Ordering::Relaxed));
    info!("Failed: {}", stats.failed.load(std::sync::atomic::Ordering::Relaxed));
    Ok(())
}
