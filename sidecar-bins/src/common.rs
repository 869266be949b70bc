//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::{Context, Result};
use clap::Parser;
use sidecar_core::resilience::install_panic_hook;
use sidecar_core::utils::init_logger;
use sidecar_core::SidecarConfig;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, warn};

/// Common CLI arguments for all binaries
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CommonArgs {
    /// TOML configuration file (SIDECAR__* environment variables override it)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level, overrides logging.level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    pub json_logs: bool,
}

impl CommonArgs {
    /// Load configuration and apply command-line overrides
    pub fn load_config(&self) -> Result<SidecarConfig> {
        let mut config =
            SidecarConfig::load(self.config.as_deref()).with_context(|| match &self.config {
                Some(path) => format!("failed to load configuration from {}", path.display()),
                None => "failed to load configuration".to_string(),
            })?;

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Logging, panic hook and TLS provider; call once at startup
pub fn init_process(config: &SidecarConfig) -> Result<()> {
    init_logger(&config.logging.level, config.logging.json)?;
    install_panic_hook();

    // reqwest and tungstenite both use rustls; pick the provider once
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }
    Ok(())
}

/// Shutdown flag flipped by Ctrl+C
pub fn shutdown_signal() -> Result<(watch::Sender<bool>, watch::Receiver<bool>)> {
    let (tx, rx) = watch::channel(false);
    let handler_tx = tx.clone();
    ctrlc::set_handler(move || {
        warn!("Received Ctrl+C, initiating graceful shutdown...");
        handler_tx.send_replace(true);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok((tx, rx))
}

/// Log the effective configuration at startup
pub fn log_config(config: &SidecarConfig) {
    info!("=== Configuration ===");
    info!("Upstream RPC: {}", config.upstream.rpc_url);
    info!(
        "Upstream WS: {}",
        config.upstream.ws_url.as_deref().unwrap_or("<none>")
    );
    info!(
        "Broker: call={} event={}",
        config.broker.call_addr, config.broker.event_addr
    );
    info!(
        "Call policy: {:?}, max reconnect attempts: {}",
        config.connection.call_policy, config.connection.max_reconnect_attempts
    );
    match &config.dead_letter.path {
        Some(path) => info!("Dead letters: {}", path.display()),
        None => info!("Dead letters: in memory"),
    }
}
