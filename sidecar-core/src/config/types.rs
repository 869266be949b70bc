use crate::broker::BrokerServerConfig;
use crate::connection::{CallPolicy, ConnectionConfig};
use crate::monitoring::MonitoringServerConfig;
use crate::resilience::{BackoffPolicy, CircuitBreakerConfig, DeadLetterConfig, MaintenanceSchedule};
use crate::upstream::JsonRpcConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    pub upstream: UpstreamSection,
    pub connection: ConnectionSection,
    pub backoff: BackoffSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub dead_letter: DeadLetterSection,
    pub dedup: DedupSection,
    pub broker: BrokerSection,
    pub monitoring: MonitoringSection,
    pub logging: LoggingSection,
}

/// Upstream provider endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSection {
    /// HTTP JSON-RPC endpoint
    pub rpc_url: String,

    /// WebSocket pub/sub endpoint
    #[serde(default)]
    pub ws_url: Option<String>,

    /// Refuse to start without `ws_url`
    pub require_streaming: bool,

    /// Commitment level for subscriptions: processed, confirmed, finalized
    pub commitment: String,

    /// Method probed on connect
    pub health_method: String,

    pub request_timeout_ms: u64,
    pub ping_interval_secs: u64,
}

/// Reconnection and call queuing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    /// 0 disables automatic reconnection
    pub max_reconnect_attempts: u32,
    pub call_policy: CallPolicy,
    pub max_queued_calls: usize,
    pub max_queue_wait_ms: u64,
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSection {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub rate_limit_base_delay_ms: u64,
    pub rate_limit_multiplier: f64,
    /// Fraction of the delay, 0.0 to 1.0
    pub jitter_factor: f64,
    /// Attempts per call, including the first
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
    pub half_open_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterSection {
    pub max_retries: u32,
    pub retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub redrive_interval_secs: u64,
    pub redrive_batch: usize,

    /// JSON-lines file; entries stay in memory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupSection {
    pub window_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Local transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    pub call_addr: SocketAddr,
    pub event_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSection {
    pub enabled: bool,
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// trace, debug, info, warn, error (RUST_LOG wins when set)
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl SidecarConfig {
    /// Endpoint settings for the JSON-RPC connector
    pub fn json_rpc(&self) -> anyhow::Result<JsonRpcConfig> {
        let rpc_url = Url::parse(&self.upstream.rpc_url).map_err(|e| {
            anyhow::anyhow!("invalid upstream.rpc_url '{}': {}", self.upstream.rpc_url, e)
        })?;
        let ws_url = match &self.upstream.ws_url {
            Some(raw) => Some(
                Url::parse(raw)
                    .map_err(|e| anyhow::anyhow!("invalid upstream.ws_url '{}': {}", raw, e))?,
            ),
            None => None,
        };
        Ok(JsonRpcConfig {
            rpc_url,
            ws_url,
            commitment: self.upstream.commitment.clone(),
            health_method: self.upstream.health_method.clone(),
            request_timeout: Duration::from_millis(self.upstream.request_timeout_ms),
            ping_interval: Duration::from_secs(self.upstream.ping_interval_secs),
        })
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        let b = &self.backoff;
        BackoffPolicy {
            base_delay: Duration::from_millis(b.base_delay_ms),
            multiplier: b.multiplier,
            max_delay: Duration::from_millis(b.max_delay_ms),
            rate_limit_base_delay: Duration::from_millis(b.rate_limit_base_delay_ms),
            rate_limit_multiplier: b.rate_limit_multiplier,
            jitter_factor: b.jitter_factor,
            max_attempts: b.max_attempts,
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        let c = &self.circuit_breaker;
        CircuitBreakerConfig {
            failure_threshold: c.failure_threshold,
            success_threshold: c.success_threshold,
            timeout: Duration::from_millis(c.timeout_ms),
            half_open_attempts: c.half_open_attempts,
        }
    }

    pub fn connection(&self) -> ConnectionConfig {
        let c = &self.connection;
        ConnectionConfig {
            name: "upstream".to_string(),
            require_streaming: self.upstream.require_streaming,
            max_reconnect_attempts: c.max_reconnect_attempts,
            reconnect_backoff: self.backoff_policy(),
            call_retry: self.backoff_policy(),
            call_policy: c.call_policy,
            max_queued_calls: c.max_queued_calls,
            max_queue_wait: Duration::from_millis(c.max_queue_wait_ms),
            call_timeout: Duration::from_millis(c.call_timeout_ms),
            breaker: self.circuit_breaker(),
        }
    }

    pub fn dead_letter(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            max_retries: self.dead_letter.max_retries,
            retention: Duration::from_secs(self.dead_letter.retention_secs),
        }
    }

    pub fn maintenance(&self) -> MaintenanceSchedule {
        MaintenanceSchedule {
            cleanup_interval: Duration::from_secs(self.dead_letter.cleanup_interval_secs),
            redrive_interval: Duration::from_secs(self.dead_letter.redrive_interval_secs),
            redrive_batch: self.dead_letter.redrive_batch,
        }
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup.window_secs)
    }

    pub fn dedup_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dedup.sweep_interval_secs)
    }

    pub fn broker_server(&self) -> BrokerServerConfig {
        BrokerServerConfig {
            call_addr: self.broker.call_addr,
            event_addr: self.broker.event_addr,
        }
    }

    pub fn monitoring_server(&self) -> MonitoringServerConfig {
        MonitoringServerConfig {
            listen_addr: self.monitoring.listen_addr,
            ..MonitoringServerConfig::default()
        }
    }
}
