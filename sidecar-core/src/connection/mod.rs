//! Upstream connection management
//!
//! [`ConnectionManager`] owns the single upstream session, the reconnect
//! state machine and the subscription table. Everything else reaches the
//! provider through it.

mod manager;
mod subscriptions;

pub use manager::{CancelFailure, ConnectionManager, NotificationHandler};

use crate::core::errors::SidecarError;
use crate::core::types::ConnectionStatus;
use crate::resilience::{BackoffPolicy, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What `call()` does while the connection is recovering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPolicy {
    /// Wait in a bounded queue for the connection to come back
    #[default]
    Queue,
    /// Reject at once with `NotConnected`
    FailFast,
}

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Name used in logs and for the upstream breaker
    pub name: String,
    /// Refuse to connect without a streaming endpoint
    pub require_streaming: bool,
    /// Attempts per reconnect cycle; 0 disables automatic reconnection
    pub max_reconnect_attempts: u32,
    /// Delays between reconnect attempts
    pub reconnect_backoff: BackoffPolicy,
    /// Retries of individual calls
    pub call_retry: BackoffPolicy,
    pub call_policy: CallPolicy,
    pub max_queued_calls: usize,
    pub max_queue_wait: Duration,
    /// Default timeout when the caller gives none
    pub call_timeout: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "upstream".to_string(),
            require_streaming: true,
            max_reconnect_attempts: 10,
            reconnect_backoff: BackoffPolicy::default(),
            call_retry: BackoffPolicy::default(),
            call_policy: CallPolicy::Queue,
            max_queued_calls: 256,
            max_queue_wait: Duration::from_secs(5),
            call_timeout: Duration::from_secs(15),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Broadcast to connection observers
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionNotification {
    Connected,
    Disconnected { reason: String },
    Error { error: SidecarError },
}

/// Counters and gauges for health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub status: ConnectionStatus,
    pub disconnect_count: u64,
    pub reconnect_attempts: u64,
    pub successful_reconnects: u64,
    /// Failed attempts in the current reconnect cycle
    pub current_attempt: u32,
    pub uptime_ms: u64,
    /// Distinct channel keys on file
    pub active_subscriptions: usize,
    /// Local subscribers across all keys
    pub local_subscribers: usize,
}
