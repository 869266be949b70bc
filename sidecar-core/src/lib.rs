//! Sidecar Core - resilient upstream connection and event fan-out
//!
//! One process (the sidecar) owns the single upstream RPC + streaming
//! connection and shares it with many worker processes over local TCP.
//! Every upstream call runs through retry and a circuit breaker; failures
//! that survive both land in a dead-letter store; workers deduplicate
//! events before their handlers see them.
//!
//! ## Architecture
//! ```text
//! WorkerClient --(local TCP)--> SubscriptionBroker --> ConnectionManager --> provider
//!      ^                               |
//!      +-------- event fan-out --------+
//! ```
//!
//! ## Modules
//! - `core`: error taxonomy, channel keys, connection typestate
//! - `resilience`: backoff, retry, circuit breaker, dead letters, dedup
//! - `storage`: dead-letter repositories (memory, JSON lines)
//! - `upstream`: transport seam and the JSON-RPC/WebSocket connector
//! - `connection`: `ConnectionManager`
//! - `broker`: local wire protocol, fan-out and TCP listeners
//! - `client`: `WorkerClient`
//! - `pipeline`: worker-side decode/dedup/handle chain
//! - `monitoring`: Prometheus metrics, health report, HTTP server
//! - `config`: layered configuration

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod core;
pub mod monitoring;
pub mod pipeline;
pub mod resilience;
pub mod storage;
pub mod testing;
pub mod upstream;
pub mod utils;

pub use crate::core::{ChannelKey, ConnectionStatus, SidecarError, SidecarResult};
pub use broker::{BrokerServer, SubscriptionBroker};
pub use client::{WorkerClient, WorkerClientConfig};
pub use config::SidecarConfig;
pub use connection::{ConnectionConfig, ConnectionManager};
pub use pipeline::{EventPipeline, LogClassifier};

// Re-export error types
pub use anyhow::{Error, Result};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::broker::{BrokerServer, BrokerServerConfig, SubscriptionBroker};
    pub use crate::client::{EventSubscription, WorkerClient, WorkerClientConfig};
    pub use crate::config::SidecarConfig;
    pub use crate::connection::{CallPolicy, ConnectionConfig, ConnectionManager};
    pub use crate::core::{ChannelKey, ConnectionStatus, SidecarError, SidecarResult};
    pub use crate::monitoring::{HealthMonitor, MetricsRegistry, MonitoringServer};
    pub use crate::pipeline::{
        ChainEvent, EventDecoder, EventHandler, EventKind, EventPipeline, LogClassifier,
    };
    pub use crate::resilience::{
        retry_with_backoff, BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, DeadLetterStore,
        Deduplicator,
    };
    pub use crate::upstream::{JsonRpcConfig, JsonRpcConnector};
}
