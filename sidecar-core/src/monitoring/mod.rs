//! Monitoring and observability
//!
//! Prometheus metrics, the `/health` report and the HTTP server that
//! exposes both.

pub mod health;
pub mod metrics;
pub mod server;

pub use health::{HealthMonitor, HealthReport};
pub use metrics::{BrokerMetrics, ConnectionMetrics, MetricsRegistry, ResilienceMetrics};
pub use server::{encode_metrics, MonitoringServer, MonitoringServerConfig};
