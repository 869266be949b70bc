//! Prometheus metrics for the sidecar
//!
//! Grouped the way the components are:
//! - Connection (state, reconnects, upstream calls, subscriptions)
//! - Broker (local connections, events fanned out)
//! - Resilience (breaker states and rejections, dead letters, dedup drops)

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use tracing::info;

const NAMESPACE: &str = "sidecar";

/// Central registry for all Prometheus metrics
#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    connection: Arc<ConnectionMetrics>,
    broker: Arc<BrokerMetrics>,
    resilience: Arc<ResilienceMetrics>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metric families
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let connection = Arc::new(ConnectionMetrics::new(&registry)?);
        let broker = Arc::new(BrokerMetrics::new(&registry)?);
        let resilience = Arc::new(ResilienceMetrics::new(&registry)?);

        info!("Prometheus metrics registry initialized");

        Ok(Self {
            registry,
            connection,
            broker,
            resilience,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionMetrics {
        &self.connection
    }

    pub fn broker(&self) -> &BrokerMetrics {
        &self.broker
    }

    pub fn resilience(&self) -> &ResilienceMetrics {
        &self.resilience
    }
}

fn register<M: prometheus::core::Collector + Clone + 'static>(
    registry: &Registry,
    metric: M,
) -> Result<M, prometheus::Error> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Upstream connection metrics
pub struct ConnectionMetrics {
    /// 0=DISCONNECTED 1=CONNECTING 2=CONNECTED 3=RECONNECTING 4=FAILED
    pub state: IntGauge,
    /// Reconnect attempts by outcome (success, failure)
    pub reconnects_total: IntCounterVec,
    /// Upstream calls by method and outcome
    pub calls_total: IntCounterVec,
    pub call_duration_seconds: HistogramVec,
    /// Distinct channel keys with an upstream subscription on file
    pub active_subscriptions: IntGauge,
    /// Notifications received from upstream
    pub notifications_total: IntCounter,
    pub uptime_seconds: IntGauge,
}

impl ConnectionMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            state: register(
                registry,
                IntGauge::with_opts(
                    Opts::new("connection_state", "Upstream connection state code")
                        .namespace(NAMESPACE),
                )?,
            )?,
            reconnects_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("reconnects_total", "Upstream reconnect attempts")
                        .namespace(NAMESPACE),
                    &["outcome"],
                )?,
            )?,
            calls_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("upstream_calls_total", "Upstream request/response calls")
                        .namespace(NAMESPACE),
                    &["method", "outcome"],
                )?,
            )?,
            call_duration_seconds: register(
                registry,
                HistogramVec::new(
                    HistogramOpts::new("upstream_call_duration_seconds", "Upstream call latency")
                        .namespace(NAMESPACE)
                        .buckets(vec![
                            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                        ]),
                    &["method"],
                )?,
            )?,
            active_subscriptions: register(
                registry,
                IntGauge::with_opts(
                    Opts::new("active_subscriptions", "Upstream subscriptions on file")
                        .namespace(NAMESPACE),
                )?,
            )?,
            notifications_total: register(
                registry,
                IntCounter::with_opts(
                    Opts::new("notifications_total", "Notifications received from upstream")
                        .namespace(NAMESPACE),
                )?,
            )?,
            uptime_seconds: register(
                registry,
                IntGauge::with_opts(
                    Opts::new("uptime_seconds", "Sidecar uptime in seconds").namespace(NAMESPACE),
                )?,
            )?,
        })
    }
}

/// Local broker metrics
pub struct BrokerMetrics {
    /// Open local connections by transport (call, event)
    pub local_connections: IntGaugeVec,
    /// Call-channel requests by outcome
    pub requests_total: IntCounterVec,
    /// Event frames pushed to local connections
    pub events_broadcast_total: IntCounter,
    /// Malformed frames received from local clients
    pub malformed_frames_total: IntCounter,
}

impl BrokerMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            local_connections: register(
                registry,
                IntGaugeVec::new(
                    Opts::new("local_connections", "Open local client connections")
                        .namespace(NAMESPACE),
                    &["transport"],
                )?,
            )?,
            requests_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("broker_requests_total", "Call-channel requests")
                        .namespace(NAMESPACE),
                    &["outcome"],
                )?,
            )?,
            events_broadcast_total: register(
                registry,
                IntCounter::with_opts(
                    Opts::new("events_broadcast_total", "Event frames pushed to local clients")
                        .namespace(NAMESPACE),
                )?,
            )?,
            malformed_frames_total: register(
                registry,
                IntCounter::with_opts(
                    Opts::new("malformed_frames_total", "Malformed frames from local clients")
                        .namespace(NAMESPACE),
                )?,
            )?,
        })
    }
}

/// Resilience toolkit metrics
pub struct ResilienceMetrics {
    /// 0=CLOSED 1=OPEN 2=HALF_OPEN, by breaker name
    pub circuit_state: IntGaugeVec,
    /// Calls rejected by an open circuit, by breaker name
    pub circuit_rejections_total: IntCounterVec,
    /// Entries currently in the dead-letter store
    pub dead_letters: IntGauge,
    /// Re-drive attempts by outcome
    pub redrives_total: IntCounterVec,
    /// Events dropped as duplicates
    pub dedup_drops_total: IntCounter,
}

impl ResilienceMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            circuit_state: register(
                registry,
                IntGaugeVec::new(
                    Opts::new("circuit_state", "Circuit breaker state code").namespace(NAMESPACE),
                    &["breaker"],
                )?,
            )?,
            circuit_rejections_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("circuit_rejections_total", "Calls rejected by an open circuit")
                        .namespace(NAMESPACE),
                    &["breaker"],
                )?,
            )?,
            dead_letters: register(
                registry,
                IntGauge::with_opts(
                    Opts::new("dead_letters", "Entries in the dead-letter store")
                        .namespace(NAMESPACE),
                )?,
            )?,
            redrives_total: register(
                registry,
                IntCounterVec::new(
                    Opts::new("redrives_total", "Dead-letter re-drive attempts")
                        .namespace(NAMESPACE),
                    &["outcome"],
                )?,
            )?,
            dedup_drops_total: register(
                registry,
                IntCounter::with_opts(
                    Opts::new("dedup_drops_total", "Events dropped as duplicates")
                        .namespace(NAMESPACE),
                )?,
            )?,
        })
    }
}
