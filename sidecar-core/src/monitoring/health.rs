//! Health report for the sidecar
//!
//! Aggregates connection state, subscriptions, breaker states and the
//! dead-letter backlog into the JSON document served on `/health`.
//! Building a report also refreshes the gauges that are cheaper to sample
//! than to maintain (breaker states, dead-letter count, uptime).

use super::MetricsRegistry;
use crate::connection::{ConnectionManager, ConnectionStats};
use crate::core::types::ConnectionStatus;
use crate::resilience::{CircuitBreakerRegistry, CircuitState, DeadLetterStore};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::warn;

/// `/health` document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub connection_state: ConnectionStatus,
    /// Distinct channel keys with a subscription on file
    pub active_subscriptions: usize,
    pub circuit_breaker_states: BTreeMap<String, CircuitState>,
    /// `None` when no dead-letter store is attached or it could not be read
    pub dead_letter_count: Option<usize>,
    pub uptime_ms: u64,
    pub connection: ConnectionStats,
}

impl HealthReport {
    /// Serving traffic: upstream connected and no breaker open
    pub fn is_healthy(&self) -> bool {
        self.connection_state == ConnectionStatus::Connected
            && self
                .circuit_breaker_states
                .values()
                .all(|s| *s != CircuitState::Open)
    }
}

/// Builds [`HealthReport`]s from the live components
#[derive(Clone)]
pub struct HealthMonitor {
    connection: ConnectionManager,
    breakers: CircuitBreakerRegistry,
    dead_letters: Option<DeadLetterStore>,
    metrics: Option<MetricsRegistry>,
    started_at: Instant,
}

impl HealthMonitor {
    pub fn new(connection: ConnectionManager, breakers: CircuitBreakerRegistry) -> Self {
        Self {
            connection,
            breakers,
            dead_letters: None,
            metrics: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_dead_letters(mut self, store: DeadLetterStore) -> Self {
        self.dead_letters = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn report(&self) -> HealthReport {
        let dead_letter_count = match &self.dead_letters {
            Some(store) => match store.count().await {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(error = %e, "dead-letter count unavailable");
                    None
                }
            },
            None => None,
        };

        let stats = self.connection.stats();
        let report = HealthReport {
            connection_state: stats.status,
            active_subscriptions: stats.active_subscriptions,
            circuit_breaker_states: self.breakers.states(),
            dead_letter_count,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            connection: stats,
        };

        if let Some(metrics) = &self.metrics {
            self.refresh_gauges(metrics, &report);
        }
        report
    }

    fn refresh_gauges(&self, metrics: &MetricsRegistry, report: &HealthReport) {
        let resilience = metrics.resilience();
        for (name, state) in &report.circuit_breaker_states {
            resilience
                .circuit_state
                .with_label_values(&[name.as_str()])
                .set(state.as_gauge());
        }
        for (name, snapshot) in self.breakers.snapshots() {
            let counter = resilience.circuit_rejections_total.with_label_values(&[name.as_str()]);
            let seen = counter.get();
            if snapshot.rejected > seen {
                counter.inc_by(snapshot.rejected - seen);
            }
        }
        if let Some(count) = report.dead_letter_count {
            resilience.dead_letters.set(count as i64);
        }
        let connection = metrics.connection();
        connection.state.set(report.connection_state.as_gauge());
        connection.uptime_seconds.set((report.uptime_ms / 1000) as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::core::errors::SidecarError;
    use crate::resilience::{CircuitBreakerConfig, DeadLetterConfig};
    use crate::testing::{logs_key, MockConnector};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_report_reflects_components() {
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let mock = MockConnector::new();
        let config = ConnectionConfig::default();
        let connection = ConnectionManager::with_parts(
            Arc::new(mock),
            config.clone(),
            breakers.get_with(&config.name, config.breaker.clone()),
            None,
        );
        let store = DeadLetterStore::in_memory(DeadLetterConfig::default());
        let metrics = MetricsRegistry::new().unwrap();
        let monitor = HealthMonitor::new(connection.clone(), breakers)
            .with_dead_letters(store.clone())
            .with_metrics(metrics.clone());

        let report = monitor.report().await;
        assert_eq!(report.connection_state, ConnectionStatus::Disconnected);
        assert!(!report.is_healthy());
        assert_eq!(report.dead_letter_count, Some(0));

        connection.connect().await.unwrap();
        connection.subscribe(logs_key(), |_| {}).await.unwrap();
        store
            .add(
                serde_json::json!({"n": 1}),
                &SidecarError::Connection("down".into()),
                Default::default(),
            )
            .await
            .unwrap();

        let report = monitor.report().await;
        assert!(report.is_healthy());
        assert_eq!(report.active_subscriptions, 1);
        assert_eq!(report.dead_letter_count, Some(1));
        assert_eq!(
            report.circuit_breaker_states.get("upstream"),
            Some(&CircuitState::Closed)
        );
        assert_eq!(metrics.resilience().dead_letters.get(), 1);
        assert_eq!(metrics.connection().state.get(), ConnectionStatus::Connected.as_gauge());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["connectionState"], "CONNECTED");
        assert_eq!(json["circuitBreakerStates"]["upstream"], "CLOSED");
        assert!(json["uptimeMs"].is_u64());
    }

    #[tokio::test]
    async fn test_dead_letter_count_null_without_store() {
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let connection = ConnectionManager::new(
            Arc::new(MockConnector::new()),
            ConnectionConfig::default(),
        );
        let report = HealthMonitor::new(connection, breakers).report().await;

        assert_eq!(report.dead_letter_count, None);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["deadLetterCount"].is_null());
    }
}
