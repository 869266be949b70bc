//! HTTP server for health and Prometheus metrics
//!
//! - `GET /health` → [`HealthReport`](super::HealthReport) as JSON (503 while unhealthy)
//! - `GET /metrics` → Prometheus text format

use super::{HealthMonitor, MetricsRegistry};
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Monitoring server settings
#[derive(Debug, Clone)]
pub struct MonitoringServerConfig {
    pub listen_addr: SocketAddr,
    pub metrics_path: String,
    pub health_path: String,
}

impl Default for MonitoringServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            metrics_path: "/metrics".to_string(),
            health_path: "/health".to_string(),
        }
    }
}

#[derive(Clone)]
struct Routes {
    health: HealthMonitor,
    metrics: MetricsRegistry,
    metrics_path: String,
    health_path: String,
}

/// Serves `/health` and `/metrics`
pub struct MonitoringServer {
    config: MonitoringServerConfig,
    routes: Routes,
}

impl MonitoringServer {
    pub fn new(
        config: MonitoringServerConfig,
        health: HealthMonitor,
        metrics: MetricsRegistry,
    ) -> Self {
        let routes = Routes {
            health,
            metrics,
            metrics_path: config.metrics_path.clone(),
            health_path: config.health_path.clone(),
        };
        Self { config, routes }
    }

    /// Bind the configured address and serve until `shutdown` flips to true
    pub async fn serve(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| {
                format!("failed to bind monitoring server on {}", self.config.listen_addr)
            })?;
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let local = listener.local_addr().context("monitoring listener has no address")?;
        info!(
            "Monitoring server listening on http://{} ({}, {})",
            local, self.routes.health_path, self.routes.metrics_path
        );

        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Monitoring server stopping");
                    return Ok(());
                }
            };

            let routes = self.routes.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let routes = routes.clone();
                    async move {
                        Ok::<_, Infallible>(routes.handle(req.method(), req.uri().path()).await)
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error from {}: {}", remote_addr, err);
                }
            });
        }
    }
}

impl Routes {
    async fn handle(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        debug!("Monitoring request: {} {}", method, path);

        if method != Method::GET {
            return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed");
        }

        if path == self.health_path {
            let report = self.health.report().await;
            let status = if report.is_healthy() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            return match serde_json::to_vec(&report) {
                Ok(body) => respond(status, "application/json", body),
                Err(e) => {
                    error!("Failed to encode health report: {}", e);
                    internal_error(e)
                }
            };
        }

        if path == self.metrics_path {
            // Sampled gauges are refreshed on every scrape
            self.health.report().await;
            return match encode_metrics(&self.metrics) {
                Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    internal_error(e)
                }
            };
        }

        respond(StatusCode::NOT_FOUND, "text/plain", "Not Found")
    }
}

fn internal_error(e: impl std::fmt::Display) -> Response<Full<Bytes>> {
    respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", format!("Error: {}", e))
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Encode metrics to Prometheus text format
pub fn encode_metrics(registry: &MetricsRegistry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.registry().gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;

    String::from_utf8(buffer).context("Invalid UTF-8 in metrics")
}
