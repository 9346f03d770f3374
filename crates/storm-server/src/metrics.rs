//! Prometheus metrics and health check HTTP server.
//!
//! When `metrics_port` is set, installs a prometheus recorder and serves
//! `/metrics` and `/health` over HTTP/1. Counters recorded inside
//! storm-cluster (gossip traffic, detected failures, failovers, migrations)
//! land in the same recorder. A poller publishes cluster health as gauges.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Value};
use storm_cluster::HealthStatus;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::coordinator::ClusterCoordinator;

/// Installs the prometheus recorder without starting an HTTP server.
pub fn install_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {e}"))
}

/// Spawns the HTTP server for `/metrics` and `/health` plus the upkeep
/// task the recorder needs.
pub fn spawn_http_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
    coordinator: Arc<ClusterCoordinator>,
) {
    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            upkeep_handle.run_upkeep();
        }
    });

    let started = Instant::now();
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to bind metrics/health server on {addr}: {e}");
                return;
            }
        };

        info!("metrics and health endpoint on http://{addr}");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("metrics listener accept error: {e}");
                    continue;
                }
            };

            let handle = handle.clone();
            let coordinator = Arc::clone(&coordinator);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handle = handle.clone();
                    let coordinator = Arc::clone(&coordinator);
                    async move { handle_request(req, &handle, &coordinator, started) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!("http connection error: {e}");
                }
            });
        }
    });
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    handle: &PrometheusHandle,
    coordinator: &ClusterCoordinator,
    started: Instant,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    match req.uri().path() {
        "/metrics" => Response::builder()
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(handle.render()))),
        "/health" => {
            let (code, body) = health_body(coordinator, started.elapsed());
            Response::builder()
                .status(code)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body.to_string())))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found"))),
    }
}

/// Builds the /health JSON. 200 only when the cluster reports `ok`.
fn health_body(coordinator: &ClusterCoordinator, uptime: Duration) -> (StatusCode, Value) {
    let health = coordinator.registry().health();
    let healthy = health.status == HealthStatus::Ok;
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime.as_secs(),
        "node_id": coordinator.local_id(),
        "cluster": health,
    });
    (code, body)
}

/// Publishes registry health as gauges every `poll_interval`.
pub fn spawn_stats_poller(coordinator: Arc<ClusterCoordinator>, poll_interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let health = coordinator.registry().health();
            gauge!("storm_cluster_nodes").set(coordinator.registry().node_count() as f64);
            gauge!("storm_cluster_nodes_healthy").set(health.healthy_nodes as f64);
            gauge!("storm_cluster_nodes_failed").set(health.failed_nodes as f64);
            gauge!("storm_cluster_slots_covered").set(health.covered_slots as f64);
            gauge!("storm_cluster_ok").set(if health.status == HealthStatus::Ok { 1.0 } else { 0.0 });
        }
    });
}

/// Records one admin command in prometheus metrics.
#[inline]
pub fn record_command(cmd_name: &'static str, is_error: bool) {
    let labels = [("cmd", cmd_name)];
    counter!("storm_admin_commands_total", &labels).increment(1);
    if is_error {
        counter!("storm_admin_commands_errors_total", &labels).increment(1);
    }
}
