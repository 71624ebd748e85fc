//! Health check HTTP server for container orchestration
//!
//! Serves the bridge state to the edge runtime and operators:
//!
//! - `GET /health` - state summary, 503 once the bridge has failed
//! - `GET /ready` - 200 only while connected to the broker
//! - `GET /live` - process liveness
//! - `GET /metrics` - the metrics snapshot as JSON

use crate::observability::metrics::metrics;
use crate::transport::mqtt::BridgeState;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    client_id: String,
    port: u16,
    state_rx: watch::Receiver<BridgeState>,
}

impl HealthServer {
    pub fn new(client_id: String, port: u16, state_rx: watch::Receiver<BridgeState>) -> Self {
        Self {
            client_id,
            port,
            state_rx,
        }
    }

    /// Route table, separate from `start` so it can be exercised in-process
    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_state = self.state_rx.clone();
        let client_id = self.client_id.clone();
        let health_route = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let status = HealthStatus::from_state(&client_id, &health_state.borrow());
                let code = if status.healthy {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&status), code)
            });

        let ready_state = self.state_rx.clone();
        let ready_route = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let ready = *ready_state.borrow() == BridgeState::Connected;
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                warp::reply::with_status(warp::reply::json(&response), code)
            });

        let live_route = warp::path("live")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| {
                warp::reply::json(&LivenessResponse {
                    alive: true,
                    timestamp: current_timestamp(),
                })
            });

        let metrics_route = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().snapshot()));

        health_route.or(ready_route).or(live_route).or(metrics_route)
    }

    /// Bind the listener without serving yet. Port 0 picks a free port.
    pub fn bind(self) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
        warp::serve(self.routes()).try_bind_ephemeral(([0, 0, 0, 0], self.port))
    }

    /// Serve until the task is dropped. A port that cannot be bound is
    /// logged and leaves the bridge running without the endpoint.
    pub async fn start(self) {
        let port = self.port;
        match self.bind() {
            Ok((addr, server)) => {
                tracing::info!("Health server listening on {}", addr);
                server.await;
            }
            Err(e) => tracing::error!("Health server could not bind port {}: {}", port, e),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    healthy: bool,
    client_id: String,
    state: BridgeState,
    uptime_seconds: u64,
    timestamp: u64,
}

impl HealthStatus {
    fn from_state(client_id: &str, state: &BridgeState) -> Self {
        Self {
            healthy: !state.is_terminal(),
            client_id: client_id.to_string(),
            state: state.clone(),
            uptime_seconds: metrics().snapshot().lifecycle.uptime_seconds,
            timestamp: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
