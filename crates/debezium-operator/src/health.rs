//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness) and `/readyz` (readiness) endpoints.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Default bind address for the probe server.
pub const DEFAULT_HEALTH_ADDR: &str = "0.0.0.0:8081";

/// Shared state for health check endpoints.
#[derive(Debug, Default)]
pub struct HealthState {
    /// Whether the operator has completed startup.
    started: AtomicBool,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the operator as started and ready.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: operator marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Run the health check HTTP server.
///
/// This function runs until the server encounters a fatal error.
/// It should be spawned as a separate task alongside the controller.
/// Readiness is signalled separately via [`HealthState::mark_started`]
/// once the controller and webhook are running.
pub async fn run_health_server(state: Arc<HealthState>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health check server listening");

    axum::serve(listener, router(state)).await
}

/// Liveness probe endpoint.
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 Service Unavailable until startup has completed.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    debug!("Readiness probe: OK");
    StatusCode::OK
}
