//! Prometheus metrics for the reconcile loop
//!
//! Counters are recorded through the `metrics` facade and rendered by the
//! Prometheus exporter on `GET /metrics`. The endpoint is plain HTTP unless
//! `--metrics-secure` is set, in which case it reuses the webhook certificate.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use rustls::ServerConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use crate::webhook::{serve_tls, WebhookError};

/// Default bind address of the metrics endpoint
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

pub const METRICS_PATH: &str = "/metrics";

/// Metric names
pub mod names {
    pub const RECONCILE_TOTAL: &str = "debezium_operator_reconcile_total";
    pub const RECONCILE_ACTIONS_TOTAL: &str = "debezium_operator_reconcile_actions_total";
    pub const RECONCILE_ERRORS_TOTAL: &str = "debezium_operator_reconcile_errors_total";
    pub const RECONCILE_DURATION_SECONDS: &str = "debezium_operator_reconcile_duration_seconds";
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to install Prometheus recorder: {0}")]
    Install(#[from] BuildError),
    #[error("failed to bind metrics listener: {0}")]
    Bind(std::io::Error),
    #[error("metrics server failed: {0}")]
    Serve(std::io::Error),
    #[error("secure metrics server failed: {0}")]
    Tls(#[from] WebhookError),
}

/// Install the process-wide Prometheus recorder
///
/// Call once at startup, before the controller records anything.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("Prometheus recorder installed");
    Ok(handle)
}

/// Record a pass that finished with `action`
pub fn record_success(action: &'static str, duration: Duration) {
    counter!(names::RECONCILE_TOTAL, "result" => "success").increment(1);
    counter!(names::RECONCILE_ACTIONS_TOTAL, "action" => action).increment(1);
    histogram!(names::RECONCILE_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Record a pass that failed with an error of kind `reason`
pub fn record_failure(reason: &'static str, duration: Duration) {
    counter!(names::RECONCILE_TOTAL, "result" => "error").increment(1);
    counter!(names::RECONCILE_ERRORS_TOTAL, "reason" => reason).increment(1);
    histogram!(names::RECONCILE_DURATION_SECONDS).record(duration.as_secs_f64());
}

pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route(METRICS_PATH, get(render))
        .with_state(handle)
}

async fn render(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

/// Run the metrics server
///
/// Serves HTTPS when `tls` is given, plain HTTP otherwise. Runs until the
/// listener fails.
pub async fn run_metrics_server(
    handle: PrometheusHandle,
    addr: SocketAddr,
    tls: Option<ServerConfig>,
    enable_http2: bool,
) -> Result<(), MetricsError> {
    let app = router(handle);

    match tls {
        Some(tls) => {
            info!(addr = %addr, secure = true, "Metrics server listening");
            serve_tls(addr, tls, app, enable_http2).await?;
            Ok(())
        }
        None => {
            let listener = TcpListener::bind(addr).await.map_err(MetricsError::Bind)?;
            info!(addr = %addr, secure = false, "Metrics server listening");
            axum::serve(listener, app).await.map_err(MetricsError::Serve)
        }
    }
}
