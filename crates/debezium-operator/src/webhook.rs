//! Validating admission webhook
//!
//! Serves `POST /validate-dbc` over HTTPS for the API server. Creates and
//! spec-changing updates are passed to a [`Validator`]; every other operation
//! is allowed. Metadata-only updates (finalizer patches) and updates to a
//! record that is being deleted never reach the upstream platform.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use rustls::ServerConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::crd::DebeziumConnector;
use crate::validation::Validator;

/// Path registered in the ValidatingWebhookConfiguration
pub const WEBHOOK_PATH: &str = "/validate-dbc";

/// Default HTTPS port for the webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("I/O error on {path:?}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no private key found in {0:?}")]
    MissingKey(PathBuf),
    #[error("no certificates found in {0:?}")]
    MissingCert(PathBuf),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("failed to bind webhook listener: {0}")]
    Bind(std::io::Error),
}

/// Admission decision for a single request
pub async fn admit(
    validator: &dyn Validator,
    request: &AdmissionRequest<DebeziumConnector>,
) -> AdmissionResponse {
    let response = AdmissionResponse::from(request);

    if !matches!(request.operation, Operation::Create | Operation::Update) {
        return response;
    }

    let Some(resource) = request.object.as_ref() else {
        return response.deny("admission request carries no object");
    };

    if matches!(request.operation, Operation::Update) {
        if resource.deletion_requested() {
            debug!(name = %request.name, "Admitted update of deleting DebeziumConnector");
            return response;
        }
        if let Some(old) = request.old_object.as_ref() {
            if old.spec == resource.spec {
                debug!(name = %request.name, "Admitted metadata-only update");
                return response;
            }
        }
    }

    match validator.validate(resource).await {
        Ok(()) => {
            debug!(name = %request.name, operation = ?request.operation, "Admitted DebeziumConnector");
            response
        }
        Err(e) => {
            info!(
                name = %request.name,
                namespace = ?request.namespace,
                error = %e,
                "Rejected DebeziumConnector"
            );
            response.deny(e.to_string())
        }
    }
}

async fn validate_handler(
    State(validator): State<Arc<dyn Validator>>,
    Json(review): Json<AdmissionReview<DebeziumConnector>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DebeziumConnector> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    Json(admit(validator.as_ref(), &request).await.into_review())
}

/// HTTP routes served by the webhook
pub fn router(validator: Arc<dyn Validator>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(validate_handler))
        .with_state(validator)
}

/// Build the TLS server config from PEM files
///
/// ALPN advertises `h2` only when HTTP/2 is enabled.
pub fn load_tls_config(
    cert_path: &Path,
    key_path: &Path,
    enable_http2: bool,
) -> Result<ServerConfig, WebhookError> {
    use rustls_pemfile::{certs, private_key};

    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| WebhookError::File {
            path: path.to_path_buf(),
            source,
        })
    };

    let cert_data = read(cert_path)?;
    let cert_chain = certs(&mut BufReader::new(cert_data.as_slice()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| WebhookError::File {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if cert_chain.is_empty() {
        return Err(WebhookError::MissingCert(cert_path.to_path_buf()));
    }

    let key_data = read(key_path)?;
    let key = private_key(&mut BufReader::new(key_data.as_slice()))
        .map_err(|source| WebhookError::File {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| WebhookError::MissingKey(key_path.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    config.alpn_protocols = if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(config)
}

/// Run the HTTPS webhook server
///
/// Runs until the listener fails; spawn it alongside the controller.
pub async fn run_webhook_server(
    addr: SocketAddr,
    tls: ServerConfig,
    validator: Arc<dyn Validator>,
    enable_http2: bool,
) -> Result<(), WebhookError> {
    info!(addr = %addr, http2 = enable_http2, "Webhook server listening");
    serve_tls(addr, tls, router(validator), enable_http2).await
}

/// Serve `app` over TLS on `addr`, one task per connection
///
/// Only returns if the listener cannot be bound.
pub async fn serve_tls(
    addr: SocketAddr,
    tls: ServerConfig,
    app: Router,
    enable_http2: bool,
) -> Result<(), WebhookError> {
    let listener = TcpListener::bind(addr).await.map_err(WebhookError::Bind)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls));

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!(addr = %addr, error = %e, "Error accepting TLS connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(remote = %remote_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);

            let result = if enable_http2 {
                auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
            } else {
                hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                    .map_err(Into::into)
            };

            if let Err(e) = result {
                debug!(remote = %remote_addr, error = %e, "Error serving TLS connection");
            }
        });
    }
}
