//! Kafka Connect REST client
//!
//! Stateless adapter over the connector-management API exposed by a Debezium
//! (Kafka Connect) cluster. Every call takes the base URL of the cluster, so a
//! single client serves connectors living on any number of hosts.
//!
//! | Operation    | Request                           | Success         |
//! |--------------|-----------------------------------|-----------------|
//! | `exists`     | `GET /connectors/{name}`          | 200 / 404       |
//! | `get_config` | `GET /connectors/{name}/config`   | 200             |
//! | `create`     | `POST /connectors`                | 200 or 201      |
//! | `update`     | `PUT /connectors/{name}/config`   | 200             |
//! | `delete`     | `DELETE /connectors/{name}`       | 200 or 204      |
//! | `status`     | `GET /connectors/{name}/status`   | 200             |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Default upstream request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connector configuration as exchanged with the upstream API
pub type ConnectorConfig = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{operation} returned status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("failed to decode {operation} response: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
    #[error("invalid connector host '{0}'")]
    InvalidHost(String),
}

impl UpstreamError {
    /// Whether the upstream answered with 404 Not Found
    pub fn is_not_found(&self) -> bool {
        matches!(self, UpstreamError::Status { status: 404, .. })
    }
}

/// Result of an existence lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorPresence {
    Present,
    Absent,
}

/// State of the connector or one of its tasks as reported by `/status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    pub state: String,
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// Task entry of a `/status` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: u32,
    pub state: String,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
}

/// Runtime status reported by the upstream platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorRuntimeStatus {
    pub connector: WorkerState,
    #[serde(default)]
    pub tasks: Vec<TaskState>,
}

/// Observed state of a connector, rebuilt on every reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalConnectorState {
    pub exists: bool,
    /// Active configuration, only when `exists`
    pub config: Option<ConnectorConfig>,
    pub runtime_status: Option<ConnectorRuntimeStatus>,
}

impl ExternalConnectorState {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn present(config: ConnectorConfig) -> Self {
        Self {
            exists: true,
            config: Some(config),
            runtime_status: None,
        }
    }
}

/// Trait for connector-management operations
///
/// Allows mocking the upstream platform in reconciler tests while keeping the
/// HTTP implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectorControl: Send + Sync {
    /// Look up whether the named connector exists
    ///
    /// Only 404 means absent; any other non-200 response is an error.
    async fn exists(&self, host: &str, name: &str) -> Result<ConnectorPresence, UpstreamError>;

    /// Fetch the configuration currently active upstream
    async fn get_config(&self, host: &str, name: &str) -> Result<ConnectorConfig, UpstreamError>;

    /// Create a connector from a full configuration (`config["name"]` names it)
    async fn create(&self, host: &str, config: &ConnectorConfig) -> Result<(), UpstreamError>;

    /// Replace the configuration of an existing connector
    async fn update(
        &self,
        host: &str,
        name: &str,
        config: &ConnectorConfig,
    ) -> Result<(), UpstreamError>;

    /// Delete a connector
    ///
    /// A 404 is returned as an error; callers decide whether absence is success.
    async fn delete(&self, host: &str, name: &str) -> Result<(), UpstreamError>;

    /// Fetch the runtime status of a connector and its tasks
    async fn status(&self, host: &str, name: &str)
        -> Result<ConnectorRuntimeStatus, UpstreamError>;
}

/// Request body for `POST /connectors`
#[derive(Debug, Serialize)]
struct CreateConnectorRequest<'a> {
    name: &'a str,
    config: &'a ConnectorConfig,
}

/// HTTP client for the Kafka Connect REST API
#[derive(Clone)]
pub struct ConnectClient {
    http: reqwest::Client,
}

impl ConnectClient {
    /// Create a client whose every request is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    /// Create a client with the default 10 second timeout
    pub fn with_defaults() -> Result<Self, UpstreamError> {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// Build `{host}/{segments...}`, percent-encoding each segment
pub(crate) fn endpoint(host: &str, segments: &[&str]) -> Result<Url, UpstreamError> {
    let mut url = Url::parse(host).map_err(|_| UpstreamError::InvalidHost(host.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| UpstreamError::InvalidHost(host.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Turn an unexpected response into an error carrying its body
pub(crate) async fn unexpected(operation: &'static str, response: Response) -> UpstreamError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    UpstreamError::Status {
        operation,
        status,
        body,
    }
}

#[async_trait]
impl ConnectorControl for ConnectClient {
    #[instrument(skip(self))]
    async fn exists(&self, host: &str, name: &str) -> Result<ConnectorPresence, UpstreamError> {
        let url = endpoint(host, &["connectors", name])?;
        let response = self.http.get(url).send().await?;

        match response.status() {
            StatusCode::OK => Ok(ConnectorPresence::Present),
            StatusCode::NOT_FOUND => Ok(ConnectorPresence::Absent),
            _ => Err(unexpected("exists", response).await),
        }
    }

    #[instrument(skip(self))]
    async fn get_config(&self, host: &str, name: &str) -> Result<ConnectorConfig, UpstreamError> {
        let url = endpoint(host, &["connectors", name, "config"])?;
        let response = self.http.get(url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(unexpected("get_config", response).await);
        }

        response
            .json::<ConnectorConfig>()
            .await
            .map_err(|e| UpstreamError::Decode {
                operation: "get_config",
                message: e.to_string(),
            })
    }

    #[instrument(skip(self, config))]
    async fn create(&self, host: &str, config: &ConnectorConfig) -> Result<(), UpstreamError> {
        let url = endpoint(host, &["connectors"])?;
        let name = config.get(crate::crd::CONFIG_NAME).map(String::as_str).unwrap_or_default();
        let body = CreateConnectorRequest { name, config };

        let response = self.http.post(url).json(&body).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                debug!(connector = %name, "Created connector");
                Ok(())
            }
            _ => Err(unexpected("create", response).await),
        }
    }

    #[instrument(skip(self, config))]
    async fn update(
        &self,
        host: &str,
        name: &str,
        config: &ConnectorConfig,
    ) -> Result<(), UpstreamError> {
        let url = endpoint(host, &["connectors", name, "config"])?;
        let response = self.http.put(url).json(config).send().await?;

        if response.status() != StatusCode::OK {
            return Err(unexpected("update", response).await);
        }

        debug!(connector = %name, "Updated connector config");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, host: &str, name: &str) -> Result<(), UpstreamError> {
        let url = endpoint(host, &["connectors", name])?;
        let response = self.http.delete(url).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => {
                debug!(connector = %name, "Deleted connector");
                Ok(())
            }
            _ => Err(unexpected("delete", response).await),
        }
    }

    #[instrument(skip(self))]
    async fn status(
        &self,
        host: &str,
        name: &str,
    ) -> Result<ConnectorRuntimeStatus, UpstreamError> {
        let url = endpoint(host, &["connectors", name, "status"])?;
        let response = self.http.get(url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(unexpected("status", response).await);
        }

        response
            .json::<ConnectorRuntimeStatus>()
            .await
            .map_err(|e| UpstreamError::Decode {
                operation: "status",
                message: e.to_string(),
            })
    }
}

/// Implement trait for Arc-wrapped clients to support shared ownership
#[async_trait]
impl<T: ConnectorControl + ?Sized> ConnectorControl for Arc<T> {
    async fn exists(&self, host: &str, name: &str) -> Result<ConnectorPresence, UpstreamError> {
        (**self).exists(host, name).await
    }

    async fn get_config(&self, host: &str, name: &str) -> Result<ConnectorConfig, UpstreamError> {
        (**self).get_config(host, name).await
    }

    async fn create(&self, host: &str, config: &ConnectorConfig) -> Result<(), UpstreamError> {
        (**self).create(host, config).await
    }

    async fn update(
        &self,
        host: &str,
        name: &str,
        config: &ConnectorConfig,
    ) -> Result<(), UpstreamError> {
        (**self).update(host, name, config).await
    }

    async fn delete(&self, host: &str, name: &str) -> Result<(), UpstreamError> {
        (**self).delete(host, name).await
    }

    async fn status(
        &self,
        host: &str,
        name: &str,
    ) -> Result<ConnectorRuntimeStatus, UpstreamError> {
        (**self).status(host, name).await
    }
}
