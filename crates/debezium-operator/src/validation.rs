//! Admission-time validation of DebeziumConnector resources
//!
//! Local checks run first. Only when they pass is the config sent to the
//! target cluster's `connector-plugins/{class}/config/validate` endpoint, so an
//! obviously broken record never costs an upstream round trip.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::connect::{endpoint, unexpected, ConnectorConfig, UpstreamError, DEFAULT_TIMEOUT};
use crate::crd::{DebeziumConnector, CONFIG_CONNECTOR_CLASS, CONFIG_NAME};

/// A single rejected field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path into the resource, e.g. `spec.config.database.port`
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid DebeziumConnector: {}", join_fields(.0))]
    Invalid(Vec<FieldError>),
    #[error("connector validation endpoint failed: {0}")]
    Upstream(#[from] UpstreamError),
}

impl ValidationError {
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ValidationError::Invalid(fields) => fields,
            ValidationError::Upstream(_) => &[],
        }
    }
}

/// Decides whether a create or update of a DebeziumConnector is admitted
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, resource: &DebeziumConnector) -> Result<(), ValidationError>;
}

#[async_trait]
impl<T: Validator + ?Sized> Validator for Arc<T> {
    async fn validate(&self, resource: &DebeziumConnector) -> Result<(), ValidationError> {
        (**self).validate(resource).await
    }
}

/// Checks that need no upstream call
pub fn local_checks(resource: &DebeziumConnector) -> Vec<FieldError> {
    let mut errors = Vec::new();

    if resource.spec.debezium_host.trim().is_empty() {
        errors.push(FieldError::new(
            "spec.debeziumHost",
            "debeziumHost cannot be empty",
        ));
    }
    for key in [CONFIG_CONNECTOR_CLASS, CONFIG_NAME] {
        if !resource.spec.config.contains_key(key) {
            errors.push(FieldError::new(
                format!("spec.config.{key}"),
                format!("config must include key \"{key}\""),
            ));
        }
    }

    errors
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    name: &'a str,
    config: &'a ConnectorConfig,
}

/// Validate endpoint response
///
/// Accepts both a flat `errors` map and the per-config `configs[].value.errors`
/// listing that Kafka Connect returns.
#[derive(Debug, Default, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    errors: BTreeMap<String, String>,
    #[serde(default)]
    configs: Vec<ConfigInfo>,
}

#[derive(Debug, Deserialize)]
struct ConfigInfo {
    value: ConfigValue,
}

#[derive(Debug, Deserialize)]
struct ConfigValue {
    name: String,
    #[serde(default)]
    errors: Vec<String>,
}

impl ValidateResponse {
    fn into_field_errors(self) -> Vec<FieldError> {
        let mut fields: Vec<FieldError> = self
            .errors
            .into_iter()
            .map(|(key, message)| FieldError::new(format!("spec.config.{key}"), message))
            .collect();

        for info in self.configs {
            for message in info.value.errors {
                let path = format!("spec.config.{}", info.value.name);
                if !fields.iter().any(|f| f.path == path && f.message == message) {
                    fields.push(FieldError::new(path, message));
                }
            }
        }

        fields
    }
}

/// Validator backed by the target cluster's plugin validation endpoint
#[derive(Clone)]
pub struct ConnectValidator {
    http: reqwest::Client,
}

impl ConnectValidator {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    pub fn with_defaults() -> Result<Self, UpstreamError> {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl Validator for ConnectValidator {
    #[instrument(skip(self, resource), fields(host = %resource.spec.debezium_host))]
    async fn validate(&self, resource: &DebeziumConnector) -> Result<(), ValidationError> {
        let local = local_checks(resource);
        if !local.is_empty() {
            return Err(ValidationError::Invalid(local));
        }

        let config = &resource.spec.config;
        let class = config
            .get(CONFIG_CONNECTOR_CLASS)
            .map(String::as_str)
            .unwrap_or_default();
        let name = config.get(CONFIG_NAME).map(String::as_str).unwrap_or_default();

        let url = endpoint(
            &resource.spec.debezium_host,
            &["connector-plugins", class, "config", "validate"],
        )?;
        let response = self
            .http
            .post(url)
            .json(&ValidateRequest { name, config })
            .send()
            .await
            .map_err(UpstreamError::from)?;

        if response.status() != StatusCode::OK {
            return Err(unexpected("validate", response).await.into());
        }

        let body: ValidateResponse =
            response
                .json()
                .await
                .map_err(|e| UpstreamError::Decode {
                    operation: "validate",
                    message: e.to_string(),
                })?;

        let fields = body.into_field_errors();
        if fields.is_empty() {
            debug!(connector = %name, "Connector config accepted");
            Ok(())
        } else {
            debug!(connector = %name, errors = fields.len(), "Connector config rejected");
            Err(ValidationError::Invalid(fields))
        }
    }
}
