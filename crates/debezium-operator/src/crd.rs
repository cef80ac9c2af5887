//! DebeziumConnector CRD: the desired state of a single Kafka Connect connector

use std::collections::BTreeMap;
use std::fmt;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer that guards external connector cleanup
pub const FINALIZER: &str = "debeziumconnector.finalizers.api.debezium";

/// Config key holding the connector name on the upstream platform
pub const CONFIG_NAME: &str = "name";

/// Config key holding the connector implementation class
pub const CONFIG_CONNECTOR_CLASS: &str = "connector.class";

/// Condition type written by the reconciler
pub const CONDITION_SYNCED: &str = "Synced";

/// DebeziumConnector spec
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "api.debezium",
    version = "v1alpha1",
    kind = "DebeziumConnector",
    plural = "debeziumconnectors",
    shortname = "dbc",
    namespaced = true,
    status = "DebeziumConnectorStatus",
    printcolumn = r#"{"name":"Host", "type":"string", "jsonPath":".spec.debeziumHost"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DebeziumConnectorSpec {
    /// Base URL of the Kafka Connect REST API (e.g. `http://dbz:8083`)
    pub debezium_host: String,
    /// Connector configuration; must contain `name` and `connector.class`
    pub config: BTreeMap<String, String>,
}

/// Externally observed connector phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorPhase {
    Running,
    Paused,
    TaskFailed,
    #[default]
    Unknown,
}

impl fmt::Display for ConnectorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectorPhase::Running => "RUNNING",
            ConnectorPhase::Paused => "PAUSED",
            ConnectorPhase::TaskFailed => "TASK_FAILED",
            ConnectorPhase::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// DebeziumConnector status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DebeziumConnectorStatus {
    /// Last observed phase of the connector on the upstream platform
    #[serde(default)]
    pub phase: ConnectorPhase,
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Kubernetes-style condition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Synced")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status: "True", "False", or "Unknown"
    pub status: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
}

impl Condition {
    pub fn synced(success: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: CONDITION_SYNCED.to_string(),
            status: if success { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl DebeziumConnector {
    /// Connector name on the upstream platform, taken from `spec.config["name"]`
    pub fn connector_name(&self) -> Option<&str> {
        self.spec.config.get(CONFIG_NAME).map(String::as_str)
    }

    /// Whether the owner has marked this record for removal
    pub fn deletion_requested(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether this operator's cleanup finalizer is registered
    pub fn finalizer_present(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Current status, or the default (UNKNOWN, no conditions)
    pub fn current_status(&self) -> DebeziumConnectorStatus {
        self.status.clone().unwrap_or_default()
    }
}

/// Render the CustomResourceDefinition manifest
pub fn crd_yaml() -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&<DebeziumConnector as kube::CustomResourceExt>::crd())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    pub const TEST_HOST: &str = "http://dbz:8083";
    pub const MYSQL_CLASS: &str = "io.debezium.connector.mysql.MySqlConnector";

    pub fn mysql_config() -> BTreeMap<String, String> {
        BTreeMap::from([
            (CONFIG_NAME.to_string(), "c1".to_string()),
            (CONFIG_CONNECTOR_CLASS.to_string(), MYSQL_CLASS.to_string()),
        ])
    }

    pub fn test_connector(finalizer: bool, deleting: bool) -> DebeziumConnector {
        DebeziumConnector {
            metadata: ObjectMeta {
                name: Some("orders-cdc".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-123".to_string()),
                finalizers: finalizer.then(|| vec![FINALIZER.to_string()]),
                deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            spec: DebeziumConnectorSpec {
                debezium_host: TEST_HOST.to_string(),
                config: mysql_config(),
            },
            status: None,
        }
    }
}
