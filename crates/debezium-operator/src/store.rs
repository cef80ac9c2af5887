//! Persistence of reconciler-owned fields on DebeziumConnector records
//!
//! The reconciler only ever writes two things back to the API server: its
//! finalizer and the status subresource. Both go through [`ResourceStore`] so
//! the reconcile state machine can be exercised without a cluster.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::crd::{DebeziumConnector, DebeziumConnectorStatus, FINALIZER};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Writes reconciler-owned fields of a DebeziumConnector
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Add the cleanup finalizer to the record
    async fn add_finalizer(&self, resource: &DebeziumConnector) -> Result<(), StoreError>;

    /// Remove the cleanup finalizer, letting the API server finish deletion
    async fn remove_finalizer(&self, resource: &DebeziumConnector) -> Result<(), StoreError>;

    /// Replace the status subresource
    async fn patch_status(
        &self,
        resource: &DebeziumConnector,
        status: &DebeziumConnectorStatus,
    ) -> Result<(), StoreError>;
}

/// [`ResourceStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, resource: &DebeziumConnector) -> Result<(Api<DebeziumConnector>, String), StoreError> {
        let namespace = resource
            .namespace()
            .ok_or_else(|| StoreError::MissingField("metadata.namespace".to_string()))?;
        let name = resource
            .metadata
            .name
            .clone()
            .ok_or_else(|| StoreError::MissingField("metadata.name".to_string()))?;
        Ok((Api::namespaced(self.client.clone(), &namespace), name))
    }
}

/// Merge patch replacing the finalizer list
///
/// Carries the observed resourceVersion so a concurrent writer causes a
/// conflict instead of a lost update.
fn finalizers_patch(resource: &DebeziumConnector, finalizers: Vec<String>) -> Value {
    let mut metadata = json!({ "finalizers": finalizers });
    if let Some(rv) = resource.resource_version() {
        metadata["resourceVersion"] = Value::String(rv);
    }
    json!({ "metadata": metadata })
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    #[instrument(skip(self, resource), fields(name = %resource.name_any()))]
    async fn add_finalizer(&self, resource: &DebeziumConnector) -> Result<(), StoreError> {
        let (api, name) = self.api_for(resource)?;

        let mut finalizers = resource.finalizers().to_vec();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());

        let patch = finalizers_patch(resource, finalizers);
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        debug!("Added finalizer");
        Ok(())
    }

    #[instrument(skip(self, resource), fields(name = %resource.name_any()))]
    async fn remove_finalizer(&self, resource: &DebeziumConnector) -> Result<(), StoreError> {
        let (api, name) = self.api_for(resource)?;

        let finalizers: Vec<String> = resource
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();

        let patch = finalizers_patch(resource, finalizers);
        match api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                debug!("Removed finalizer");
                Ok(())
            }
            // Record already gone, nothing left to guard
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, resource, status), fields(name = %resource.name_any()))]
    async fn patch_status(
        &self,
        resource: &DebeziumConnector,
        status: &DebeziumConnectorStatus,
    ) -> Result<(), StoreError> {
        let (api, name) = self.api_for(resource)?;

        let patch = json!({ "status": status });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::test_support::test_connector;
    use crate::crd::ConnectorPhase;
    use crate::testing::{status_body, FakeApiServer};

    /// Store whose API server answers every request with `status`
    fn recording_store(status: u16) -> (KubeResourceStore, FakeApiServer) {
        let server = FakeApiServer::new(move |_, _| {
            if status == 200 {
                (
                    200,
                    json!({
                        "apiVersion": "api.debezium/v1alpha1",
                        "kind": "DebeziumConnector",
                        "metadata": {"name": "orders-cdc", "namespace": "default"},
                        "spec": {"debeziumHost": "http://dbz:8083", "config": {}}
                    }),
                )
            } else {
                (status, status_body(status, "NotFound"))
            }
        });
        (KubeResourceStore::new(server.client()), server)
    }

    const RESOURCE_PATH: &str = "/apis/api.debezium/v1alpha1/namespaces/default/debeziumconnectors/orders-cdc";

    #[tokio::test]
    async fn test_add_finalizer_patches_metadata() {
        let (store, server) = recording_store(200);
        let mut dbc = test_connector(false, false);
        dbc.metadata.resource_version = Some("42".to_string());

        store.add_finalizer(&dbc).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "PATCH");
        assert_eq!(requests[0].path, RESOURCE_PATH);
        assert_eq!(
            requests[0].body,
            json!({"metadata": {"finalizers": [FINALIZER], "resourceVersion": "42"}})
        );
    }

    #[tokio::test]
    async fn test_add_finalizer_is_noop_when_present() {
        let (store, server) = recording_store(200);
        let dbc = test_connector(true, false);

        store.add_finalizer(&dbc).await.unwrap();

        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_remove_finalizer_keeps_foreign_finalizers() {
        let (store, server) = recording_store(200);
        let mut dbc = test_connector(true, true);
        dbc.metadata
            .finalizers
            .as_mut()
            .unwrap()
            .push("example.com/other".to_string());

        store.remove_finalizer(&dbc).await.unwrap();

        let requests = server.requests();
        assert_eq!(
            requests[0].body,
            json!({"metadata": {"finalizers": ["example.com/other"]}})
        );
    }

    #[tokio::test]
    async fn test_remove_finalizer_tolerates_missing_record() {
        let (store, _server) = recording_store(404);
        let dbc = test_connector(true, true);

        assert!(store.remove_finalizer(&dbc).await.is_ok());
    }

    #[tokio::test]
    async fn test_add_finalizer_surfaces_api_errors() {
        let (store, _server) = recording_store(404);
        let dbc = test_connector(false, false);

        let err = store.add_finalizer(&dbc).await.unwrap_err();
        assert!(matches!(err, StoreError::Kube(_)));
    }

    #[tokio::test]
    async fn test_patch_status_targets_subresource() {
        let (store, server) = recording_store(200);
        let dbc = test_connector(true, false);
        let status = DebeziumConnectorStatus {
            phase: ConnectorPhase::Running,
            conditions: vec![],
        };

        store.patch_status(&dbc, &status).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests[0].path, format!("{RESOURCE_PATH}/status"));
        assert_eq!(requests[0].body["status"]["phase"], "RUNNING");
    }

    #[tokio::test]
    async fn test_missing_namespace_is_rejected() {
        let (store, server) = recording_store(200);
        let mut dbc = test_connector(false, false);
        dbc.metadata.namespace = None;

        let err = store.add_finalizer(&dbc).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingField(_)));
        assert!(server.requests().is_empty());
    }
}
