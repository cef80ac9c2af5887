//! Deletion guard for DebeziumConnector records
//!
//! The finalizer lives in the record's own metadata, so it survives operator
//! restarts. It is registered before anything is created upstream and removed
//! only once the upstream connector is confirmed gone; while it is present the
//! API server will not remove the record.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::crd::DebeziumConnector;
use crate::store::{ResourceStore, StoreError};

#[derive(Debug, Error)]
pub enum FinalizerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("finalizer consistency violated: {0}")]
    Consistency(String),
}

/// Outcome of [`FinalizerLifecycle::ensure_registered`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    AlreadyPresent,
    Added,
}

/// Proof that the upstream connector no longer exists
///
/// Only an observed delete result can produce one; an ambiguous or cancelled
/// delete has no confirmation and therefore cannot release the finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupConfirmation {
    /// Upstream accepted the delete
    Deleted,
    /// Upstream reported the connector as not found
    AlreadyAbsent,
}

pub struct FinalizerLifecycle {
    store: Arc<dyn ResourceStore>,
}

impl FinalizerLifecycle {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Register the finalizer if it is not already present
    pub async fn ensure_registered(
        &self,
        resource: &DebeziumConnector,
    ) -> Result<Registration, FinalizerError> {
        if resource.finalizer_present() {
            return Ok(Registration::AlreadyPresent);
        }

        self.store.add_finalizer(resource).await?;
        info!("Registered finalizer");
        Ok(Registration::Added)
    }

    /// Remove the finalizer after confirmed upstream cleanup
    ///
    /// Releasing on a record that is not being deleted would leave a live
    /// record unguarded, and is rejected as a consistency violation.
    pub async fn release(
        &self,
        resource: &DebeziumConnector,
        confirmation: CleanupConfirmation,
    ) -> Result<(), FinalizerError> {
        if !resource.deletion_requested() {
            return Err(FinalizerError::Consistency(
                "release requested for a record that is not being deleted".to_string(),
            ));
        }

        if !resource.finalizer_present() {
            debug!("Finalizer already released");
            return Ok(());
        }

        self.store.remove_finalizer(resource).await?;
        info!(cleanup = ?confirmation, "Released finalizer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::test_support::test_connector;
    use crate::store::MockResourceStore;

    fn lifecycle(store: MockResourceStore) -> FinalizerLifecycle {
        FinalizerLifecycle::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_ensure_registered_adds_missing_finalizer() {
        let mut store = MockResourceStore::new();
        store.expect_add_finalizer().times(1).returning(|_| Ok(()));

        let result = lifecycle(store)
            .ensure_registered(&test_connector(false, false))
            .await
            .unwrap();
        assert_eq!(result, Registration::Added);
    }

    #[tokio::test]
    async fn test_ensure_registered_is_idempotent() {
        let mut store = MockResourceStore::new();
        store.expect_add_finalizer().never();

        let result = lifecycle(store)
            .ensure_registered(&test_connector(true, false))
            .await
            .unwrap();
        assert_eq!(result, Registration::AlreadyPresent);
    }

    #[tokio::test]
    async fn test_ensure_registered_propagates_store_errors() {
        let mut store = MockResourceStore::new();
        store
            .expect_add_finalizer()
            .returning(|_| Err(StoreError::MissingField("metadata.namespace".to_string())));

        let err = lifecycle(store)
            .ensure_registered(&test_connector(false, false))
            .await
            .unwrap_err();
        assert!(matches!(err, FinalizerError::Store(_)));
    }

    #[tokio::test]
    async fn test_release_removes_finalizer() {
        let mut store = MockResourceStore::new();
        store.expect_remove_finalizer().times(1).returning(|_| Ok(()));

        lifecycle(store)
            .release(&test_connector(true, true), CleanupConfirmation::Deleted)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_without_finalizer_is_noop() {
        let mut store = MockResourceStore::new();
        store.expect_remove_finalizer().never();

        lifecycle(store)
            .release(&test_connector(false, true), CleanupConfirmation::AlreadyAbsent)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_on_live_record_is_rejected() {
        let mut store = MockResourceStore::new();
        store.expect_remove_finalizer().never();

        let err = lifecycle(store)
            .release(&test_connector(true, false), CleanupConfirmation::Deleted)
            .await
            .unwrap_err();
        assert!(matches!(err, FinalizerError::Consistency(_)));
    }
}
