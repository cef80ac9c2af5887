//! Status reporting for DebeziumConnector records
//!
//! Maps upstream runtime state to [`ConnectorPhase`] and writes the status
//! subresource. Status writes are best-effort: a failed write is logged and
//! never fails the reconcile pass.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connect::ConnectorRuntimeStatus;
use crate::crd::{Condition, ConnectorPhase, DebeziumConnector, DebeziumConnectorStatus};
use crate::store::ResourceStore;

/// Map upstream runtime state to a phase
///
/// A failed task (or failed connector) wins over the connector state. Any
/// state not recognized here maps to `Unknown`.
pub fn phase_from_runtime(status: Option<&ConnectorRuntimeStatus>) -> ConnectorPhase {
    let Some(status) = status else {
        return ConnectorPhase::Unknown;
    };

    let any_task_failed = status
        .tasks
        .iter()
        .any(|t| t.state.eq_ignore_ascii_case("FAILED"));

    if any_task_failed || status.connector.state.eq_ignore_ascii_case("FAILED") {
        return ConnectorPhase::TaskFailed;
    }

    match status.connector.state.to_ascii_uppercase().as_str() {
        "RUNNING" => ConnectorPhase::Running,
        "PAUSED" => ConnectorPhase::Paused,
        _ => ConnectorPhase::Unknown,
    }
}

/// Merge a condition into the previous status
///
/// The condition replaces any existing condition of the same type. Its
/// transition time is kept from the previous one when `status` did not change.
pub fn next_status(
    previous: &DebeziumConnectorStatus,
    phase: ConnectorPhase,
    mut condition: Condition,
) -> DebeziumConnectorStatus {
    let mut conditions: Vec<Condition> = Vec::with_capacity(previous.conditions.len() + 1);

    for existing in &previous.conditions {
        if existing.type_ == condition.type_ {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
        } else {
            conditions.push(existing.clone());
        }
    }
    conditions.push(condition);

    DebeziumConnectorStatus { phase, conditions }
}

/// Result of a status write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// Computed status equals the stored one; nothing written
    Unchanged,
    Written,
    /// Write failed and was logged
    Failed,
}

pub struct StatusReporter {
    store: Arc<dyn ResourceStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Record `phase` and a Synced condition on the resource
    ///
    /// Identical status is not rewritten, so a steady-state pass does not
    /// generate a watch event for itself.
    pub async fn report(
        &self,
        resource: &DebeziumConnector,
        phase: ConnectorPhase,
        reason: &str,
        message: &str,
    ) -> StatusWrite {
        let previous = resource.current_status();
        let status = next_status(&previous, phase, Condition::synced(true, reason, message));

        if resource.status.is_some() && status == previous {
            debug!(phase = %phase, "Status unchanged");
            return StatusWrite::Unchanged;
        }

        match self.store.patch_status(resource, &status).await {
            Ok(()) => {
                debug!(phase = %phase, reason = %reason, "Status updated");
                StatusWrite::Written
            }
            Err(e) => {
                warn!(error = %e, phase = %phase, "Failed to update status");
                StatusWrite::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::{TaskState, WorkerState};
    use crate::crd::test_support::test_connector;
    use crate::store::{MockResourceStore, StoreError};

    fn runtime(connector: &str, tasks: &[&str]) -> ConnectorRuntimeStatus {
        ConnectorRuntimeStatus {
            connector: WorkerState {
                state: connector.to_string(),
                worker_id: None,
            },
            tasks: tasks
                .iter()
                .enumerate()
                .map(|(i, s)| TaskState {
                    id: i as u32,
                    state: s.to_string(),
                    worker_id: None,
                    trace: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(
            phase_from_runtime(Some(&runtime("RUNNING", &["RUNNING"]))),
            ConnectorPhase::Running
        );
        assert_eq!(
            phase_from_runtime(Some(&runtime("PAUSED", &["PAUSED"]))),
            ConnectorPhase::Paused
        );
        assert_eq!(
            phase_from_runtime(Some(&runtime("RUNNING", &["RUNNING", "FAILED"]))),
            ConnectorPhase::TaskFailed
        );
        assert_eq!(
            phase_from_runtime(Some(&runtime("FAILED", &[]))),
            ConnectorPhase::TaskFailed
        );
    }

    #[test]
    fn test_unrecognized_state_is_unknown() {
        assert_eq!(
            phase_from_runtime(Some(&runtime("UNASSIGNED", &[]))),
            ConnectorPhase::Unknown
        );
        assert_eq!(
            phase_from_runtime(Some(&runtime("RESTARTING", &["RUNNING"]))),
            ConnectorPhase::Unknown
        );
        assert_eq!(phase_from_runtime(None), ConnectorPhase::Unknown);
    }

    #[test]
    fn test_next_status_keeps_transition_time_when_unchanged() {
        let mut old = Condition::synced(true, "Created", "Connector created");
        old.last_transition_time = "2025-01-01T00:00:00+00:00".to_string();
        let previous = DebeziumConnectorStatus {
            phase: ConnectorPhase::Unknown,
            conditions: vec![old],
        };

        let next = next_status(
            &previous,
            ConnectorPhase::Running,
            Condition::synced(true, "InSync", "Connector config matches"),
        );

        assert_eq!(next.phase, ConnectorPhase::Running);
        assert_eq!(next.conditions.len(), 1);
        assert_eq!(next.conditions[0].reason, "InSync");
        assert_eq!(
            next.conditions[0].last_transition_time,
            "2025-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_next_status_moves_transition_time_on_flip() {
        let mut old = Condition::synced(false, "Failed", "nope");
        old.last_transition_time = "2025-01-01T00:00:00+00:00".to_string();
        let previous = DebeziumConnectorStatus {
            phase: ConnectorPhase::Unknown,
            conditions: vec![old],
        };

        let next = next_status(
            &previous,
            ConnectorPhase::Running,
            Condition::synced(true, "InSync", "ok"),
        );

        assert_ne!(
            next.conditions[0].last_transition_time,
            "2025-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn test_next_status_preserves_foreign_conditions() {
        let foreign = Condition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            reason: "External".to_string(),
            message: String::new(),
            last_transition_time: "2025-01-01T00:00:00+00:00".to_string(),
        };
        let previous = DebeziumConnectorStatus {
            phase: ConnectorPhase::Unknown,
            conditions: vec![foreign.clone()],
        };

        let next = next_status(
            &previous,
            ConnectorPhase::Unknown,
            Condition::synced(true, "Created", "ok"),
        );

        assert_eq!(next.conditions.len(), 2);
        assert_eq!(next.conditions[0], foreign);
    }

    #[tokio::test]
    async fn test_report_writes_new_status() {
        let mut store = MockResourceStore::new();
        store
            .expect_patch_status()
            .times(1)
            .withf(|_, status| status.phase == ConnectorPhase::Unknown)
            .returning(|_, _| Ok(()));

        let reporter = StatusReporter::new(Arc::new(store));
        let result = reporter
            .report(&test_connector(true, false), ConnectorPhase::Unknown, "Created", "ok")
            .await;
        assert_eq!(result, StatusWrite::Written);
    }

    #[tokio::test]
    async fn test_report_skips_identical_status() {
        let mut store = MockResourceStore::new();
        store.expect_patch_status().never();

        let mut dbc = test_connector(true, false);
        dbc.status = Some(DebeziumConnectorStatus {
            phase: ConnectorPhase::Running,
            conditions: vec![Condition::synced(true, "InSync", "in sync")],
        });

        let reporter = StatusReporter::new(Arc::new(store));
        let result = reporter
            .report(&dbc, ConnectorPhase::Running, "InSync", "in sync")
            .await;
        assert_eq!(result, StatusWrite::Unchanged);
    }

    #[tokio::test]
    async fn test_report_swallows_store_errors() {
        let mut store = MockResourceStore::new();
        store
            .expect_patch_status()
            .returning(|_, _| Err(StoreError::MissingField("metadata.name".to_string())));

        let reporter = StatusReporter::new(Arc::new(store));
        let result = reporter
            .report(&test_connector(true, false), ConnectorPhase::Running, "InSync", "ok")
            .await;
        assert_eq!(result, StatusWrite::Failed);
    }
}
