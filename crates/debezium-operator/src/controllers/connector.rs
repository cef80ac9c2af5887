//! DebeziumConnector controller
//!
//! Watches api.debezium/v1alpha1 DebeziumConnector resources and converges the
//! matching Kafka Connect connector to `spec.config`.
//!
//! ## Lifecycle
//!
//! The state is derived from the record on every pass:
//!
//! - **Deleting** (`deletionTimestamp` set): delete the upstream connector, then
//!   release the finalizer. A 404 from upstream counts as deleted. Any other
//!   failure keeps the finalizer so the record cannot disappear while the
//!   connector may still exist.
//! - **Adopting** (no finalizer yet): register the finalizer, then continue as
//!   Synced. The finalizer is persisted before anything is created upstream,
//!   and only for records that name their connector.
//! - **Synced**: create the connector if absent, otherwise compare configs and
//!   replace the upstream config on drift. Healthy passes requeue after the
//!   resync interval to catch out-of-band changes.
//!
//! Failures are returned to the controller runtime, whose error policy decides
//! when to retry; nothing here loops or sleeps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client as KubeClient, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::compare::configs_equal;
use crate::connect::{ConnectorConfig, ConnectorPresence, ExternalConnectorState, UpstreamError};
use crate::crd::{ConnectorPhase, DebeziumConnector, CONFIG_NAME};
use crate::finalizer::{CleanupConfirmation, FinalizerError};
use crate::metrics;
use crate::status::phase_from_runtime;
use crate::store::StoreError;

use super::retry::ErrorKind;
use super::ControllerContext;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("upstream connector API error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("resource store error: {0}")]
    Store(#[from] StoreError),
    #[error("finalizer consistency violated: {0}")]
    FinalizerConsistency(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

impl ReconcileError {
    /// Short label used in metrics
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Upstream(_) => "upstream",
            ReconcileError::Store(_) => "store",
            ReconcileError::FinalizerConsistency(_) => "finalizer_consistency",
            ReconcileError::MissingField(_) => "missing_field",
        }
    }
}

impl From<FinalizerError> for ReconcileError {
    fn from(e: FinalizerError) -> Self {
        match e {
            FinalizerError::Store(e) => ReconcileError::Store(e),
            FinalizerError::Consistency(msg) => ReconcileError::FinalizerConsistency(msg),
        }
    }
}

/// Corrective action chosen for a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorAction {
    NoAction,
    Create,
    Update,
    Delete,
}

impl ConnectorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorAction::NoAction => "no_action",
            ConnectorAction::Create => "create",
            ConnectorAction::Update => "update",
            ConnectorAction::Delete => "delete",
        }
    }
}

/// Decision and requeue hint of a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub action: ConnectorAction,
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn into_action(self) -> Action {
        match self.requeue_after {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        }
    }
}

/// Lifecycle state derived from the record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Deleting,
    Adopting,
    Synced,
}

impl LifecycleState {
    pub fn of(resource: &DebeziumConnector) -> Self {
        if resource.deletion_requested() {
            LifecycleState::Deleting
        } else if resource.finalizer_present() {
            LifecycleState::Synced
        } else {
            LifecycleState::Adopting
        }
    }
}

/// Choose the action that converges `observed` to `desired`
pub fn decide(desired: &ConnectorConfig, observed: &ExternalConnectorState) -> ConnectorAction {
    match (&observed.exists, &observed.config) {
        (false, _) => ConnectorAction::Create,
        (true, Some(active)) if configs_equal(desired, active) => ConnectorAction::NoAction,
        (true, _) => ConnectorAction::Update,
    }
}

fn connector_name(resource: &DebeziumConnector) -> Result<&str, ReconcileError> {
    resource
        .connector_name()
        .ok_or_else(|| ReconcileError::MissingField(format!("spec.config.{CONFIG_NAME}")))
}

/// Query the upstream platform for the connector's current state
///
/// The runtime status is best-effort; failing to read it leaves it empty.
async fn observe(
    ctx: &ControllerContext,
    host: &str,
    name: &str,
) -> Result<ExternalConnectorState, ReconcileError> {
    match ctx.control.exists(host, name).await? {
        ConnectorPresence::Absent => Ok(ExternalConnectorState::absent()),
        ConnectorPresence::Present => {
            let config = ctx.control.get_config(host, name).await?;
            let runtime_status = match ctx.control.status(host, name).await {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(connector = %name, error = %e, "Failed to read connector status");
                    None
                }
            };
            Ok(ExternalConnectorState {
                exists: true,
                config: Some(config),
                runtime_status,
            })
        }
    }
}

/// Deleting: remove the upstream connector, then release the finalizer
async fn cleanup(
    resource: &DebeziumConnector,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    let done = ReconcileOutcome {
        action: ConnectorAction::Delete,
        requeue_after: None,
    };

    if !resource.finalizer_present() {
        debug!("No finalizer registered, nothing to clean up");
        return Ok(ReconcileOutcome {
            action: ConnectorAction::NoAction,
            ..done
        });
    }

    let host = &resource.spec.debezium_host;
    // Without a name the create step can never have run
    let Some(name) = resource.connector_name() else {
        warn!("Connector name missing, releasing finalizer without upstream delete");
        ctx.finalizers
            .release(resource, CleanupConfirmation::AlreadyAbsent)
            .await?;
        return Ok(done);
    };

    let confirmation = match ctx.control.delete(host, name).await {
        Ok(()) => {
            info!(connector = %name, host = %host, "Deleted connector");
            CleanupConfirmation::Deleted
        }
        Err(e) if e.is_not_found() => {
            info!(connector = %name, host = %host, "Connector already absent");
            CleanupConfirmation::AlreadyAbsent
        }
        Err(e) => {
            warn!(connector = %name, host = %host, error = %e, "Failed to delete connector");
            return Err(e.into());
        }
    };

    ctx.finalizers.release(resource, confirmation).await?;
    Ok(done)
}

/// Synced: converge the upstream connector to the desired config
async fn sync(
    resource: &DebeziumConnector,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    let host = &resource.spec.debezium_host;
    let name = connector_name(resource)?;
    let desired = &resource.spec.config;

    let observed = observe(ctx, host, name).await?;
    let action = decide(desired, &observed);

    match action {
        ConnectorAction::Create => {
            ctx.control.create(host, desired).await.inspect_err(|e| {
                warn!(connector = %name, host = %host, error = %e, "Failed to create connector");
            })?;
            info!(connector = %name, host = %host, "Created connector");

            // Nothing reports a real phase until the next pass observes it
            ctx.status
                .report(resource, ConnectorPhase::Unknown, "Created", "Connector created")
                .await;
        }
        ConnectorAction::Update => {
            ctx.control.update(host, name, desired).await.inspect_err(|e| {
                warn!(connector = %name, host = %host, error = %e, "Failed to update connector");
            })?;
            info!(connector = %name, host = %host, "Updated connector config to match resource");

            let phase = phase_from_runtime(observed.runtime_status.as_ref());
            ctx.status
                .report(resource, phase, "Updated", "Connector config updated")
                .await;
        }
        ConnectorAction::NoAction | ConnectorAction::Delete => {
            debug!(connector = %name, "Connector config in sync");

            let phase = phase_from_runtime(observed.runtime_status.as_ref());
            ctx.status
                .report(resource, phase, "InSync", "Connector config matches resource")
                .await;
        }
    }

    Ok(ReconcileOutcome {
        action,
        requeue_after: Some(ctx.settings.resync_interval),
    })
}

/// Run one reconcile pass for a DebeziumConnector
pub async fn reconcile_connector(
    resource: &DebeziumConnector,
    ctx: &ControllerContext,
) -> Result<ReconcileOutcome, ReconcileError> {
    match LifecycleState::of(resource) {
        LifecycleState::Deleting => cleanup(resource, ctx).await,
        LifecycleState::Adopting => {
            connector_name(resource)?;
            ctx.finalizers.ensure_registered(resource).await?;
            sync(resource, ctx).await
        }
        LifecycleState::Synced => sync(resource, ctx).await,
    }
}

fn retry_key(resource: &DebeziumConnector) -> String {
    format!(
        "{}/{}",
        resource.namespace().unwrap_or_default(),
        resource.name_any()
    )
}

/// Reconcile entry point for the controller runtime
#[instrument(
    skip(ctx, resource),
    fields(
        name = %resource.name_any(),
        namespace = %resource.namespace().unwrap_or_default()
    )
)]
pub async fn reconcile(
    resource: Arc<DebeziumConnector>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    debug!(state = ?LifecycleState::of(&resource), "Reconciling DebeziumConnector");

    let started = Instant::now();
    let outcome = match reconcile_connector(&resource, &ctx).await {
        Ok(outcome) => {
            metrics::record_success(outcome.action.as_str(), started.elapsed());
            outcome
        }
        Err(e) => {
            metrics::record_failure(e.reason(), started.elapsed());
            return Err(e);
        }
    };

    ctx.retry_tracker.reset(&retry_key(&resource));
    debug!(action = ?outcome.action, "Reconcile pass complete");

    Ok(outcome.into_action())
}

/// Classify error type for retry behavior
pub fn classify_error(error: &ReconcileError) -> ErrorKind {
    match error {
        ReconcileError::Upstream(_) => ErrorKind::Transient,
        ReconcileError::Store(_) => ErrorKind::Transient,
        ReconcileError::FinalizerConsistency(_) => ErrorKind::Permanent,
        ReconcileError::MissingField(_) => ErrorKind::Permanent,
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(
    resource: Arc<DebeziumConnector>,
    error: &ReconcileError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let kind = classify_error(error);
    let attempt = ctx.retry_tracker.increment(&retry_key(&resource));

    warn!(
        name = %resource.name_any(),
        namespace = %resource.namespace().unwrap_or_default(),
        error = %error,
        attempt = attempt,
        error_kind = ?kind,
        "DebeziumConnector reconciliation failed"
    );

    ctx.backoff.action(attempt, kind)
}

/// Start the DebeziumConnector controller
///
/// The runtime guarantees at most one in-flight pass per resource key.
pub async fn run(client: KubeClient, ctx: Arc<ControllerContext>) {
    let connectors: Api<DebeziumConnector> = Api::all(client);
    let config = ControllerConfig::default().concurrency(ctx.settings.concurrency);

    info!(
        concurrency = ctx.settings.concurrency,
        resync_secs = ctx.settings.resync_interval.as_secs(),
        "Starting DebeziumConnector controller"
    );

    Controller::new(connectors, WatcherConfig::default())
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(name = %obj.name, "DebeziumConnector reconciled successfully");
                }
                Err(e) => {
                    warn!(error = %e, "DebeziumConnector controller error");
                }
            }
        })
        .await;
}
