//! Kubernetes controllers for watched resources

pub mod connector;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use crate::connect::ConnectorControl;
use crate::finalizer::FinalizerLifecycle;
use crate::status::StatusReporter;
use crate::store::ResourceStore;

use retry::{BackoffPolicy, RetryTracker};

/// Default interval between drift checks for a healthy connector
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables for the reconcile loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Requeue delay after every successful non-deletion pass
    pub resync_interval: Duration,
    /// Maximum reconciles in flight across all keys (0 = unbounded)
    pub concurrency: u16,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            concurrency: 0,
        }
    }
}

/// Shared state for the connector controller
///
/// Holds no per-resource state beyond the retry counters used by the error
/// policy.
pub struct ControllerContext {
    /// Upstream connector-management API
    pub control: Arc<dyn ConnectorControl>,
    pub finalizers: FinalizerLifecycle,
    pub status: StatusReporter,
    pub settings: ReconcileSettings,
    pub backoff: BackoffPolicy,
    pub retry_tracker: RetryTracker,
}

impl ControllerContext {
    pub fn new(
        control: Arc<dyn ConnectorControl>,
        store: Arc<dyn ResourceStore>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            control,
            finalizers: FinalizerLifecycle::new(store.clone()),
            status: StatusReporter::new(store),
            settings,
            backoff: BackoffPolicy::default(),
            retry_tracker: RetryTracker::new(),
        }
    }
}
