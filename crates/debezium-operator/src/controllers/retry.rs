//! Requeue policy for failed reconcile passes
//!
//! The reconciler never retries internally. A failed pass is returned to the
//! controller runtime, whose error policy asks this module how long to wait
//! before the next invocation for that key.

use std::collections::HashMap;
use std::time::Duration;

use kube::runtime::controller::Action;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upstream outage, API server hiccup: retry with backoff
    Transient,
    /// Will not recover without a change to the resource
    Permanent,
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based): base, 2x base, 4x base...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Action for the controller runtime after a failed pass
    ///
    /// Transient errors are retried for as long as they keep failing, at most
    /// `max_delay` apart.
    pub fn action(&self, attempt: u32, kind: ErrorKind) -> Action {
        match kind {
            ErrorKind::Permanent => {
                warn!("Permanent error, waiting for resource change");
                Action::await_change()
            }
            ErrorKind::Transient => {
                let delay = self.delay_for(attempt);
                debug!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Scheduling retry with exponential backoff"
                );
                Action::requeue(delay)
            }
        }
    }
}

/// Consecutive failure count per resource
///
/// Only the error policy and the success path touch it; the lock is never held
/// across an await.
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the attempt number
    pub fn increment(&self, key: &str) -> u32 {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Forget failures after a successful pass
    pub fn reset(&self, key: &str) {
        self.attempts.lock().remove(key);
    }

    pub fn get(&self, key: &str) -> u32 {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }
}
