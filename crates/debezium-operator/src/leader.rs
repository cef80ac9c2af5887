//! Leader election for running multiple operator replicas safely.
//!
//! Uses the Kubernetes Lease API via `kube-leader-election` so only one
//! replica reconciles at a time. Standby replicas block in [`LeaderElection::acquire`],
//! and the leader exits if it loses the lease. Admission requests are served by
//! every replica regardless of leadership.

use std::time::Duration;

use anyhow::{ensure, Result};
use k8s_openapi::api::coordination::v1::Lease;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

/// Default lease name shared by all replicas.
pub const DEFAULT_LEASE_NAME: &str = "7b7a467c.debezium";

/// Maximum consecutive renewal failures before exiting.
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Validated leader election settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    lease_name: String,
    namespace: String,
    holder_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaderElectionConfig {
    /// # Errors
    ///
    /// Returns an error if any name is empty or if
    /// `renew_interval >= lease_duration` (the lease would lapse between renewals).
    pub fn new(
        lease_name: String,
        namespace: String,
        holder_id: String,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> Result<Self> {
        ensure!(!lease_name.is_empty(), "lease_name cannot be empty");
        ensure!(!namespace.is_empty(), "namespace cannot be empty");
        ensure!(!holder_id.is_empty(), "holder_id cannot be empty");
        ensure!(
            renew_interval < lease_duration,
            "renew_interval ({:?}) must be less than lease_duration ({:?})",
            renew_interval,
            lease_duration
        );

        Ok(Self {
            lease_name,
            namespace,
            holder_id,
            lease_duration,
            renew_interval,
        })
    }

    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }
}

fn holder_of(lease: Option<&Lease>) -> &str {
    lease
        .and_then(|l| l.spec.as_ref())
        .and_then(|s| s.holder_identity.as_deref())
        .unwrap_or("unknown")
}

/// Leader election manager using Kubernetes Lease API.
pub struct LeaderElection {
    lease_lock: LeaseLock,
    renew_interval: Duration,
}

impl LeaderElection {
    pub fn new(client: Client, config: &LeaderElectionConfig) -> Self {
        let lease_lock = LeaseLock::new(
            client,
            config.namespace(),
            LeaseLockParams {
                holder_id: config.holder_id().to_string(),
                lease_name: config.lease_name().to_string(),
                lease_ttl: config.lease_duration(),
            },
        );

        Self {
            lease_lock,
            renew_interval: config.renew_interval(),
        }
    }

    /// Acquire leadership, blocking until successful.
    ///
    /// Retries indefinitely; call before starting the controller.
    pub async fn acquire(&self) -> Result<()> {
        info!("Attempting to acquire leadership...");

        loop {
            match self.lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(holder = %holder_of(result.lease.as_ref()), "Leadership acquired");
                    return Ok(());
                }
                Ok(result) => {
                    info!(
                        current_holder = %holder_of(result.lease.as_ref()),
                        "Another pod is leader, waiting..."
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to check leadership, retrying...");
                }
            }

            tokio::time::sleep(self.renew_interval).await;
        }
    }

    /// Spawn a background task that renews the lease periodically.
    ///
    /// Exits the process when leadership moves to another pod, or after
    /// [`MAX_RENEWAL_FAILURES`] consecutive renewal errors. Kubernetes then
    /// restarts the pod as a standby.
    pub fn spawn_renewal_task(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.renew_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut consecutive_failures: u32 = 0;

            info!(
                interval_secs = self.renew_interval.as_secs(),
                max_failures = MAX_RENEWAL_FAILURES,
                "Starting lease renewal loop"
            );

            loop {
                interval.tick().await;

                match self.lease_lock.try_acquire_or_renew().await {
                    Ok(result) if result.acquired_lease => {
                        if consecutive_failures > 0 {
                            info!(
                                previous_failures = consecutive_failures,
                                "Lease renewed after transient failures"
                            );
                        }
                        consecutive_failures = 0;
                        trace!("Lease renewed");
                    }
                    Ok(result) => {
                        error!(
                            new_holder = %holder_of(result.lease.as_ref()),
                            "Lost leadership to another pod, exiting"
                        );
                        std::process::exit(1);
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_RENEWAL_FAILURES {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Failed to renew lease, exiting"
                            );
                            std::process::exit(1);
                        }
                        warn!(
                            error = %e,
                            attempt = consecutive_failures,
                            max_attempts = MAX_RENEWAL_FAILURES,
                            "Transient lease renewal failure, will retry"
                        );
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::coordination::v1::LeaseSpec;

    fn config(lease: &str, duration: u64, renew: u64) -> Result<LeaderElectionConfig> {
        LeaderElectionConfig::new(
            lease.to_string(),
            "operators".to_string(),
            "debezium-operator-0".to_string(),
            Duration::from_secs(duration),
            Duration::from_secs(renew),
        )
    }

    #[test]
    fn config_new_accepts_valid_config() {
        let config = config(DEFAULT_LEASE_NAME, 15, 5).unwrap();
        assert_eq!(config.lease_name(), "7b7a467c.debezium");
        assert_eq!(config.namespace(), "operators");
        assert_eq!(config.holder_id(), "debezium-operator-0");
        assert_eq!(config.lease_duration(), Duration::from_secs(15));
        assert_eq!(config.renew_interval(), Duration::from_secs(5));
    }

    #[test]
    fn config_new_validates_empty_strings() {
        let err = config("", 15, 5).unwrap_err();
        assert!(err.to_string().contains("lease_name"));

        let err = LeaderElectionConfig::new(
            "lease".to_string(),
            "operators".to_string(),
            String::new(),
            Duration::from_secs(15),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(err.to_string().contains("holder_id"));
    }

    #[test]
    fn config_new_validates_duration_relationship() {
        let err = config("lease", 10, 15).unwrap_err();
        assert!(err.to_string().contains("renew_interval"));

        assert!(config("lease", 10, 10).is_err());
    }

    #[test]
    fn holder_of_reads_lease_spec() {
        assert_eq!(holder_of(None), "unknown");

        let lease = Lease {
            spec: Some(LeaseSpec {
                holder_identity: Some("debezium-operator-1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(holder_of(Some(&lease)), "debezium-operator-1");
    }
}
