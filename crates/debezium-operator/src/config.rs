//! Operator startup configuration
//!
//! Every flag can also be supplied through the environment variable named in
//! its `env` attribute, which is how the Deployment manifest configures it.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::bootstrap::WebhookCertSettings;
use crate::controllers::ReconcileSettings;
use crate::leader::{LeaderElectionConfig, DEFAULT_LEASE_NAME};

#[derive(Debug, Clone, Parser)]
#[command(name = "debezium-operator")]
#[command(about = "Kubernetes operator for Debezium connectors", long_about = None)]
pub struct OperatorConfig {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address the liveness/readiness probe server binds to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: SocketAddr,

    /// Address the metrics endpoint binds to ("0" disables it, ":8080" binds all interfaces)
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = crate::metrics::DEFAULT_METRICS_ADDR)]
    pub metrics_bind_address: String,

    /// Serve metrics over HTTPS using the webhook certificate
    #[arg(long, env = "METRICS_SECURE")]
    pub metrics_secure: bool,

    /// HTTPS port of the admission webhook
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = crate::webhook::DEFAULT_WEBHOOK_PORT)]
    pub webhook_port: u16,

    /// Directory the webhook certificate and key are written to
    #[arg(long, env = "CERT_DIR", default_value = "/tmp/certs")]
    pub cert_dir: PathBuf,

    /// Service fronting the webhook; with the namespace it forms the certificate CN
    #[arg(long, env = "WEBHOOK_SERVICE_NAME", default_value = "debezium-operator")]
    pub webhook_service_name: String,

    /// Namespace the operator runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "debezium-operator-ns")]
    pub namespace: String,

    /// Secret holding the webhook certificate
    #[arg(long, env = "TLS_SECRET_NAME", default_value = "debezium-operator-tls")]
    pub tls_secret_name: String,

    /// Webhook entry whose caBundle is published
    #[arg(
        long,
        env = "WEBHOOK_NAME",
        default_value = "vdebeziumconnector.api.debezium.io"
    )]
    pub webhook_name: String,

    /// ValidatingWebhookConfiguration containing the webhook entry
    #[arg(
        long,
        env = "WEBHOOK_CONFIG_NAME",
        default_value = "debeziumconnectors-validating-webhook"
    )]
    pub webhook_config_name: String,

    /// Serve the webhook and secure metrics over HTTP/2 as well as HTTP/1.1
    #[arg(long, env = "ENABLE_HTTP2")]
    pub enable_http2: bool,

    /// Hold a Lease before reconciling, for running several replicas
    #[arg(long, env = "LEADER_ELECT")]
    pub leader_elect: bool,

    #[arg(long, env = "LEADER_ELECTION_LEASE_NAME", default_value = DEFAULT_LEASE_NAME)]
    pub lease_name: String,

    /// Lease holder identity; required with --leader-elect
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    #[arg(long, env = "LEADER_ELECTION_LEASE_DURATION", default_value_t = 15)]
    pub lease_duration_secs: u64,

    #[arg(long, env = "LEADER_ELECTION_RENEW_INTERVAL", default_value_t = 5)]
    pub renew_interval_secs: u64,

    /// Timeout for every Kafka Connect REST request
    #[arg(long, env = "CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Requeue delay after a successful reconcile
    #[arg(long, env = "RESYNC_INTERVAL_SECS", default_value_t = 60)]
    pub resync_interval_secs: u64,

    /// Reconciles in flight across all resources (0 = unbounded)
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 0)]
    pub max_concurrent_reconciles: u16,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the operator (default)
    Run,
    /// Print the DebeziumConnector CustomResourceDefinition as YAML
    Crd,
}

impl OperatorConfig {
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            concurrency: self.max_concurrent_reconciles,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn webhook_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.webhook_port))
    }

    /// Metrics listener address, or `None` when metrics are disabled
    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        let raw = self.metrics_bind_address.as_str();
        if raw == "0" {
            return Ok(None);
        }

        let addr = match raw.strip_prefix(':') {
            Some(port) => format!("{}:{port}", Ipv4Addr::UNSPECIFIED),
            None => raw.to_string(),
        };
        addr.parse()
            .map(Some)
            .with_context(|| format!("invalid metrics bind address {raw:?}"))
    }

    pub fn cert_settings(&self) -> WebhookCertSettings {
        WebhookCertSettings {
            namespace: self.namespace.clone(),
            service_name: self.webhook_service_name.clone(),
            secret_name: self.tls_secret_name.clone(),
            cert_dir: self.cert_dir.clone(),
            webhook_name: self.webhook_name.clone(),
            webhook_config_name: self.webhook_config_name.clone(),
        }
    }

    /// Leader election settings, or `None` when disabled
    pub fn leader_election(&self) -> Result<Option<LeaderElectionConfig>> {
        if !self.leader_elect {
            return Ok(None);
        }

        let holder_id = self
            .pod_name
            .clone()
            .context("POD_NAME required when leader election is enabled")?;

        LeaderElectionConfig::new(
            self.lease_name.clone(),
            self.namespace.clone(),
            holder_id,
            Duration::from_secs(self.lease_duration_secs),
            Duration::from_secs(self.renew_interval_secs),
        )
        .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> OperatorConfig {
        let mut argv = vec!["debezium-operator"];
        argv.extend_from_slice(args);
        OperatorConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);

        assert!(config.command.is_none());
        assert_eq!(config.webhook_port, 8443);
        assert_eq!(config.cert_dir, PathBuf::from("/tmp/certs"));
        assert_eq!(config.tls_secret_name, "debezium-operator-tls");
        assert_eq!(config.webhook_name, "vdebeziumconnector.api.debezium.io");
        assert_eq!(config.webhook_config_name, "debeziumconnectors-validating-webhook");
        assert_eq!(config.lease_name, "7b7a467c.debezium");
        assert!(!config.enable_http2);
        assert!(!config.leader_elect);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.reconcile_settings(),
            ReconcileSettings {
                resync_interval: Duration::from_secs(60),
                concurrency: 0,
            }
        );
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = parse(&[
            "--health-probe-bind-address",
            "127.0.0.1:9090",
            "--webhook-port",
            "9443",
            "--enable-http2",
            "--resync-interval-secs",
            "30",
            "--max-concurrent-reconciles",
            "4",
        ]);

        assert_eq!(config.health_probe_bind_address.port(), 9090);
        assert_eq!(config.webhook_addr().port(), 9443);
        assert!(config.enable_http2);
        assert_eq!(config.reconcile_settings().resync_interval, Duration::from_secs(30));
        assert_eq!(config.reconcile_settings().concurrency, 4);
    }

    #[test]
    fn test_metrics_addr() {
        let config = parse(&[]);
        assert_eq!(
            config.metrics_addr().unwrap(),
            Some("0.0.0.0:8080".parse().unwrap())
        );
        assert!(!config.metrics_secure);

        let config = parse(&["--metrics-bind-address", ":9100", "--metrics-secure"]);
        assert_eq!(
            config.metrics_addr().unwrap(),
            Some("0.0.0.0:9100".parse().unwrap())
        );
        assert!(config.metrics_secure);

        assert_eq!(parse(&["--metrics-bind-address", "0"]).metrics_addr().unwrap(), None);
        assert!(parse(&["--metrics-bind-address", "nowhere"]).metrics_addr().is_err());
    }

    #[test]
    fn test_cert_settings() {
        let config = parse(&[
            "--namespace",
            "operators",
            "--webhook-service-name",
            "dbz-webhook",
        ]);

        let settings = config.cert_settings();
        assert_eq!(settings.common_name(), "dbz-webhook.operators.svc");
        assert_eq!(settings.cert_path(), PathBuf::from("/tmp/certs/tls.crt"));
    }

    #[test]
    fn test_crd_subcommand() {
        let config = parse(&["crd"]);
        assert!(matches!(config.command, Some(Command::Crd)));
    }

    #[test]
    fn test_leader_election_disabled() {
        assert!(parse(&[]).leader_election().unwrap().is_none());
    }

    #[test]
    fn test_leader_election_requires_pod_name() {
        let mut config = parse(&["--leader-elect"]);
        config.pod_name = None;

        let err = config.leader_election().unwrap_err();
        assert!(err.to_string().contains("POD_NAME"));
    }

    #[test]
    fn test_leader_election_enabled() {
        let config = parse(&[
            "--leader-elect",
            "--pod-name",
            "debezium-operator-0",
            "--namespace",
            "operators",
        ]);

        let leader = config.leader_election().unwrap().unwrap();
        assert_eq!(leader.holder_id(), "debezium-operator-0");
        assert_eq!(leader.namespace(), "operators");
        assert_eq!(leader.lease_duration(), Duration::from_secs(15));
        assert_eq!(leader.renew_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_leader_election_rejects_bad_intervals() {
        let config = parse(&[
            "--leader-elect",
            "--pod-name",
            "p",
            "--lease-duration-secs",
            "5",
            "--renew-interval-secs",
            "5",
        ]);

        assert!(config.leader_election().is_err());
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let result = OperatorConfig::try_parse_from(["debezium-operator", "--webhook-port", "99999"]);
        assert!(result.is_err());
    }
}
