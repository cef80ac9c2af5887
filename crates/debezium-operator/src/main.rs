use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use debezium_operator::bootstrap::bootstrap_webhook_tls;
use debezium_operator::config::{Command, OperatorConfig};
use debezium_operator::connect::ConnectClient;
use debezium_operator::controllers::{self, ControllerContext};
use debezium_operator::crd::crd_yaml;
use debezium_operator::health::{run_health_server, HealthState};
use debezium_operator::leader::LeaderElection;
use debezium_operator::metrics::{install_recorder, run_metrics_server};
use debezium_operator::store::KubeResourceStore;
use debezium_operator::validation::ConnectValidator;
use debezium_operator::webhook::{load_tls_config, run_webhook_server};

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::parse();

    if let Some(Command::Crd) = config.command {
        print!("{}", crd_yaml().context("Failed to render CRD")?);
        return Ok(());
    }

    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Both reqwest and kube pull in rustls; pin the process-wide provider
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        bail!("Failed to install rustls crypto provider");
    }

    info!("debezium-operator starting");
    run(config).await
}

async fn run(config: OperatorConfig) -> Result<()> {
    let metrics_addr = config.metrics_addr()?;
    let metrics_handle = install_recorder().context("Failed to install metrics recorder")?;

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    // Webhook TLS must exist before the API server can call us
    let cert_settings = config.cert_settings();
    bootstrap_webhook_tls(kube_client.clone(), &cert_settings)
        .await
        .context("Failed to bootstrap webhook certificate")?;

    let tls = load_tls_config(
        &cert_settings.cert_path(),
        &cert_settings.key_path(),
        config.enable_http2,
    )
    .context("Failed to load webhook TLS config")?;

    let metrics_server = metrics_addr.map(|addr| {
        let metrics_tls = config.metrics_secure.then(|| tls.clone());
        tokio::spawn(run_metrics_server(
            metrics_handle,
            addr,
            metrics_tls,
            config.enable_http2,
        ))
    });
    if metrics_server.is_none() {
        info!("Metrics endpoint disabled");
    }
    let metrics_exit = async move {
        match metrics_server {
            Some(task) => task.await,
            None => std::future::pending().await,
        }
    };

    let validator = ConnectValidator::new(config.connect_timeout())
        .context("Failed to create validation client")?;

    let health = Arc::new(HealthState::new());
    let health_server = tokio::spawn(run_health_server(
        health.clone(),
        config.health_probe_bind_address,
    ));
    let webhook_server = tokio::spawn(run_webhook_server(
        config.webhook_addr(),
        tls,
        Arc::new(validator),
        config.enable_http2,
    ));

    if let Some(leader_config) = config.leader_election()? {
        let election = LeaderElection::new(kube_client.clone(), &leader_config);
        election.acquire().await?;
        election.spawn_renewal_task();
    }

    let connect = ConnectClient::new(config.connect_timeout())
        .context("Failed to create Kafka Connect client")?;
    let ctx = Arc::new(ControllerContext::new(
        Arc::new(connect),
        Arc::new(KubeResourceStore::new(kube_client.clone())),
        config.reconcile_settings(),
    ));

    let controller = tokio::spawn(controllers::connector::run(kube_client, ctx));
    health.mark_started();

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    select! {
        result = controller => {
            if let Err(e) = result {
                error!(error = %e, "Controller task failed");
                bail!("DebeziumConnector controller task failed: {e}");
            }
            // The controller only returns once its shutdown signal fired
            info!("Controller stopped");
        }
        result = health_server => {
            error!(result = ?result, "Health server exited");
            bail!("Health server exited unexpectedly");
        }
        result = metrics_exit => {
            error!(result = ?result, "Metrics server exited");
            bail!("Metrics server exited unexpectedly");
        }
        result = webhook_server => {
            error!(result = ?result, "Webhook server exited");
            bail!("Webhook server exited unexpectedly");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
