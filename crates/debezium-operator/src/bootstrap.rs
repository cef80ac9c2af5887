//! Webhook TLS bootstrap
//!
//! Runs once at startup, before the webhook server binds:
//!
//! 1. Load `tls.crt`/`tls.key` from the TLS Secret, or generate a self-signed
//!    certificate for `<service>.<namespace>.svc` and persist it in a new Secret.
//! 2. Write both files into the cert directory.
//! 3. Publish the certificate as `caBundle` of the validating webhook so the
//!    API server trusts the endpoint.
//!
//! Keeping the certificate in a Secret means every replica and every restart
//! serves the same certificate, so the published bundle stays valid.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

/// Validity of a generated certificate
const CERT_VALIDITY_DAYS: i64 = 365;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("secret {0} exists but does not contain tls.crt and tls.key")]
    IncompleteSecret(String),
    #[error("webhook with name {webhook:?} not found in ValidatingWebhookConfiguration {config}")]
    WebhookNotFound { webhook: String, config: String },
}

/// PEM-encoded certificate and private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Where the webhook certificate lives and who trusts it
#[derive(Debug, Clone)]
pub struct WebhookCertSettings {
    pub namespace: String,
    pub service_name: String,
    pub secret_name: String,
    pub cert_dir: PathBuf,
    pub webhook_name: String,
    pub webhook_config_name: String,
}

impl WebhookCertSettings {
    /// DNS name the API server uses to reach the webhook service
    pub fn common_name(&self) -> String {
        format!("{}.{}.svc", self.service_name, self.namespace)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.cert_dir.join(TLS_CERT_KEY)
    }

    pub fn key_path(&self) -> PathBuf {
        self.cert_dir.join(TLS_PRIVATE_KEY_KEY)
    }
}

/// Generate a self-signed server certificate for `common_name`
pub fn generate_self_signed(common_name: &str) -> Result<CertificateBundle, BootstrapError> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.subject_alt_names = vec![SanType::DnsName(common_name.try_into()?)];
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    let cert = params.self_signed(&key_pair)?;

    Ok(CertificateBundle {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BootstrapError + '_ {
    move |source| BootstrapError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write a file readable only by its owner
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
        options.mode(0o600);
        let mut file = options.open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.write_all(data)
    }
    #[cfg(not(unix))]
    {
        options.open(path)?.write_all(data)
    }
}

/// Write `tls.crt` and `tls.key` into the cert directory, creating it if needed
pub fn write_cert_files(
    settings: &WebhookCertSettings,
    bundle: &CertificateBundle,
) -> Result<(), BootstrapError> {
    std::fs::create_dir_all(&settings.cert_dir).map_err(io_error(&settings.cert_dir))?;

    let cert_path = settings.cert_path();
    std::fs::write(&cert_path, bundle.cert_pem.as_bytes()).map_err(io_error(&cert_path))?;

    let key_path = settings.key_path();
    write_private(&key_path, bundle.key_pem.as_bytes()).map_err(io_error(&key_path))?;

    Ok(())
}

/// Extract the certificate bundle from a TLS Secret
pub fn bundle_from_secret(secret: &Secret) -> Option<CertificateBundle> {
    let data = secret.data.as_ref()?;
    let field = |key: &str| {
        data.get(key)
            .filter(|v| !v.0.is_empty())
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
    };

    Some(CertificateBundle {
        cert_pem: field(TLS_CERT_KEY)?,
        key_pem: field(TLS_PRIVATE_KEY_KEY)?,
    })
}

fn tls_secret(settings: &WebhookCertSettings, bundle: &CertificateBundle) -> Secret {
    let data = BTreeMap::from([
        (
            TLS_CERT_KEY.to_string(),
            ByteString(bundle.cert_pem.clone().into_bytes()),
        ),
        (
            TLS_PRIVATE_KEY_KEY.to_string(),
            ByteString(bundle.key_pem.clone().into_bytes()),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(settings.secret_name.clone()),
            namespace: Some(settings.namespace.clone()),
            ..Default::default()
        },
        data: Some(data),
        type_: Some(SECRET_TYPE_TLS.to_string()),
        ..Default::default()
    }
}

/// Load the webhook certificate from its Secret, generating it on first start
///
/// The certificate files are written into the cert directory in both cases.
#[instrument(skip(client, settings), fields(secret = %settings.secret_name, namespace = %settings.namespace))]
pub async fn load_or_generate_cert(
    client: Client,
    settings: &WebhookCertSettings,
) -> Result<CertificateBundle, BootstrapError> {
    let secrets: Api<Secret> = Api::namespaced(client, &settings.namespace);

    let bundle = match secrets.get_opt(&settings.secret_name).await? {
        Some(secret) => {
            let bundle = bundle_from_secret(&secret)
                .ok_or_else(|| BootstrapError::IncompleteSecret(settings.secret_name.clone()))?;
            info!("Loaded webhook certificate from secret");
            bundle
        }
        None => {
            let generated = generate_self_signed(&settings.common_name())?;
            match secrets
                .create(&PostParams::default(), &tls_secret(settings, &generated))
                .await
            {
                Ok(_) => {
                    info!(common_name = %settings.common_name(), "Generated webhook certificate");
                    generated
                }
                // Another replica won the race; serve its certificate instead
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    warn!("Certificate secret created concurrently, reloading");
                    let secret = secrets.get(&settings.secret_name).await?;
                    bundle_from_secret(&secret).ok_or_else(|| {
                        BootstrapError::IncompleteSecret(settings.secret_name.clone())
                    })?
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    write_cert_files(settings, &bundle)?;
    Ok(bundle)
}

/// Set `caBundle` on the named webhook entry
pub fn set_ca_bundle(
    config: &mut ValidatingWebhookConfiguration,
    webhook_name: &str,
    ca_bundle: &[u8],
) -> bool {
    let mut updated = false;
    for webhook in config.webhooks.iter_mut().flatten() {
        if webhook.name == webhook_name {
            webhook.client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
            updated = true;
        }
    }
    updated
}

/// Publish the certificate as the webhook's trusted CA bundle
#[instrument(skip(client, settings, ca_bundle), fields(webhook = %settings.webhook_name))]
pub async fn update_webhook_ca_bundle(
    client: Client,
    settings: &WebhookCertSettings,
    ca_bundle: &[u8],
) -> Result<(), BootstrapError> {
    let configs: Api<ValidatingWebhookConfiguration> = Api::all(client);
    let mut config = configs.get(&settings.webhook_config_name).await?;

    if !set_ca_bundle(&mut config, &settings.webhook_name, ca_bundle) {
        return Err(BootstrapError::WebhookNotFound {
            webhook: settings.webhook_name.clone(),
            config: settings.webhook_config_name.clone(),
        });
    }

    configs
        .replace(&settings.webhook_config_name, &PostParams::default(), &config)
        .await?;

    info!(config = %settings.webhook_config_name, "Updated webhook caBundle");
    Ok(())
}

/// Full startup sequence: certificate, files, then CA bundle
pub async fn bootstrap_webhook_tls(
    client: Client,
    settings: &WebhookCertSettings,
) -> Result<CertificateBundle, BootstrapError> {
    let bundle = load_or_generate_cert(client.clone(), settings).await?;
    update_webhook_ca_bundle(client, settings, bundle.cert_pem.as_bytes()).await?;
    Ok(bundle)
}
