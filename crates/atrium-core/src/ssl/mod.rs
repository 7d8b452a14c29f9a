//! SSL trust bootstrap.
//!
//! Three mutually exclusive paths, selected by configuration and never by
//! runtime fallback: use caller-provided certificates, reuse an existing CA
//! through the certificate controller, or generate a brand new CA. The two
//! issuer-based paths wait for issuer readiness and then expose the public
//! CA certificate in a config map; the CA private key never leaves its
//! secret.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::ReconcileError;
use crate::plan::Waiter;
use crate::plan::executor::wait_for;
use crate::resources;

/// Issuer signing the serving and database certificates.
pub const CA_ISSUER: &str = "atrium-ca-issuer";

/// One-shot issuer used to self-sign a generated CA.
pub const SELF_SIGN_ISSUER: &str = "atrium-selfsign-issuer";

/// Secret holding the serving certificate, issued via the ingress.
pub const CERT_SECRET: &str = "atrium-cert";

/// Secret holding the database server certificate.
pub const DB_CERT_SECRET: &str = "atrium-db-cert";

/// Secret holding the CA certificate and its private key.
pub const CA_SECRET: &str = "atrium-ca";

/// Config map exposing the public CA certificate to workloads.
pub const CA_CONFIG_MAP: &str = "atrium-ca";

pub const CA_CERT_KEY: &str = "ca.crt";

/// Which trust bootstrap path to take.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SslConfig {
    /// Caller supplies the full serving certificate. No issuer is
    /// registered and nothing renews automatically.
    Provided {
        certificate: PathBuf,
        key: PathBuf,
        ca_chain: PathBuf,
    },
    /// Register an issuer bound to an existing CA certificate and key.
    ReuseCa {
        ca_certificate: PathBuf,
        ca_key: PathBuf,
    },
    /// Generate a new self-signed CA plus leaf certificates bound to the
    /// target's address.
    Generate {
        #[serde(flatten)]
        subject: CertSubject,
    },
}

impl Default for SslConfig {
    fn default() -> Self {
        SslConfig::Generate {
            subject: CertSubject::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CertSubject {
    pub country: Option<String>,
    pub state: Option<String>,
    pub city: Option<String>,
    pub organization: Option<String>,
    pub unit: Option<String>,
    pub email: Option<String>,
}

impl SslConfig {
    /// Issuer the later plan steps reference, when the path registers one.
    pub fn issuer_ref(&self) -> Option<&'static str> {
        match self {
            SslConfig::Provided { .. } => None,
            SslConfig::ReuseCa { .. } | SslConfig::Generate { .. } => Some(CA_ISSUER),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            SslConfig::Provided {
                certificate,
                key,
                ca_chain,
            } => {
                for (label, path) in [
                    ("certificate", certificate),
                    ("key", key),
                    ("ca-chain", ca_chain),
                ] {
                    if path.as_os_str().is_empty() {
                        anyhow::bail!("ssl {label} path must be set for provided certificates");
                    }
                }
                Ok(())
            }
            SslConfig::ReuseCa {
                ca_certificate,
                ca_key,
            } => {
                if ca_certificate.as_os_str().is_empty() || ca_key.as_os_str().is_empty() {
                    anyhow::bail!("reusing a CA requires both its certificate and key");
                }
                Ok(())
            }
            SslConfig::Generate { .. } => Ok(()),
        }
    }
}

pub struct CertificateProvisioner<'a> {
    backend: &'a dyn Backend,
    namespace: &'a str,
}

impl<'a> CertificateProvisioner<'a> {
    pub fn new(backend: &'a dyn Backend, namespace: &'a str) -> Self {
        Self { backend, namespace }
    }

    /// Execute the configured bootstrap path and return the issuer
    /// reference for the paths that register one.
    pub fn provision(
        &self,
        config: &SslConfig,
        fqdn: &str,
        waiter: &Waiter,
    ) -> Result<Option<&'static str>, ReconcileError> {
        match config {
            SslConfig::Provided {
                certificate,
                key,
                ca_chain,
            } => {
                info!("Storing provided SSL certificates");
                let cert = read_trust_material(certificate)?;
                let key = read_trust_material(key)?;
                let ca = read_trust_material(ca_chain)?;
                self.apply(resources::tls_secret(
                    self.namespace,
                    CERT_SECRET,
                    &cert,
                    &key,
                    &ca,
                ))?;
                self.publish_ca_certificate(&ca)?;
                Ok(None)
            }
            SslConfig::ReuseCa {
                ca_certificate,
                ca_key,
            } => {
                info!("Registering issuer for the existing CA");
                let cert = normalize_pem(&read_trust_material(ca_certificate)?);
                let key = normalize_pem(&read_trust_material(ca_key)?);
                self.apply(resources::tls_secret(
                    self.namespace,
                    CA_SECRET,
                    &cert,
                    &key,
                    &cert,
                ))?;
                self.apply(resources::ca_issuer(self.namespace, CA_ISSUER, CA_SECRET))?;
                self.await_issuer(waiter)?;
                self.issue_db_certificate(fqdn)?;
                self.publish_ca_certificate(&cert)?;
                Ok(Some(CA_ISSUER))
            }
            SslConfig::Generate { subject } => {
                info!("Generating a new self-signed CA");
                self.apply(resources::self_signed_issuer(self.namespace, SELF_SIGN_ISSUER))?;
                self.apply(resources::certificate(
                    self.namespace,
                    CA_SECRET,
                    CA_SECRET,
                    SELF_SIGN_ISSUER,
                    None,
                    true,
                    &subject_fields(subject),
                ))?;
                self.apply(resources::ca_issuer(self.namespace, CA_ISSUER, CA_SECRET))?;
                self.await_issuer(waiter)?;
                self.issue_db_certificate(fqdn)?;
                self.extract_ca_certificate()?;
                Ok(Some(CA_ISSUER))
            }
        }
    }

    fn apply(&self, resource: resources::Resource) -> Result<(), ReconcileError> {
        self.backend
            .apply(self.namespace, &resource)
            .map_err(|err| ReconcileError::step("provision certificates", err))
    }

    fn await_issuer(&self, waiter: &Waiter) -> Result<(), ReconcileError> {
        wait_for(
            self.backend,
            self.namespace,
            waiter,
            &crate::backend::WaitTarget::issuer(CA_ISSUER),
        )
    }

    /// Database serving certificate, issued directly since no ingress
    /// fronts the database.
    fn issue_db_certificate(&self, fqdn: &str) -> Result<(), ReconcileError> {
        self.apply(resources::certificate(
            self.namespace,
            DB_CERT_SECRET,
            DB_CERT_SECRET,
            CA_ISSUER,
            Some(fqdn),
            false,
            &[],
        ))
    }

    /// Copy the public CA certificate out of its secret into the trust
    /// config map. Skipped when already present.
    fn extract_ca_certificate(&self) -> Result<(), ReconcileError> {
        if self
            .backend
            .config_map_entry(self.namespace, CA_CONFIG_MAP, CA_CERT_KEY)
            .is_some()
        {
            debug!("CA trust config map already populated, skipping extraction");
            return Ok(());
        }
        let cert = self
            .backend
            .secret_entry(self.namespace, CA_SECRET, "tls.crt")
            .ok_or_else(|| {
                ReconcileError::step(
                    "provision certificates",
                    anyhow::anyhow!("generated CA secret {CA_SECRET} has no certificate"),
                )
            })?;
        self.publish_ca_certificate(&cert)
    }

    fn publish_ca_certificate(&self, cert: &str) -> Result<(), ReconcileError> {
        self.apply(resources::config_map(
            self.namespace,
            CA_CONFIG_MAP,
            &[(CA_CERT_KEY, cert)],
        ))
    }
}

fn subject_fields(subject: &CertSubject) -> Vec<(&'static str, &str)> {
    [
        ("countries", subject.country.as_deref()),
        ("provinces", subject.state.as_deref()),
        ("localities", subject.city.as_deref()),
        ("organizations", subject.organization.as_deref()),
        ("organizationalUnits", subject.unit.as_deref()),
    ]
    .into_iter()
    .filter_map(|(field, value)| value.map(|value| (field, value)))
    .collect()
}

/// Missing trust material is a precondition violation, caught before any
/// mutating step runs.
fn read_trust_material(path: &std::path::Path) -> Result<String, ReconcileError> {
    std::fs::read_to_string(path)
        .with_context(|| format!("cannot read trust material {}", path.display()))
        .map_err(|err| ReconcileError::Precondition(format!("{err:#}")))
}

/// Keep only the PEM blocks, dropping any human-readable text around them.
fn normalize_pem(text: &str) -> String {
    let mut out = String::new();
    let mut in_block = false;
    for line in text.lines() {
        if line.starts_with("-----BEGIN") {
            in_block = true;
        }
        if in_block {
            out.push_str(line);
            out.push('\n');
        }
        if line.starts_with("-----END") {
            in_block = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::backend::fake::FakeBackend;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n";

    fn pem_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{content}").unwrap();
        file
    }

    #[test]
    fn test_issuer_ref_per_path() {
        assert_eq!(SslConfig::default().issuer_ref(), Some(CA_ISSUER));
        let provided = SslConfig::Provided {
            certificate: "crt".into(),
            key: "key".into(),
            ca_chain: "ca".into(),
        };
        assert_eq!(provided.issuer_ref(), None);
    }

    #[test]
    fn test_normalize_pem_strips_surrounding_text() {
        let noisy = format!("Subject: CN=whatever\n{PEM}trailing notes\n");
        assert_eq!(normalize_pem(&noisy), PEM);
    }

    #[test]
    fn test_provided_path_stores_material_and_registers_no_issuer() {
        let backend = FakeBackend::new();
        let provisioner = CertificateProvisioner::new(&backend, "svc");
        let cert = pem_file(PEM);
        let key = pem_file(PEM);
        let ca = pem_file(PEM);
        let config = SslConfig::Provided {
            certificate: cert.path().into(),
            key: key.path().into(),
            ca_chain: ca.path().into(),
        };
        let issuer = provisioner
            .provision(&config, "srv.example.com", &Waiter::instant())
            .unwrap();
        assert_eq!(issuer, None);
        let ops = backend.ops();
        assert!(ops.contains(&"apply Secret/atrium-cert".to_string()));
        assert!(ops.contains(&"apply ConfigMap/atrium-ca".to_string()));
        assert!(!ops.iter().any(|op| op.contains("Issuer")));
    }

    #[test]
    fn test_provided_path_with_missing_file_is_a_precondition_error() {
        let backend = FakeBackend::new();
        let provisioner = CertificateProvisioner::new(&backend, "svc");
        let config = SslConfig::Provided {
            certificate: "/nonexistent/server.crt".into(),
            key: "/nonexistent/server.key".into(),
            ca_chain: "/nonexistent/ca.crt".into(),
        };
        let err = provisioner
            .provision(&config, "srv.example.com", &Waiter::instant())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
        assert!(backend.ops().is_empty());
    }

    #[test]
    fn test_generate_path_waits_for_issuer_and_extracts_ca() {
        let backend = FakeBackend::new();
        backend.secret_data.borrow_mut().insert(
            (CA_SECRET.to_string(), "tls.crt".to_string()),
            PEM.to_string(),
        );
        let provisioner = CertificateProvisioner::new(&backend, "svc");
        let issuer = provisioner
            .provision(&SslConfig::default(), "srv.example.com", &Waiter::instant())
            .unwrap();
        assert_eq!(issuer, Some(CA_ISSUER));
        let ops = backend.ops();
        assert!(ops.contains(&"apply Issuer/atrium-selfsign-issuer".to_string()));
        assert!(ops.contains(&"apply Issuer/atrium-ca-issuer".to_string()));
        assert!(ops.contains(&format!("poll {CA_ISSUER}")));
        assert!(ops.contains(&"apply ConfigMap/atrium-ca".to_string()));
    }

    #[test]
    fn test_issuer_timeout_names_the_issuer() {
        let backend = FakeBackend::new();
        backend.script_polls(std::iter::repeat_n(
            crate::backend::PollStatus::Pending,
            100,
        ));
        let provisioner = CertificateProvisioner::new(&backend, "svc");
        let err = provisioner
            .provision(&SslConfig::default(), "srv.example.com", &Waiter::instant())
            .unwrap_err();
        match err {
            ReconcileError::WaitTimeout { resource, seconds } => {
                assert_eq!(resource, CA_ISSUER);
                assert_eq!(seconds, 60);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_reuse_ca_normalizes_material_before_storing() {
        let backend = FakeBackend::new();
        let provisioner = CertificateProvisioner::new(&backend, "svc");
        let cert = pem_file(&format!("issuer text\n{PEM}"));
        let key = pem_file(PEM);
        let config = SslConfig::ReuseCa {
            ca_certificate: cert.path().into(),
            ca_key: key.path().into(),
        };
        let issuer = provisioner
            .provision(&config, "srv.example.com", &Waiter::instant())
            .unwrap();
        assert_eq!(issuer, Some(CA_ISSUER));
        assert!(backend.ops().contains(&"apply Secret/atrium-ca".to_string()));
    }
}
