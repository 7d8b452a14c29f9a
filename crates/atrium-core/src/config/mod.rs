//! Desired-state configuration for a reconciliation run.
//!
//! Loaded from an optional TOML file and overridden by CLI flags. Values
//! left unset here may be backfilled from the probed environment (DB
//! name/port, FQDN recorded in migrated data) before the plan is built.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::components::Component;
use crate::ssl::SslConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Namespace everything is deployed into.
    pub namespace: String,
    /// Fully qualified name the server answers on. Optional on upgrades,
    /// where the probed data provides it.
    pub fqdn: Option<String>,
    pub timezone: Option<String>,
    pub image: ImageConfig,
    pub registry: RegistryConfig,
    pub database: DatabaseConfig,
    /// First administrator account, created by the setup job.
    pub admin: Credentials,
    pub ssl: SslConfig,
    pub components: ComponentsConfig,
    pub volumes: VolumesConfig,
    pub migration: Option<MigrationConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            namespace: "atrium".to_string(),
            fqdn: None,
            timezone: None,
            image: ImageConfig::default(),
            registry: RegistryConfig::default(),
            database: DatabaseConfig::default(),
            admin: Credentials::default(),
            ssl: SslConfig::default(),
            components: ComponentsConfig::default(),
            volumes: VolumesConfig::default(),
            migration: None,
        }
    }
}

impl ServerConfig {
    /// Load from an explicit file, or from the default location when it
    /// exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(explicit) => Self::from_file(explicit),
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// `<config dir>/atrium/atriumadm.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("atrium").join("atriumadm.toml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.namespace.is_empty() {
            anyhow::bail!("namespace must not be empty");
        }
        if self.registry.host.is_empty() {
            anyhow::bail!("registry host must not be empty");
        }
        if let Some(fqdn) = &self.fqdn
            && !is_valid_fqdn(fqdn)
        {
            anyhow::bail!("'{fqdn}' is not a valid FQDN");
        }
        self.ssl.validate()
    }

    /// Full reference of the server image to converge on.
    pub fn target_image(&self) -> String {
        self.image.resolve(&self.registry.host, &self.image.name)
    }

    /// Image of the split database deployment.
    pub fn database_image(&self) -> String {
        match self.database.image.clone() {
            Some(explicit) => explicit,
            None => self.image.resolve(&self.registry.host, "atrium/db"),
        }
    }

    /// Image reference for one of the optional components.
    pub fn component_image(&self, component: Component) -> String {
        match self.components.get(component).image.clone() {
            Some(explicit) => explicit,
            None => self
                .image
                .resolve(&self.registry.host, component.image_name()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image name below the registry host.
    pub name: String,
    pub tag: String,
    pub pull_policy: String,
    /// Explicit image for the database upgrade job; derived from the
    /// engine versions when unset.
    pub upgrade_image: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: "atrium/server".to_string(),
            tag: "latest".to_string(),
            pull_policy: "IfNotPresent".to_string(),
            upgrade_image: None,
        }
    }
}

impl ImageConfig {
    fn resolve(&self, registry_host: &str, name: &str) -> String {
        format!("{registry_host}/{name}:{tag}", tag = self.tag)
    }

    /// Image carrying the tooling for one engine version transition.
    pub fn upgrade_image_ref(&self, registry_host: &str, from: u32, to: u32) -> String {
        match &self.upgrade_image {
            Some(explicit) => explicit.clone(),
            None => format!(
                "{registry_host}/{name}-migration-{from}-{to}:{tag}",
                name = self.name,
                tag = self.tag
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub host: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "registry.atrium.dev".to_string(),
            user: None,
            password: None,
        }
    }
}

impl RegistryConfig {
    pub fn has_credentials(&self) -> bool {
        self.user.is_some() && self.password.is_some()
    }

    /// Docker auth config document for the pull secret.
    pub fn auth_config(&self) -> Option<String> {
        let (user, password) = (self.user.as_ref()?, self.password.as_ref()?);
        Some(
            serde_json::json!({
                "auths": {(self.host.as_str()): {"username": user, "password": password}}
            })
            .to_string(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn is_set(&self) -> bool {
        self.user.is_some() && self.password.is_some()
    }

    pub fn pair(&self) -> Option<(&str, &str)> {
        Some((self.user.as_deref()?, self.password.as_deref()?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name; backfilled from inspected data when unset.
    pub name: Option<String>,
    /// Host of an externally managed database; unset means local.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Image of the split database deployment; derived when unset.
    pub image: Option<String>,
    pub credentials: Credentials,
    pub admin: Credentials,
    /// Report database account.
    pub report: Credentials,
}

impl DatabaseConfig {
    /// Whether the database runs inside the deployment itself.
    pub fn is_local(&self) -> bool {
        matches!(
            self.host.as_deref(),
            None | Some("localhost") | Some(crate::probe::DB_DEPLOY_NAME)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComponentsConfig {
    pub attestation: ComponentConfig,
    #[serde(rename = "hub-api")]
    pub hub_api: ComponentConfig,
    #[serde(rename = "event-processor")]
    pub event_processor: ComponentConfig,
}

impl ComponentsConfig {
    pub fn get(&self, component: Component) -> &ComponentConfig {
        match component {
            Component::Attestation => &self.attestation,
            Component::HubApi => &self.hub_api,
            Component::EventProcessor => &self.event_processor,
        }
    }

    pub fn get_mut(&mut self, component: Component) -> &mut ComponentConfig {
        match component {
            Component::Attestation => &mut self.attestation,
            Component::HubApi => &mut self.hub_api,
            Component::EventProcessor => &mut self.event_processor,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ComponentConfig {
    /// Tri-state: `None` inherits the probed count, `Some(0)` turns the
    /// component off explicitly.
    pub replicas: Option<u32>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    pub storage_class: Option<String>,
    pub database_size: String,
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self {
            storage_class: None,
            database_size: "50Gi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// FQDN of the server the data is pulled from.
    pub source_fqdn: String,
    #[serde(default = "default_migration_user")]
    pub user: String,
}

fn default_migration_user() -> String {
    "root".to_string()
}

/// Validate a fully qualified domain name.
pub fn is_valid_fqdn(fqdn: &str) -> bool {
    if fqdn.is_empty() || fqdn.len() > 253 || !fqdn.contains('.') {
        return false;
    }
    fqdn.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
