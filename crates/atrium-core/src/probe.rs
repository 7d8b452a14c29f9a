//! Environment probe: derive the deployment state of a target namespace.
//!
//! Pure read, no side effects. Absence of a resource is a value, not an
//! error; only failing to inspect an image the classification depends on
//! aborts the probe.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::backend::{Backend, ImageFacts};
use crate::components::Component;
use crate::db::{DB_VOLUME_CLAIM, SchemaVersion};
use crate::error::ReconcileError;

/// Main service deployment.
pub const SERVER_DEPLOY_NAME: &str = "atrium-server";

/// Split database deployment, present when the database is local.
pub const DB_DEPLOY_NAME: &str = "atrium-db";

/// Label selector matching the main service deployment and its pods.
pub const SERVER_SELECTOR: &str = "component=atrium-server";

/// Immutable snapshot of the target environment, taken once per run.
#[derive(Debug, Clone, Default)]
pub struct DeploymentState {
    /// The main service is deployed.
    pub has_running_deployment: bool,
    /// Persistent database storage exists and is bound.
    pub has_bound_db_volume: bool,
    /// Image reference of the running deployment, if any.
    pub running_image: Option<String>,
    /// Engine version of the on-disk data.
    pub installed_schema: Option<SchemaVersion>,
    /// Engine version shipped in the target image.
    pub target_schema: Option<SchemaVersion>,
    /// Replica counts of the optional components found in the namespace,
    /// preserved across upgrades unless explicitly overridden.
    pub component_replicas: BTreeMap<Component, u32>,
    /// Facts read from the target image against the bound volumes, used to
    /// backfill unset configuration (DB name/port, FQDN).
    pub inspected: Option<ImageFacts>,
}

impl DeploymentState {
    /// Data was copied in but the service never started against it.
    pub fn is_migration(&self) -> bool {
        self.has_bound_db_volume && !self.has_running_deployment
    }

    /// A schema upgrade job will have to run before services start.
    pub fn schema_change_pending(&self) -> bool {
        matches!(
            (self.installed_schema, self.target_schema),
            (Some(installed), Some(target)) if installed < target
        )
    }

    pub fn classify(&self) -> Classification {
        if self.has_running_deployment {
            Classification::Upgrade
        } else if self.has_bound_db_volume {
            Classification::MigrationFinalize
        } else {
            Classification::FreshInstall
        }
    }
}

/// What kind of run this is, computed once and pattern-matched when
/// building the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    FreshInstall,
    Upgrade,
    MigrationFinalize,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Classification::FreshInstall => "fresh install",
            Classification::Upgrade => "upgrade",
            Classification::MigrationFinalize => "migration finalize",
        };
        f.write_str(label)
    }
}

pub struct EnvironmentProbe<'a> {
    backend: &'a dyn Backend,
}

impl<'a> EnvironmentProbe<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self { backend }
    }

    /// Inspect the namespace and derive the deployment state.
    pub fn inspect(
        &self,
        namespace: &str,
        target_image: &str,
        pull_policy: &str,
    ) -> Result<DeploymentState, ReconcileError> {
        let has_running_deployment = self.backend.has_deployment(namespace, SERVER_SELECTOR);
        let has_bound_db_volume = self.backend.has_volume(namespace, DB_VOLUME_CLAIM);
        let running_image = self.backend.running_image(namespace, SERVER_SELECTOR);

        let mut component_replicas = BTreeMap::new();
        for component in Component::ALL {
            if let Some(replicas) = self.backend.replicas(namespace, component.deploy_name()) {
                component_replicas.insert(component, replicas);
            }
        }

        let mut installed_schema = None;
        let mut target_schema = None;
        let mut inspected = None;
        if has_bound_db_volume {
            // The upgrade delta needs the target image's engine version and
            // the on-disk data version; both come from one inspection run.
            let facts = self
                .backend
                .inspect_image(namespace, target_image, pull_policy)
                .map_err(|err| ReconcileError::step("inspect target image", err))?;
            installed_schema = facts.data_schema_version;
            target_schema = facts.image_schema_version;

            // The running image is inspected separately so the upgrade
            // sanity check compares what actually runs, not what is wanted.
            let running_facts = match &running_image {
                Some(image) => Some(
                    self.backend
                        .inspect_image(namespace, image, "Never")
                        .map_err(|err| ReconcileError::step("inspect running image", err))?,
                ),
                None => None,
            };
            sanity_check(running_facts.as_ref(), &facts)?;
            inspected = Some(facts);
        }

        let state = DeploymentState {
            has_running_deployment,
            has_bound_db_volume,
            running_image,
            installed_schema,
            target_schema,
            component_replicas,
            inspected,
        };
        debug!(
            deployment = state.has_running_deployment,
            db_volume = state.has_bound_db_volume,
            classification = %state.classify(),
            "probed environment"
        );
        Ok(state)
    }
}

/// Reject upgrades the engine cannot perform before anything mutates.
fn sanity_check(
    running: Option<&ImageFacts>,
    inspected: &ImageFacts,
) -> Result<(), ReconcileError> {
    let Some(target_release) = inspected.product_release.as_deref() else {
        return Err(ReconcileError::precondition(
            "cannot determine the product release of the target image",
        ));
    };

    if let Some(running_release) = running.and_then(|facts| facts.product_release.as_deref()) {
        let (Some(target), Some(current)) =
            (parse_release(target_release), parse_release(running_release))
        else {
            return Err(ReconcileError::precondition(format!(
                "cannot compare product releases '{running_release}' and '{target_release}'"
            )));
        };
        if target <= current {
            return Err(ReconcileError::precondition(format!(
                "this is not an upgrade: deployed release {running_release} is not older than image release {target_release}"
            )));
        }
    }

    if inspected.image_schema_version.is_none() {
        return Err(ReconcileError::precondition(
            "cannot determine the database engine version of the target image",
        ));
    }
    if inspected.data_schema_version.is_none() {
        return Err(ReconcileError::precondition(
            "the database engine version of the existing data cannot be determined",
        ));
    }
    Ok(())
}

/// Parse a product release, padding two-component releases to semver form.
fn parse_release(release: &str) -> Option<semver::Version> {
    semver::Version::parse(release)
        .ok()
        .or_else(|| semver::Version::parse(&format!("{release}.0")).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;

    const IMAGE: &str = "registry.example.com/atrium/server:2024.8.0";

    fn facts(data: u32, image: u32, release: &str) -> ImageFacts {
        ImageFacts {
            product_release: Some(release.to_string()),
            image_schema_version: Some(SchemaVersion(image)),
            data_schema_version: Some(SchemaVersion(data)),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_namespace_classifies_as_fresh_install() {
        let backend = FakeBackend::new();
        let probe = EnvironmentProbe::new(&backend);
        let state = probe.inspect("svc", IMAGE, "IfNotPresent").unwrap();
        assert_eq!(state.classify(), Classification::FreshInstall);
        assert!(!state.is_migration());
        assert!(state.installed_schema.is_none());
    }

    #[test]
    fn test_bound_volume_without_deployment_is_a_migration() {
        let backend = FakeBackend::new();
        backend.seed_volume(DB_VOLUME_CLAIM);
        backend.seed_image_facts(IMAGE, facts(16, 16, "2024.8.0"));
        let probe = EnvironmentProbe::new(&backend);
        let state = probe.inspect("svc", IMAGE, "IfNotPresent").unwrap();
        assert_eq!(state.classify(), Classification::MigrationFinalize);
        assert!(state.is_migration());
        assert_eq!(state.installed_schema, Some(SchemaVersion(16)));
    }

    #[test]
    fn test_running_deployment_with_data_is_an_upgrade_not_a_migration() {
        let backend = FakeBackend::new();
        backend.seed_volume(DB_VOLUME_CLAIM);
        *backend.server_image.borrow_mut() = Some("registry.example.com/atrium/server:2024.3.0".into());
        backend.seed_image_facts(IMAGE, facts(14, 16, "2024.8.0"));
        backend.seed_image_facts(
            "registry.example.com/atrium/server:2024.3.0",
            facts(14, 14, "2024.3.0"),
        );
        let probe = EnvironmentProbe::new(&backend);
        let state = probe.inspect("svc", IMAGE, "IfNotPresent").unwrap();
        assert_eq!(state.classify(), Classification::Upgrade);
        assert!(!state.is_migration());
        assert!(state.schema_change_pending());
    }

    #[test]
    fn test_running_deployment_without_volume_is_still_an_upgrade() {
        let state = DeploymentState {
            has_running_deployment: true,
            ..Default::default()
        };
        assert_eq!(state.classify(), Classification::Upgrade);
    }

    #[test]
    fn test_component_replicas_are_collected() {
        let backend = FakeBackend::new();
        backend.seed_deployment("atrium-attestation", 2);
        let probe = EnvironmentProbe::new(&backend);
        let state = probe.inspect("svc", IMAGE, "IfNotPresent").unwrap();
        assert_eq!(
            state.component_replicas.get(&Component::Attestation),
            Some(&2)
        );
        assert!(!state.component_replicas.contains_key(&Component::HubApi));
    }

    #[test]
    fn test_sanity_check_rejects_non_upgrade() {
        let running = facts(16, 16, "2024.8.0");
        let target = facts(16, 16, "2024.8.0");
        let err = sanity_check(Some(&running), &target).unwrap_err();
        assert!(err.to_string().contains("not an upgrade"));
    }

    #[test]
    fn test_sanity_check_accepts_newer_target_release() {
        let running = facts(14, 14, "2024.3.0");
        let target = facts(14, 16, "2024.8.0");
        assert!(sanity_check(Some(&running), &target).is_ok());
    }

    #[test]
    fn test_sanity_check_pads_two_component_releases() {
        assert_eq!(parse_release("2024.3"), semver::Version::parse("2024.3.0").ok());
    }

    #[test]
    fn test_sanity_check_requires_engine_version_in_image() {
        let mut target = facts(14, 16, "2024.8.0");
        target.image_schema_version = None;
        let err = sanity_check(None, &target).unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
    }
}
