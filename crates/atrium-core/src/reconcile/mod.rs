//! Top-level reconciliation: probe, classify, plan, execute.
//!
//! The planner derives a [`DeploymentState`] snapshot, classifies the run
//! once, and assembles the ordered step list the [`TaskExecutor`] drives.
//! Nothing is rolled back on failure; every step is idempotent against the
//! live environment, so re-running the command after remediation converges
//! from wherever the previous run stopped.

use tracing::info;

use crate::backend::{Backend, ClusterInfo, IngressKind, Timeout, WaitTarget};
use crate::components::{Component, effective_replicas};
use crate::config::{ServerConfig, is_valid_fqdn};
use crate::db::{DB_VOLUME_CLAIM, SchemaUpgradeContext, SchemaUpgradeCoordinator};
use crate::error::ReconcileError;
use crate::migrate::{MigrationPreparer, SshMaterial, sync_volumes};
use crate::plan::{ReconciliationPlan, Step, TaskExecutor, Waiter};
use crate::probe::{
    Classification, DB_DEPLOY_NAME, DeploymentState, EnvironmentProbe, SERVER_DEPLOY_NAME,
};
use crate::resources::{self, VolumeMount};
use crate::ssl::{CERT_SECRET, CertificateProvisioner, DB_CERT_SECRET};

pub const SETUP_JOB: &str = "atrium-setup";
pub const PULL_SECRET: &str = "atrium-pull-secret";
pub const DB_SECRET: &str = "db-credentials";
pub const REPORTDB_SECRET: &str = "reportdb-credentials";
pub const DB_ADMIN_SECRET: &str = "db-admin-credentials";
pub const ADMIN_SECRET: &str = "admin-credentials";

/// Volume claims of the main service, beside the database claim.
pub const SERVER_VOLUMES: &[(&str, &str)] = &[
    ("etc-server", "1Gi"),
    ("var-cache", "10Gi"),
    ("var-spool", "50Gi"),
    ("srv-www", "20Gi"),
];

pub struct ReconciliationPlanner<'a> {
    backend: &'a dyn Backend,
    config: &'a ServerConfig,
    waiter: &'a Waiter,
}

impl<'a> ReconciliationPlanner<'a> {
    pub fn new(backend: &'a dyn Backend, config: &'a ServerConfig, waiter: &'a Waiter) -> Self {
        Self {
            backend,
            config,
            waiter,
        }
    }

    /// Converge the environment on the desired configuration.
    pub fn reconcile(&self) -> Result<(), ReconcileError> {
        let cluster = self
            .backend
            .check_cluster()
            .map_err(ReconcileError::Unreachable)?;
        let state = self.probe_state()?;
        let classification = state.classify();
        info!(%classification, "classified run");

        // Detect an impossible transition before anything mutates.
        SchemaUpgradeCoordinator::check_transition(state.installed_schema, state.target_schema)?;

        let fqdn = self.resolve_fqdn(&state)?;
        let target_image = self.config.target_image();
        let plan = self.build_plan(&state, classification, &cluster, &target_image, &fqdn)?;
        info!(steps = plan.len(), "executing reconciliation plan");

        let executor = TaskExecutor::new(self.backend, &self.config.namespace, self.waiter);
        executor.run(&state, plan)
    }

    /// Probe without mutating, for `status` and as the first phase of a
    /// reconciliation.
    pub fn probe_state(&self) -> Result<DeploymentState, ReconcileError> {
        let probe = EnvironmentProbe::new(self.backend);
        probe.inspect(
            &self.config.namespace,
            &self.config.target_image(),
            &self.config.image.pull_policy,
        )
    }

    /// Run the migration data sync, then reconcile; the follow-up run sees
    /// bound data without a deployment and finalizes the migration.
    pub fn migrate(&self, material: &SshMaterial) -> Result<(), ReconcileError> {
        let Some(migration) = &self.config.migration else {
            return Err(ReconcileError::precondition(
                "a migration source must be configured",
            ));
        };
        if !is_valid_fqdn(&migration.source_fqdn) {
            return Err(ReconcileError::precondition(format!(
                "'{}' is not a valid migration source FQDN",
                migration.source_fqdn
            )));
        }
        self.backend
            .check_cluster()
            .map_err(ReconcileError::Unreachable)?;

        let ns = self.config.namespace.as_str();
        let state = DeploymentState::default();
        let mut plan = ReconciliationPlan::new();
        self.push_namespace_steps(&mut plan);
        self.push_volume_step(&mut plan);

        let backend = self.backend;
        let preparer_material = material.clone();
        plan.push(Step::run("upload migration ssh material", move || {
            MigrationPreparer::new(backend, ns).upload_ssh_material(&preparer_material)?;
            Ok(None)
        }));
        TaskExecutor::new(self.backend, ns, self.waiter).run(&state, plan)?;

        let volumes = sync_volumes(SERVER_VOLUMES);
        MigrationPreparer::new(self.backend, ns).sync_data(
            migration,
            &self.config.target_image(),
            &self.config.image.pull_policy,
            self.pull_secret(),
            &volumes,
            self.waiter,
        )?;

        self.reconcile()
    }

    /// Prefer the FQDN recorded in existing data over the configured one;
    /// an upgrade must keep answering on the name the data was set up for.
    fn resolve_fqdn(&self, state: &DeploymentState) -> Result<String, ReconcileError> {
        let inspected = state
            .inspected
            .as_ref()
            .and_then(|facts| facts.fqdn.clone());
        let fqdn = inspected.or_else(|| self.config.fqdn.clone()).ok_or_else(|| {
            ReconcileError::precondition("an FQDN for the server is required")
        })?;
        if !is_valid_fqdn(&fqdn) {
            return Err(ReconcileError::precondition(format!(
                "'{fqdn}' is not a valid FQDN"
            )));
        }
        Ok(fqdn)
    }

    fn pull_secret(&self) -> Option<&'static str> {
        self.config.registry.has_credentials().then_some(PULL_SECRET)
    }

    fn push_namespace_steps(&self, plan: &mut ReconciliationPlan<'a>) {
        let backend = self.backend;
        let ns = self.config.namespace.as_str();
        plan.push(
            Step::run("create namespace", move || {
                backend.apply(ns, &resources::namespace(ns))?;
                Ok(None)
            })
            .skip_when(move || backend.has_namespace(ns)),
        );

        if let Some(auth_config) = self.config.registry.auth_config() {
            plan.push(Step::run("create registry pull secret", move || {
                backend.apply(ns, &resources::registry_secret(ns, PULL_SECRET, &auth_config))?;
                Ok(None)
            }));
        }
    }

    fn push_volume_step(&self, plan: &mut ReconciliationPlan<'a>) {
        let backend = self.backend;
        let ns = self.config.namespace.as_str();
        let storage_class = self.config.volumes.storage_class.clone();
        let mut claims: Vec<(String, String)> = SERVER_VOLUMES
            .iter()
            .map(|(claim, size)| (claim.to_string(), size.to_string()))
            .collect();
        if self.config.database.is_local() {
            claims.push((
                DB_VOLUME_CLAIM.to_string(),
                self.config.volumes.database_size.clone(),
            ));
        }
        plan.push(Step::run("create volume claims", move || {
            for (claim, size) in &claims {
                // A bound claim is never touched again.
                if backend.has_volume(ns, claim) {
                    continue;
                }
                backend.apply(
                    ns,
                    &resources::persistent_volume_claim(ns, claim, size, storage_class.as_deref()),
                )?;
            }
            Ok(None)
        }));
    }

    fn build_plan(
        &self,
        state: &DeploymentState,
        classification: Classification,
        cluster: &ClusterInfo,
        target_image: &str,
        fqdn: &str,
    ) -> Result<ReconciliationPlan<'a>, ReconcileError> {
        let backend = self.backend;
        let ns = self.config.namespace.as_str();
        let waiter = self.waiter;
        let pull_secret = self.pull_secret();
        let pull_policy = self.config.image.pull_policy.clone();

        let mut plan = ReconciliationPlan::new();
        self.push_namespace_steps(&mut plan);
        self.push_volume_step(&mut plan);

        if classification == Classification::Upgrade {
            // The database goes down during a schema change; nothing may
            // hold connections to it, and the clients go first.
            let clients: Vec<&'static str> = Component::ALL
                .into_iter()
                .filter(|component| component.depends_on_database())
                .filter(|component| {
                    state
                        .component_replicas
                        .get(component)
                        .is_some_and(|replicas| *replicas > 0)
                })
                .map(Component::deploy_name)
                .collect();
            plan.push(
                Step::run("quiesce database clients", move || {
                    for deploy in clients {
                        backend.scale(ns, deploy, 0)?;
                    }
                    Ok(None)
                })
                .only_if(|state| state.has_running_deployment && state.schema_change_pending()),
            );
            plan.push(
                Step::run("stop server for schema change", move || {
                    backend.scale(ns, SERVER_DEPLOY_NAME, 0)?;
                    Ok(None)
                })
                .only_if(|state| state.has_running_deployment && state.schema_change_pending()),
            );
        }

        if state.has_bound_db_volume {
            let upgrade_image = match (state.installed_schema, state.target_schema) {
                (Some(from), Some(to)) if from < to => Some(self.config.image.upgrade_image_ref(
                    &self.config.registry.host,
                    from.0,
                    to.0,
                )),
                _ => self.config.image.upgrade_image.clone(),
            };
            let ctx = SchemaUpgradeContext {
                target_image: target_image.to_string(),
                upgrade_image,
                pull_policy: pull_policy.clone(),
                pull_secret: pull_secret.map(str::to_string),
                is_migration: state.is_migration(),
            };
            let coordinator = SchemaUpgradeCoordinator::new(backend, ns);
            plan.extend(coordinator.steps(state.installed_schema, state.target_schema, &ctx)?);
        }

        // Trust material precedes anything that exposes or awaits it.
        let ssl = self.config.ssl.clone();
        let issuer = ssl.issuer_ref();
        let cert_fqdn = fqdn.to_string();
        plan.push(Step::run("provision certificates", move || {
            let provisioner = CertificateProvisioner::new(backend, ns);
            provisioner.provision(&ssl, &cert_fqdn, waiter)?;
            Ok(None)
        }));

        // The ingress triggers issuance of the serving certificate, so it
        // exists before anything waits on that secret.
        let ingress_fqdn = fqdn.to_string();
        plan.push(Step::run("create ingress", move || {
            backend.apply(
                ns,
                &resources::ingress(
                    ns,
                    "atrium",
                    &ingress_fqdn,
                    CERT_SECRET,
                    issuer,
                    SERVER_DEPLOY_NAME,
                    443,
                ),
            )?;
            Ok(None)
        }));
        plan.push(Step::awaiting(
            "wait for serving certificate",
            vec![WaitTarget::secret(CERT_SECRET)],
        ));

        // Unset database coordinates fall back to what the inspected data
        // recorded, then to the product defaults.
        let inspected = state.inspected.as_ref();
        let db_name = self
            .config
            .database
            .name
            .clone()
            .or_else(|| inspected.and_then(|facts| facts.db_name.clone()))
            .unwrap_or_else(|| "atrium".to_string());
        let db_port = self
            .config
            .database
            .port
            .or_else(|| inspected.and_then(|facts| facts.db_port))
            .unwrap_or(5432);
        let db_local = self.config.database.is_local();
        let db_host = if db_local {
            DB_DEPLOY_NAME.to_string()
        } else {
            self.config.database.host.clone().unwrap_or_default()
        };

        plan.push(Step::run("create services", move || {
            backend.apply(
                ns,
                &resources::service(
                    ns,
                    SERVER_DEPLOY_NAME,
                    SERVER_DEPLOY_NAME,
                    &[("http", 80), ("https", 443)],
                ),
            )?;
            if db_local {
                backend.apply(
                    ns,
                    &resources::service(ns, DB_DEPLOY_NAME, DB_DEPLOY_NAME, &[("db", db_port)]),
                )?;
            }
            Ok(None)
        }));

        for (step_name, secret_name, credentials) in [
            ("store database credentials", DB_SECRET, &self.config.database.credentials),
            ("store report database credentials", REPORTDB_SECRET, &self.config.database.report),
            ("store administrator credentials", ADMIN_SECRET, &self.config.admin),
        ] {
            if let Some((user, password)) = credentials.pair() {
                let (user, password) = (user.to_string(), password.to_string());
                plan.push(Step::run(step_name, move || {
                    backend.apply(
                        ns,
                        &resources::basic_auth_secret(ns, secret_name, &user, &password),
                    )?;
                    Ok(None)
                }));
            }
        }

        if classification == Classification::FreshInstall {
            self.push_db_bootstrap_steps(&mut plan, issuer.is_some())?;
        }

        let setup = setup_job(
            ns,
            target_image,
            &pull_policy,
            pull_secret,
            fqdn,
            self.config.timezone.as_deref().unwrap_or("UTC"),
            &db_host,
            &db_name,
            db_port,
        );
        plan.push(Step::run("run setup job", move || {
            let name = backend.run_job(ns, &setup)?;
            Ok(Some(WaitTarget::job(name, Timeout::Bounded(120))))
        }));

        if cluster.ingress == Some(IngressKind::Traefik) {
            plan.push(Step::run("create proxy routes", move || {
                for (route, port) in [("events-in", 5556u16), ("events-out", 5557)] {
                    backend.apply(
                        ns,
                        &resources::traefik_tcp_route(ns, route, SERVER_DEPLOY_NAME, port),
                    )?;
                }
                Ok(None)
            }));
        }

        let server = server_deployment(ns, target_image, &pull_policy, pull_secret, db_local);
        plan.push(Step::run("start server", move || {
            backend.apply(ns, &server)?;
            Ok(None)
        }));

        let mut starting = vec![WaitTarget::deployment(SERVER_DEPLOY_NAME)];
        for component in Component::ALL {
            let replicas = effective_replicas(
                self.config.components.get(component).replicas,
                state.component_replicas.get(&component).copied(),
            );
            if replicas == 0 {
                continue;
            }
            let image = self.config.component_image(component);
            let policy = pull_policy.clone();
            let step_name = format!("start {}", component.deploy_name());
            let (host, name, port) = (db_host.clone(), db_name.clone(), db_port.to_string());
            plan.push(Step::run(step_name, move || {
                // Database clients get told where the database lives.
                let mut env: Vec<(&str, &str)> = Vec::new();
                if component.depends_on_database() {
                    env.push(("ATRIUM_DB_HOST", host.as_str()));
                    env.push(("ATRIUM_DB_NAME", name.as_str()));
                    env.push(("ATRIUM_DB_PORT", port.as_str()));
                }
                backend.apply(
                    ns,
                    &resources::deployment(
                        ns,
                        component.deploy_name(),
                        &image,
                        &policy,
                        replicas,
                        &[],
                        &env,
                        pull_secret,
                    ),
                )?;
                if component == Component::HubApi {
                    backend.apply(
                        ns,
                        &resources::service(
                            ns,
                            component.deploy_name(),
                            component.deploy_name(),
                            &[("hub-api", 2830)],
                        ),
                    )?;
                }
                Ok(None)
            }));
            starting.push(WaitTarget::deployment(component.deploy_name()));
        }

        // One readiness gate over everything that was started.
        plan.push(Step::awaiting("wait for services to come up", starting));

        Ok(plan)
    }

    /// Fresh installs bring up the split database: its secrets must exist
    /// before the deployment reads them.
    fn push_db_bootstrap_steps(
        &self,
        plan: &mut ReconciliationPlan<'a>,
        issuer_based_ssl: bool,
    ) -> Result<(), ReconcileError> {
        let backend = self.backend;
        let ns = self.config.namespace.as_str();
        let database = &self.config.database;

        if !database.credentials.is_set() {
            return Err(ReconcileError::precondition(
                "database credentials are required for a fresh install",
            ));
        }

        let mut gates = vec![WaitTarget::secret(DB_SECRET), WaitTarget::secret(REPORTDB_SECRET)];
        if issuer_based_ssl {
            gates.push(WaitTarget::secret(DB_CERT_SECRET));
        }
        plan.push(Step::awaiting("wait for database secrets", gates));

        if database.is_local() {
            let Some((user, password)) = database.admin.pair() else {
                return Err(ReconcileError::precondition(
                    "database admin credentials are required to bootstrap a local database",
                ));
            };
            let (user, password) = (user.to_string(), password.to_string());
            plan.push(Step::run("store database admin credentials", move || {
                backend.apply(
                    ns,
                    &resources::basic_auth_secret(ns, DB_ADMIN_SECRET, &user, &password),
                )?;
                Ok(None)
            }));

            let db_image = self.config.database_image();
            let pull_policy = self.config.image.pull_policy.clone();
            let pull_secret = self.pull_secret();
            let timezone = self.config.timezone.clone().unwrap_or_else(|| "UTC".into());
            plan.push(Step::run("start database deployment", move || {
                let mounts = [VolumeMount::new(DB_VOLUME_CLAIM, "/var/lib/db")];
                let env = [("TZ", timezone.as_str())];
                backend.apply(
                    ns,
                    &resources::deployment(
                        ns,
                        DB_DEPLOY_NAME,
                        &db_image,
                        &pull_policy,
                        1,
                        &mounts,
                        &env,
                        pull_secret,
                    ),
                )?;
                Ok(Some(WaitTarget::deployment(DB_DEPLOY_NAME)))
            }));
        }
        Ok(())
    }
}

fn server_deployment(
    ns: &str,
    image: &str,
    pull_policy: &str,
    pull_secret: Option<&str>,
    db_local: bool,
) -> resources::Resource {
    let mut mounts: Vec<VolumeMount> = SERVER_VOLUMES
        .iter()
        .map(|(claim, _)| VolumeMount::new(claim, &format!("/srv/atrium/{claim}")))
        .collect();
    if db_local {
        mounts.push(VolumeMount::new(DB_VOLUME_CLAIM, "/var/lib/db"));
    }
    resources::deployment(
        ns,
        SERVER_DEPLOY_NAME,
        image,
        pull_policy,
        1,
        &mounts,
        &[],
        pull_secret,
    )
}

#[allow(clippy::too_many_arguments)]
fn setup_job(
    ns: &str,
    image: &str,
    pull_policy: &str,
    pull_secret: Option<&str>,
    fqdn: &str,
    timezone: &str,
    db_host: &str,
    db_name: &str,
    db_port: u16,
) -> resources::Resource {
    // The setup script exits early when the server was already set up, so
    // re-running it on upgrades is harmless.
    let script = format!(
        "set -e\nATRIUM_FQDN={fqdn} ATRIUM_TZ={timezone} /usr/lib/atrium/setup.sh \
         --db-host {db_host} --db-name {db_name} --db-port {db_port} \
         --admin-secret {ADMIN_SECRET} --db-secret {DB_SECRET} --reportdb-secret {REPORTDB_SECRET}\n"
    );
    let mounts: Vec<VolumeMount> = SERVER_VOLUMES
        .iter()
        .map(|(claim, _)| VolumeMount::new(claim, &format!("/srv/atrium/{claim}")))
        .collect();
    resources::script_job(ns, SETUP_JOB, image, pull_policy, &mounts, pull_secret, &script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ImageFacts;
    use crate::backend::fake::FakeBackend;
    use crate::db::SchemaVersion;

    fn config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.namespace = "svc".into();
        config.fqdn = Some("srv.example.com".into());
        config.registry.host = "reg.example.com".into();
        config.image.tag = "2024.8.0".into();
        config.database.credentials = crate::config::Credentials {
            user: Some("atrium".into()),
            password: Some("dbpass".into()),
        };
        config.database.report = crate::config::Credentials {
            user: Some("report".into()),
            password: Some("rppass".into()),
        };
        config.database.admin = crate::config::Credentials {
            user: Some("dbadmin".into()),
            password: Some("adminpass".into()),
        };
        config.admin = crate::config::Credentials {
            user: Some("admin".into()),
            password: Some("webpass".into()),
        };
        config
    }

    fn target_image() -> String {
        config().target_image()
    }

    fn facts(data: u32, image: u32, release: &str) -> ImageFacts {
        ImageFacts {
            product_release: Some(release.to_string()),
            image_schema_version: Some(SchemaVersion(image)),
            data_schema_version: Some(SchemaVersion(data)),
            ..Default::default()
        }
    }

    fn seed_generated_ca(backend: &FakeBackend) {
        backend.secret_data.borrow_mut().insert(
            (crate::ssl::CA_SECRET.to_string(), "tls.crt".to_string()),
            "CERT".to_string(),
        );
    }

    #[test]
    fn test_fresh_install_plan_shape() {
        let backend = FakeBackend::new();
        seed_generated_ca(&backend);
        let config = config();
        let waiter = Waiter::instant();
        let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
        planner.reconcile().unwrap();

        let ops = backend.ops();
        // No schema work on a fresh install.
        assert!(!ops.contains(&"job atrium-db-upgrade".to_string()));
        assert!(!ops.contains(&"job atrium-db-finalize".to_string()));
        // Generated CA path registered issuers.
        assert!(ops.contains(&"apply Issuer/atrium-ca-issuer".to_string()));
        // Setup ran, the split database came up, the server started.
        assert!(ops.contains(&"job atrium-setup".to_string()));
        assert!(ops.contains(&"apply Deployment/atrium-db".to_string()));
        assert!(ops.contains(&"apply Deployment/atrium-server".to_string()));
        // The final readiness gate covers exactly the main service when no
        // optional components are requested.
        assert_eq!(ops.last().map(String::as_str), Some("poll atrium-server"));
        assert!(!ops.iter().any(|op| op.contains("atrium-attestation")));
    }

    #[test]
    fn test_upgrade_quiesces_clients_before_schema_upgrade() {
        let backend = FakeBackend::new();
        let image = target_image();
        backend.seed_volume(DB_VOLUME_CLAIM);
        backend.seed_namespace("svc");
        backend.seed_deployment(SERVER_DEPLOY_NAME, 1);
        backend.seed_deployment("atrium-attestation", 2);
        *backend.server_image.borrow_mut() = Some("reg.example.com/atrium/server:2024.3.0".into());
        backend.seed_image_facts(&image, facts(14, 16, "2024.8.0"));
        backend.seed_image_facts(
            "reg.example.com/atrium/server:2024.3.0",
            facts(14, 14, "2024.3.0"),
        );
        seed_generated_ca(&backend);

        let config = config();
        let waiter = Waiter::instant();
        let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
        planner.reconcile().unwrap();

        let ops = backend.ops();
        let scale_clients = ops
            .iter()
            .position(|op| op == "scale atrium-attestation=0")
            .expect("attestation client scaled down");
        let scale_server = ops
            .iter()
            .position(|op| op == "scale atrium-server=0")
            .expect("server scaled down");
        let upgrade = ops
            .iter()
            .position(|op| op == "job atrium-db-upgrade")
            .expect("upgrade job ran");
        assert!(scale_clients < scale_server);
        assert!(scale_server < upgrade);
        // Attestation replicas were inherited from the probed count.
        assert!(ops.contains(&"apply Deployment/atrium-attestation".to_string()));
    }

    #[test]
    fn test_downgrade_aborts_before_any_mutation() {
        let backend = FakeBackend::new();
        let image = target_image();
        backend.seed_volume(DB_VOLUME_CLAIM);
        backend.seed_image_facts(&image, facts(16, 14, "2024.8.0"));

        let config = config();
        let waiter = Waiter::instant();
        let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
        let err = planner.reconcile().unwrap_err();
        assert!(err.to_string().contains("downgrading"));
        assert!(backend.ops().is_empty());
    }

    #[test]
    fn test_migration_finalize_reindexes_without_version_change() {
        let backend = FakeBackend::new();
        let image = target_image();
        backend.seed_volume(DB_VOLUME_CLAIM);
        backend.seed_image_facts(&image, facts(16, 16, "2024.8.0"));
        seed_generated_ca(&backend);
        // The migrated data carries its own FQDN, which wins.
        backend
            .image_facts
            .borrow_mut()
            .get_mut(&image)
            .unwrap()
            .fqdn = Some("migrated.example.com".into());

        let config = config();
        let waiter = Waiter::instant();
        let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
        planner.reconcile().unwrap();

        let ops = backend.ops();
        assert!(!ops.contains(&"job atrium-db-upgrade".to_string()));
        assert!(ops.contains(&"job atrium-db-finalize".to_string()));
        assert!(ops.contains(&"job atrium-post-upgrade".to_string()));
        // No fresh-install database bootstrap on a migration.
        assert!(!ops.contains(&"apply Deployment/atrium-db".to_string()));
    }

    #[test]
    fn test_unreachable_environment_aborts() {
        let backend = FakeBackend::new();
        *backend.reachable.borrow_mut() = false;
        let config = config();
        let waiter = Waiter::instant();
        let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
        let err = planner.reconcile().unwrap_err();
        assert!(matches!(err, ReconcileError::Unreachable(_)));
    }

    #[test]
    fn test_explicit_zero_override_disables_inherited_component() {
        let backend = FakeBackend::new();
        let image = target_image();
        backend.seed_volume(DB_VOLUME_CLAIM);
        backend.seed_namespace("svc");
        backend.seed_deployment(SERVER_DEPLOY_NAME, 1);
        backend.seed_deployment("atrium-hub-api", 1);
        *backend.server_image.borrow_mut() = Some("reg.example.com/atrium/server:2024.3.0".into());
        backend.seed_image_facts(&image, facts(16, 16, "2024.8.0"));
        backend.seed_image_facts(
            "reg.example.com/atrium/server:2024.3.0",
            facts(16, 16, "2024.3.0"),
        );
        seed_generated_ca(&backend);

        let mut config = config();
        config.components.hub_api.replicas = Some(0);
        let waiter = Waiter::instant();
        let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
        planner.reconcile().unwrap();

        assert!(!backend.ops().contains(&"apply Deployment/atrium-hub-api".to_string()));
    }

    #[test]
    fn test_migrate_requires_a_source() {
        let backend = FakeBackend::new();
        let config = config();
        let waiter = Waiter::instant();
        let planner = ReconciliationPlanner::new(&backend, &config, &waiter);
        let material = SshMaterial {
            key: "KEY".into(),
            public_key: None,
            config: None,
            known_hosts: None,
        };
        let err = planner.migrate(&material).unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
    }
}
