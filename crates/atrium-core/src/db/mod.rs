//! Database schema reconciliation.
//!
//! Compares the engine version of the on-disk data with the version shipped
//! in the target image and drives the upgrade, finalize and post-upgrade
//! jobs in order. Downgrades are rejected outright.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::{Backend, Timeout, WaitTarget};
use crate::error::ReconcileError;
use crate::plan::{ReconciliationPlan, Step, TaskExecutor, Waiter};
use crate::resources::{self, Resource, VolumeMount};

/// Claim holding the database data directory.
pub const DB_VOLUME_CLAIM: &str = "var-db";

pub const DB_UPGRADE_JOB: &str = "atrium-db-upgrade";
pub const DB_FINALIZE_JOB: &str = "atrium-db-finalize";
pub const POST_UPGRADE_JOB: &str = "atrium-post-upgrade";

/// Ordinal version of the database engine's on-disk format.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SchemaVersion(pub u32);

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SchemaVersion {
    type Err = std::num::ParseIntError;

    /// Accepts a bare major ("16") or a dotted version ("16.2"); only the
    /// major is ordinal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let major = s.trim().split('.').next().unwrap_or(s);
        major.parse().map(SchemaVersion)
    }
}

/// Everything the coordinator needs beyond the two versions.
#[derive(Debug, Clone)]
pub struct SchemaUpgradeContext {
    /// Image running the finalize and post-upgrade jobs.
    pub target_image: String,
    /// Image running the version-upgrade job; carries both engine versions.
    pub upgrade_image: Option<String>,
    pub pull_policy: String,
    pub pull_secret: Option<String>,
    /// A migration-finalize run reindexes even without a version change.
    pub is_migration: bool,
}

/// Coordinates the ordered database jobs of a reconciliation.
pub struct SchemaUpgradeCoordinator<'a> {
    backend: &'a dyn Backend,
    namespace: &'a str,
}

impl<'a> SchemaUpgradeCoordinator<'a> {
    pub fn new(backend: &'a dyn Backend, namespace: &'a str) -> Self {
        Self { backend, namespace }
    }

    /// Reject transitions the engine cannot perform. Non-retryable.
    pub fn check_transition(
        installed: Option<SchemaVersion>,
        target: Option<SchemaVersion>,
    ) -> Result<(), ReconcileError> {
        if let (Some(installed), Some(target)) = (installed, target)
            && installed > target
        {
            return Err(ReconcileError::precondition(format!(
                "downgrading the database engine from {installed} to {target} is not supported"
            )));
        }
        Ok(())
    }

    /// Build the ordered schema steps for splicing into a larger plan.
    ///
    /// The version-upgrade step is guarded by a precondition, so equal
    /// versions skip it as a no-op while finalize and post-upgrade still
    /// run.
    pub fn steps(
        &self,
        installed: Option<SchemaVersion>,
        target: Option<SchemaVersion>,
        ctx: &SchemaUpgradeContext,
    ) -> Result<Vec<Step<'a>>, ReconcileError> {
        Self::check_transition(installed, target)?;

        let backend = self.backend;
        let namespace = self.namespace;
        let change_pending =
            matches!((installed, target), (Some(from), Some(to)) if from < to);

        let mut steps = Vec::new();

        if let (Some(from), Some(to)) = (installed, target) {
            let upgrade_image = match (change_pending, ctx.upgrade_image.clone()) {
                (true, None) => {
                    return Err(ReconcileError::precondition(format!(
                        "no upgrade image available for the {from} to {to} engine transition"
                    )));
                }
                (_, image) => image,
            };
            let pull_policy = ctx.pull_policy.clone();
            let pull_secret = ctx.pull_secret.clone();
            steps.push(
                Step::run("upgrade database schema", move || {
                    let image = upgrade_image.as_deref().unwrap_or_default();
                    info!(
                        "Upgrading database engine from {from} to {to}, duration depends on the data size…"
                    );
                    let job = upgrade_job(namespace, image, &pull_policy, pull_secret.as_deref(), from, to);
                    let name = backend.run_job(namespace, &job)?;
                    Ok(Some(WaitTarget::job(name, Timeout::Infinite)))
                })
                .only_if(move |_| change_pending),
            );
        }

        let reindex = ctx.is_migration || change_pending;
        let target_image = ctx.target_image.clone();
        let pull_policy = ctx.pull_policy.clone();
        let pull_secret = ctx.pull_secret.clone();
        steps.push(Step::run("finalize database", move || {
            info!("Running database finalization, duration depends on the data size…");
            let job = finalize_job(namespace, &target_image, &pull_policy, pull_secret.as_deref(), reindex);
            let name = backend.run_job(namespace, &job)?;
            Ok(Some(WaitTarget::job(name, Timeout::Infinite)))
        }));

        let target_image = ctx.target_image.clone();
        let pull_policy = ctx.pull_policy.clone();
        let pull_secret = ctx.pull_secret.clone();
        steps.push(Step::run("run post-upgrade maintenance", move || {
            let job = post_upgrade_job(namespace, &target_image, &pull_policy, pull_secret.as_deref());
            let name = backend.run_job(namespace, &job)?;
            Ok(Some(WaitTarget::job(name, Timeout::Bounded(120))))
        }));

        Ok(steps)
    }

    /// Standalone contract: run the whole schema reconciliation to
    /// completion against the backend, waiting each job out before the
    /// next one is submitted.
    pub fn reconcile(
        &self,
        installed: Option<SchemaVersion>,
        target: Option<SchemaVersion>,
        ctx: &SchemaUpgradeContext,
        waiter: &Waiter,
    ) -> Result<(), ReconcileError> {
        let mut plan = ReconciliationPlan::new();
        plan.extend(self.steps(installed, target, ctx)?);
        let executor = TaskExecutor::new(self.backend, self.namespace, waiter);
        executor.run(&crate::probe::DeploymentState::default(), plan)
    }
}

fn upgrade_job(
    namespace: &str,
    image: &str,
    pull_policy: &str,
    pull_secret: Option<&str>,
    from: SchemaVersion,
    to: SchemaVersion,
) -> Resource {
    let script = format!(
        "set -e\n/usr/lib/atrium/db-upgrade.sh --from {from} --to {to} --data /var/lib/db/data\n"
    );
    resources::script_job(
        namespace,
        DB_UPGRADE_JOB,
        image,
        pull_policy,
        &[VolumeMount::new(DB_VOLUME_CLAIM, "/var/lib/db")],
        pull_secret,
        &script,
    )
}

fn finalize_job(
    namespace: &str,
    image: &str,
    pull_policy: &str,
    pull_secret: Option<&str>,
    reindex: bool,
) -> Resource {
    // The schema-definition check always runs; reindexing only after a
    // migration or an engine version change.
    let mut script = String::from("set -e\n");
    if reindex {
        script.push_str("/usr/lib/atrium/db-reindex.sh --data /var/lib/db/data\n");
    }
    script.push_str("/usr/lib/atrium/db-schema-check.sh\n");
    resources::script_job(
        namespace,
        DB_FINALIZE_JOB,
        image,
        pull_policy,
        &[
            VolumeMount::new(DB_VOLUME_CLAIM, "/var/lib/db"),
            VolumeMount::new("etc-server", "/etc/atrium"),
        ],
        pull_secret,
        &script,
    )
}

fn post_upgrade_job(
    namespace: &str,
    image: &str,
    pull_policy: &str,
    pull_secret: Option<&str>,
) -> Resource {
    resources::script_job(
        namespace,
        POST_UPGRADE_JOB,
        image,
        pull_policy,
        &[VolumeMount::new(DB_VOLUME_CLAIM, "/var/lib/db")],
        pull_secret,
        "set -e\n/usr/lib/atrium/post-upgrade.sh\n",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;

    fn ctx() -> SchemaUpgradeContext {
        SchemaUpgradeContext {
            target_image: "registry.example.com/atrium/server:latest".into(),
            upgrade_image: Some("registry.example.com/atrium/server-migration-14-16:latest".into()),
            pull_policy: "IfNotPresent".into(),
            pull_secret: None,
            is_migration: false,
        }
    }

    #[test]
    fn test_schema_version_parses_major() {
        assert_eq!("16".parse::<SchemaVersion>().unwrap(), SchemaVersion(16));
        assert_eq!("14.11".parse::<SchemaVersion>().unwrap(), SchemaVersion(14));
        assert!("pg16".parse::<SchemaVersion>().is_err());
    }

    #[test]
    fn test_downgrade_is_rejected_without_running_jobs() {
        let backend = FakeBackend::new();
        let coordinator = SchemaUpgradeCoordinator::new(&backend, "svc");
        let err = coordinator
            .reconcile(
                Some(SchemaVersion(16)),
                Some(SchemaVersion(14)),
                &ctx(),
                &Waiter::instant(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("downgrading"));
        assert!(backend.ops().is_empty());
    }

    #[test]
    fn test_equal_versions_skip_upgrade_but_run_finalize_and_post_upgrade() {
        let backend = FakeBackend::new();
        let coordinator = SchemaUpgradeCoordinator::new(&backend, "svc");
        coordinator
            .reconcile(
                Some(SchemaVersion(16)),
                Some(SchemaVersion(16)),
                &ctx(),
                &Waiter::instant(),
            )
            .unwrap();
        let jobs: Vec<String> = backend
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("job "))
            .collect();
        assert_eq!(jobs, vec!["job atrium-db-finalize", "job atrium-post-upgrade"]);
    }

    #[test]
    fn test_version_bump_runs_upgrade_job_with_infinite_wait() {
        let backend = FakeBackend::new();
        let coordinator = SchemaUpgradeCoordinator::new(&backend, "svc");
        let steps = coordinator
            .steps(Some(SchemaVersion(14)), Some(SchemaVersion(16)), &ctx())
            .unwrap();
        let mut gates = Vec::new();
        for step in steps {
            let name = step.name().to_string();
            if let crate::plan::Action::Execute(execute) = step.action
                && let Some(gate) = execute().unwrap()
            {
                gates.push((name, gate));
            }
        }
        assert_eq!(gates[0].0, "upgrade database schema");
        assert_eq!(gates[0].1.timeout, Timeout::Infinite);
        assert_eq!(gates[1].1.timeout, Timeout::Infinite);
        assert_eq!(gates[2].1.timeout, Timeout::Bounded(120));
        let jobs: Vec<String> = backend
            .ops()
            .into_iter()
            .filter(|op| op.starts_with("job "))
            .collect();
        assert_eq!(
            jobs,
            vec![
                "job atrium-db-upgrade",
                "job atrium-db-finalize",
                "job atrium-post-upgrade"
            ]
        );
    }

    #[test]
    fn test_missing_upgrade_image_is_a_precondition_error() {
        let backend = FakeBackend::new();
        let coordinator = SchemaUpgradeCoordinator::new(&backend, "svc");
        let mut context = ctx();
        context.upgrade_image = None;
        let err = coordinator
            .steps(Some(SchemaVersion(14)), Some(SchemaVersion(16)), &context)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Precondition(_)));
    }
}
