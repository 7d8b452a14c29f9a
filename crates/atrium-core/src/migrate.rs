//! Migration source preparation and data synchronization.
//!
//! Moving an existing server onto this deployment happens in two phases:
//! the data-sync job pulls the raw data from the source host over SSH, and
//! a normal reconciliation afterwards finalizes it (classified as a
//! migration because data exists without a running service).

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::info;

use crate::backend::{Backend, Timeout, WaitTarget};
use crate::config::MigrationConfig;
use crate::db::DB_VOLUME_CLAIM;
use crate::error::ReconcileError;
use crate::plan::Waiter;
use crate::plan::executor::wait_for;
use crate::resources::{self, VolumeMount};

pub const DATA_SYNC_JOB: &str = "atrium-data-sync";
pub const SSH_KEY_SECRET: &str = "atrium-migration-key";
pub const SSH_CONFIG_MAP: &str = "atrium-migration-ssh";

/// SSH material mounted into the sync job so it can reach the source.
#[derive(Debug, Clone)]
pub struct SshMaterial {
    pub key: String,
    pub public_key: Option<String>,
    pub config: Option<String>,
    pub known_hosts: Option<String>,
}

/// Gather the SSH prerequisites for a migration.
///
/// A missing agent socket or key is a precondition violation, reported
/// before anything mutates.
pub fn collect_ssh_material(
    auth_sock: Option<&str>,
    home: &Path,
    key_path: Option<&Path>,
) -> Result<SshMaterial, ReconcileError> {
    if auth_sock.is_none_or(str::is_empty) {
        return Err(ReconcileError::precondition(
            "SSH_AUTH_SOCK is not set; start an ssh agent with the migration key added and retry",
        ));
    }

    let ssh_dir = home.join(".ssh");
    let key_file: PathBuf = key_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ssh_dir.join("id_rsa"));
    let key = std::fs::read_to_string(&key_file).map_err(|err| {
        ReconcileError::precondition(format!(
            "cannot read SSH key {}: {err}",
            key_file.display()
        ))
    })?;

    let read_optional = |path: PathBuf| std::fs::read_to_string(path).ok();
    Ok(SshMaterial {
        key,
        public_key: read_optional(key_file.with_extension("pub")),
        config: read_optional(ssh_dir.join("config")),
        known_hosts: read_optional(ssh_dir.join("known_hosts")),
    })
}

pub struct MigrationPreparer<'a> {
    backend: &'a dyn Backend,
    namespace: &'a str,
}

impl<'a> MigrationPreparer<'a> {
    pub fn new(backend: &'a dyn Backend, namespace: &'a str) -> Self {
        Self { backend, namespace }
    }

    /// Upload the SSH material as a secret plus a config map.
    pub fn upload_ssh_material(&self, material: &SshMaterial) -> anyhow::Result<()> {
        let mut key_entries = vec![("key", material.key.as_str())];
        if let Some(public_key) = &material.public_key {
            key_entries.push(("key.pub", public_key));
        }
        let secret = resources::string_secret(self.namespace, SSH_KEY_SECRET, &key_entries);
        self.backend.apply(self.namespace, &secret)?;

        let mut config_entries = Vec::new();
        if let Some(config) = &material.config {
            config_entries.push(("config", config.as_str()));
        }
        if let Some(known_hosts) = &material.known_hosts {
            config_entries.push(("known_hosts", known_hosts.as_str()));
        }
        let map = resources::config_map(self.namespace, SSH_CONFIG_MAP, &config_entries);
        self.backend.apply(self.namespace, &map)?;
        Ok(())
    }

    /// Run the data-sync job and wait it out. The wait is unbounded since
    /// the duration scales with the amount of data on the source.
    pub fn sync_data(
        &self,
        migration: &MigrationConfig,
        image: &str,
        pull_policy: &str,
        pull_secret: Option<&str>,
        volumes: &[VolumeMount],
        waiter: &Waiter,
    ) -> Result<(), ReconcileError> {
        info!(
            source = %migration.source_fqdn,
            "Synchronizing data from the source server, duration depends on the data size…"
        );
        let job = sync_job(
            self.namespace,
            image,
            pull_policy,
            pull_secret,
            volumes,
            migration,
        );
        let name = self
            .backend
            .run_job(self.namespace, &job)
            .map_err(|err| ReconcileError::step("synchronize data from source", err))?;
        wait_for(
            self.backend,
            self.namespace,
            waiter,
            &WaitTarget::job(name, Timeout::Infinite),
        )
    }
}

fn sync_job(
    namespace: &str,
    image: &str,
    pull_policy: &str,
    pull_secret: Option<&str>,
    volumes: &[VolumeMount],
    migration: &MigrationConfig,
) -> resources::Resource {
    let targets: Vec<&str> = volumes.iter().map(|v| v.mount_path.as_str()).collect();
    let script = format!(
        "set -e\n/usr/lib/atrium/data-sync.sh --source {user}@{fqdn} {targets}\n",
        user = migration.user,
        fqdn = migration.source_fqdn,
        targets = targets.join(" "),
    );
    let mut job = resources::script_job(
        namespace,
        DATA_SYNC_JOB,
        image,
        pull_policy,
        volumes,
        pull_secret,
        &script,
    );

    // The key and SSH client config are mounted file by file; two mounts on
    // the same directory would shadow each other.
    let spec = &mut job.manifest["spec"]["template"]["spec"];
    if let Some(pod_volumes) = spec["volumes"].as_array_mut() {
        pod_volumes.push(json!({
            "name": "ssh-key",
            "secret": {"secretName": SSH_KEY_SECRET, "defaultMode": 0o600},
        }));
        pod_volumes.push(json!({
            "name": "ssh-conf",
            "configMap": {"name": SSH_CONFIG_MAP},
        }));
    }
    if let Some(mounts) = spec["containers"][0]["volumeMounts"].as_array_mut() {
        mounts.push(json!({"name": "ssh-key", "mountPath": "/root/.ssh/id_rsa", "subPath": "key"}));
        mounts.push(json!({"name": "ssh-conf", "mountPath": "/root/.ssh/config", "subPath": "config"}));
        mounts.push(json!({
            "name": "ssh-conf",
            "mountPath": "/root/.ssh/known_hosts",
            "subPath": "known_hosts",
        }));
    }
    job
}

/// Volumes the sync job fills: the database claim plus the server claims.
pub fn sync_volumes(server_volumes: &[(&str, &str)]) -> Vec<VolumeMount> {
    let mut mounts = vec![VolumeMount::new(DB_VOLUME_CLAIM, "/var/lib/db")];
    for (claim, _) in server_volumes {
        mounts.push(VolumeMount::new(claim, &format!("/srv/atrium/{claim}")));
    }
    mounts
}
