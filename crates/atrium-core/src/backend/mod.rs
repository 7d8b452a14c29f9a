//! Backend capability abstraction.
//!
//! Everything the engine does to a target environment goes through the
//! [`Backend`] trait: idempotent applies, job submission, status reads and
//! readiness polls. The probe, the executor and the coordinators receive a
//! backend by reference, so tests inject in-memory fakes and production
//! wires up the orchestration CLI (see [`kubectl`]).
//!
//! Read operations report absence as a value, never as an error: a missing
//! deployment is an expected state on a fresh install. Only
//! [`Backend::check_cluster`] is a hard reachability gate.

pub mod kubectl;

#[cfg(test)]
pub(crate) mod fake;

use crate::db::SchemaVersion;
use crate::resources::Resource;

/// How long a step waits for an asynchronous resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Fixed-cost operations; expiry is a reported failure.
    Bounded(u64),
    /// Data-proportional operations (schema upgrade, reindex, data sync);
    /// the underlying job terminating is the only exit.
    Infinite,
}

/// Kind of resource a wait polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Job,
    Pod,
    Deployment,
    Secret,
    Issuer,
}

/// A readiness gate: poll `kind`/`name` until ready, failed or timed out.
#[derive(Debug, Clone)]
pub struct WaitTarget {
    pub kind: WaitKind,
    pub name: String,
    pub timeout: Timeout,
}

impl WaitTarget {
    pub fn job(name: impl Into<String>, timeout: Timeout) -> Self {
        Self {
            kind: WaitKind::Job,
            name: name.into(),
            timeout,
        }
    }

    pub fn deployment(name: impl Into<String>) -> Self {
        Self {
            kind: WaitKind::Deployment,
            name: name.into(),
            timeout: Timeout::Bounded(120),
        }
    }

    pub fn secret(name: impl Into<String>) -> Self {
        Self {
            kind: WaitKind::Secret,
            name: name.into(),
            timeout: Timeout::Bounded(60),
        }
    }

    pub fn issuer(name: impl Into<String>) -> Self {
        Self {
            kind: WaitKind::Issuer,
            name: name.into(),
            timeout: Timeout::Bounded(60),
        }
    }
}

/// Outcome of a single readiness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Ready,
    /// The resource reached a terminal failure state. The reason is shown
    /// to the operator and should point at the resource's logs.
    Failed(String),
}

/// Ingress controller flavor detected on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressKind {
    Traefik,
    Nginx,
}

/// Facts extracted from the cluster itself.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub ingress: Option<IngressKind>,
}

/// Facts read by inspecting an image, optionally against the bound data
/// volumes of the target namespace.
#[derive(Debug, Clone, Default)]
pub struct ImageFacts {
    /// Product release shipped in the image.
    pub product_release: Option<String>,
    /// Database engine major shipped in the image.
    pub image_schema_version: Option<SchemaVersion>,
    /// Database engine major of the on-disk data, when a volume is bound.
    pub data_schema_version: Option<SchemaVersion>,
    /// Database name recorded in the data, if any.
    pub db_name: Option<String>,
    /// Database port recorded in the data, if any.
    pub db_port: Option<u16>,
    /// FQDN the existing data was set up for, if any.
    pub fqdn: Option<String>,
}

/// Capability object over the target environment.
pub trait Backend {
    /// Reachability gate and cluster facts. An error here means the
    /// environment is unreachable and nothing can be assumed.
    fn check_cluster(&self) -> anyhow::Result<ClusterInfo>;

    /// Idempotent create-or-update of a declarative resource description.
    fn apply(&self, namespace: &str, resource: &Resource) -> anyhow::Result<()>;

    /// Submit a job for asynchronous execution; returns the job name to
    /// poll on.
    fn run_job(&self, namespace: &str, job: &Resource) -> anyhow::Result<String>;

    fn has_namespace(&self, namespace: &str) -> bool;

    /// Whether a deployment matching the label selector exists.
    fn has_deployment(&self, namespace: &str, selector: &str) -> bool;

    /// Whether the named claim exists and is bound to a volume.
    fn has_volume(&self, namespace: &str, claim: &str) -> bool;

    fn has_secret(&self, namespace: &str, name: &str) -> bool;

    /// Read one key of a config map, `None` when absent.
    fn config_map_entry(&self, namespace: &str, name: &str, key: &str) -> Option<String>;

    /// Read one key of a secret, decoded, `None` when absent.
    fn secret_entry(&self, namespace: &str, name: &str, key: &str) -> Option<String>;

    /// Current replica count of a deployment, `None` when it does not exist.
    fn replicas(&self, namespace: &str, deployment: &str) -> Option<u32>;

    /// Image reference of the running pod matching the selector, if any.
    fn running_image(&self, namespace: &str, selector: &str) -> Option<String>;

    fn scale(&self, namespace: &str, deployment: &str, replicas: u32) -> anyhow::Result<()>;

    /// Inspect an image for version and database facts.
    fn inspect_image(
        &self,
        namespace: &str,
        image: &str,
        pull_policy: &str,
    ) -> anyhow::Result<ImageFacts>;

    /// One readiness poll of a wait target.
    fn poll(&self, namespace: &str, kind: WaitKind, name: &str) -> anyhow::Result<PollStatus>;
}
