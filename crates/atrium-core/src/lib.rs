//! Atrium Core Library
//!
//! Deployment reconciliation engine for the Atrium server: probes the
//! target environment, classifies the run (fresh install / upgrade /
//! migration finalize) and drives the ordered, idempotent, wait-gated
//! plan that converges the environment on the desired configuration.
//!
//! No state is persisted between invocations; everything is re-derived
//! from the environment, which is what makes re-running after a failure
//! the recovery path.

pub mod backend;
pub mod components;
pub mod config;
pub mod db;
pub mod error;
pub mod migrate;
pub mod plan;
pub mod probe;
pub mod reconcile;
pub mod resources;
pub mod ssl;

/// Re-exports of commonly used types
pub mod prelude {
    pub use crate::backend::kubectl::KubectlBackend;
    pub use crate::backend::{
        Backend, ClusterInfo, ImageFacts, IngressKind, PollStatus, Timeout, WaitKind, WaitTarget,
    };
    pub use crate::components::Component;
    pub use crate::config::{Credentials, MigrationConfig, ServerConfig};
    pub use crate::db::{SchemaUpgradeCoordinator, SchemaVersion};
    pub use crate::error::ReconcileError;
    pub use crate::migrate::collect_ssh_material;
    pub use crate::plan::{ReconciliationPlan, Step, TaskExecutor, Waiter};
    pub use crate::probe::{Classification, DeploymentState, EnvironmentProbe};
    pub use crate::reconcile::ReconciliationPlanner;
    pub use crate::ssl::{CertificateProvisioner, SslConfig};
}
