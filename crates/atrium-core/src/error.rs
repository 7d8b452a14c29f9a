//! Error taxonomy for reconciliation runs.
//!
//! Every failure class the engine can abort with is a variant here so the
//! CLI can surface the operator-facing message verbatim. Glue code inside
//! the components uses `anyhow` and gets wrapped into `StepFailed` with the
//! step name attached.

use thiserror::Error;

/// Errors that abort a reconciliation run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The backend could not be contacted at all. No partial state assumed.
    #[error("environment unreachable: {0}")]
    Unreachable(#[source] anyhow::Error),

    /// A condition that must hold before any mutating step runs.
    #[error("{0}")]
    Precondition(String),

    /// The backend rejected a step's operation.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    /// An awaited job, pod or deployment reported a failure status.
    ///
    /// The reason points the operator at the resource's logs instead of
    /// summarizing them.
    #[error("{resource} reported failure: {reason}")]
    WaitFailed { resource: String, reason: String },

    /// A bounded wait expired before the resource became ready.
    #[error("{resource} did not become ready within {seconds} seconds")]
    WaitTimeout { resource: String, seconds: u64 },
}

impl ReconcileError {
    /// Shorthand for a precondition violation.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Wrap a component error with the name of the failing step.
    pub fn step(step: impl Into<String>, source: anyhow::Error) -> Self {
        Self::StepFailed {
            step: step.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_failed_names_the_step() {
        let err = ReconcileError::step("create namespace", anyhow::anyhow!("denied"));
        assert!(err.to_string().contains("create namespace"));
    }

    #[test]
    fn test_wait_timeout_names_resource_and_limit() {
        let err = ReconcileError::WaitTimeout {
            resource: "atrium-ca-issuer".into(),
            seconds: 60,
        };
        let message = err.to_string();
        assert!(message.contains("atrium-ca-issuer"));
        assert!(message.contains("60"));
    }
}
