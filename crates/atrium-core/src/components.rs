//! Optional product components and replica inheritance.

use serde::{Deserialize, Serialize};

/// Optional components scaled independently of the main service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    /// Confidential-computing attestation service.
    Attestation,
    /// Hub XML-RPC bridge.
    HubApi,
    /// Event stream processor.
    EventProcessor,
}

impl Component {
    pub const ALL: [Component; 3] = [
        Component::Attestation,
        Component::HubApi,
        Component::EventProcessor,
    ];

    pub fn deploy_name(self) -> &'static str {
        match self {
            Component::Attestation => "atrium-attestation",
            Component::HubApi => "atrium-hub-api",
            Component::EventProcessor => "atrium-events",
        }
    }

    /// Image name within the registry, composed like the server image.
    pub fn image_name(self) -> &'static str {
        match self {
            Component::Attestation => "server-attestation",
            Component::HubApi => "server-hub-api",
            Component::EventProcessor => "server-events",
        }
    }

    /// Whether the component holds connections to the database and must be
    /// quiesced before the database goes down for a schema change.
    pub fn depends_on_database(self) -> bool {
        match self {
            Component::Attestation | Component::EventProcessor => true,
            Component::HubApi => false,
        }
    }
}

/// Resolve the replica count for a component.
///
/// The override is a tri-state: `None` means the caller did not set the
/// flag and the count probed from a previous deployment is preserved;
/// `Some(n)` is an explicit request that always wins, including
/// `Some(0)` to turn a component off.
pub fn effective_replicas(overridden: Option<u32>, probed: Option<u32>) -> u32 {
    overridden.or(probed).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_override_wins_over_probed_count() {
        assert_eq!(effective_replicas(Some(3), Some(1)), 3);
    }

    #[test]
    fn test_explicit_zero_is_not_treated_as_unset() {
        assert_eq!(effective_replicas(Some(0), Some(2)), 0);
    }

    #[test]
    fn test_unset_inherits_probed_count() {
        assert_eq!(effective_replicas(None, Some(2)), 2);
    }

    #[test]
    fn test_unset_with_no_previous_deployment_is_off() {
        assert_eq!(effective_replicas(None, None), 0);
    }
}
