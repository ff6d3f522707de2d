//! OpenStack compute plumbing: the typed client, the keyfile store and the
//! cloud-side view of a runner.

pub mod client;
pub mod keys;

pub use client::{CloudError, OpenStackClient};
pub use keys::KeyStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::naming::InstanceName;

/// Lifecycle state of a server as the cloud reports it. The mapping from raw
/// Nova status strings is total; anything unrecognized lands in
/// `Unexpected` rather than being dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudRunnerState {
    Created,
    Active,
    Stopped,
    Deleted,
    Error,
    Unknown,
    Unexpected(String),
}

impl CloudRunnerState {
    pub fn from_status(status: Option<&str>) -> Self {
        match status {
            Some("BUILD") | Some("BUILDING") | Some("REBUILD") => Self::Created,
            Some("ACTIVE") => Self::Active,
            Some("SHUTOFF") | Some("STOPPED") | Some("PAUSED") | Some("SUSPENDED") => {
                Self::Stopped
            }
            Some("DELETED") | Some("SOFT_DELETED") => Self::Deleted,
            Some("ERROR") => Self::Error,
            None => Self::Unknown,
            Some(other) => Self::Unexpected(other.to_string()),
        }
    }

    /// States that count toward the live fleet when computing deltas.
    pub fn is_provisioning_or_live(&self) -> bool {
        matches!(self, Self::Created | Self::Active)
    }
}

/// One server owned by this manager, as last observed on the cloud.
#[derive(Clone, Debug)]
pub struct CloudInstance {
    pub name: InstanceName,
    pub server_id: String,
    pub addresses: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub state: CloudRunnerState,
}

impl CloudInstance {
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.created_at.map(|created| now - created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_total() {
        assert_eq!(
            CloudRunnerState::from_status(Some("BUILD")),
            CloudRunnerState::Created
        );
        assert_eq!(
            CloudRunnerState::from_status(Some("ACTIVE")),
            CloudRunnerState::Active
        );
        assert_eq!(
            CloudRunnerState::from_status(Some("SHUTOFF")),
            CloudRunnerState::Stopped
        );
        assert_eq!(
            CloudRunnerState::from_status(Some("SOFT_DELETED")),
            CloudRunnerState::Deleted
        );
        assert_eq!(
            CloudRunnerState::from_status(Some("ERROR")),
            CloudRunnerState::Error
        );
        assert_eq!(CloudRunnerState::from_status(None), CloudRunnerState::Unknown);
        assert_eq!(
            CloudRunnerState::from_status(Some("MIGRATING")),
            CloudRunnerState::Unexpected("MIGRATING".into())
        );
    }

    #[test]
    fn live_states() {
        assert!(CloudRunnerState::Created.is_provisioning_or_live());
        assert!(CloudRunnerState::Active.is_provisioning_or_live());
        assert!(!CloudRunnerState::Error.is_provisioning_or_live());
        assert!(!CloudRunnerState::Stopped.is_provisioning_or_live());
    }

    #[test]
    fn instance_age() {
        let now = Utc::now();
        let instance = CloudInstance {
            name: InstanceName::generate("mgr-a"),
            server_id: "id".into(),
            addresses: vec![],
            created_at: Some(now - chrono::Duration::minutes(90)),
            state: CloudRunnerState::Active,
        };
        assert_eq!(instance.age(now), Some(chrono::Duration::minutes(90)));

        let unknown_age = CloudInstance {
            created_at: None,
            ..instance
        };
        assert_eq!(unknown_age.age(now), None);
    }
}
