//! CI-side view of the fleet: the runner records GitHub keeps for our
//! prefix, independent of whether a server still backs them.

use octocrab::models::actions::SelfHostedRunner;
use octocrab::models::RunnerId;
use serde::Serialize;
use tracing::instrument;

use crate::github::{GithubClient, GithubError};
use crate::naming::InstanceName;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GithubRunnerState {
    Busy,
    Idle,
    Offline,
}

impl GithubRunnerState {
    pub fn of(runner: &SelfHostedRunner) -> Self {
        if runner.busy {
            Self::Busy
        } else if runner.status.as_str() == "online" {
            Self::Idle
        } else {
            Self::Offline
        }
    }
}

/// One CI-side record that parsed into our namespace.
#[derive(Clone, Debug)]
pub struct GithubRunner {
    pub name: InstanceName,
    pub id: RunnerId,
    pub state: GithubRunnerState,
}

#[derive(Clone)]
pub struct GithubRunnerManager {
    client: GithubClient,
    prefix: String,
}

impl GithubRunnerManager {
    pub fn new(client: GithubClient, prefix: String) -> Self {
        Self { client, prefix }
    }

    pub fn client(&self) -> &GithubClient {
        &self.client
    }

    /// All CI-side runners carrying our prefix; anything else is invisible.
    #[instrument(skip(self), fields(prefix = %self.prefix))]
    pub async fn list_runners(&self) -> Result<Vec<GithubRunner>, GithubError> {
        let runners = self.client.list_runners().await?;

        Ok(runners
            .iter()
            .filter_map(|runner| {
                let name = InstanceName::parse(&self.prefix, &runner.name)?;
                Some(GithubRunner {
                    name,
                    id: runner.id,
                    state: GithubRunnerState::of(runner),
                })
            })
            .collect())
    }

    /// Delete CI-side records in any of the given states. Used with
    /// `[Offline]` to clear phantoms left by servers that vanished without
    /// a graceful unregister.
    #[instrument(skip(self), fields(prefix = %self.prefix, states = ?states))]
    pub async fn delete_runners_in_states(
        &self,
        states: &[GithubRunnerState],
    ) -> Result<Vec<InstanceName>, GithubError> {
        let mut deleted = vec![];

        for runner in self.list_runners().await? {
            if !states.contains(&runner.state) {
                continue;
            }

            match self.client.delete_runner(runner.id).await {
                Ok(()) => deleted.push(runner.name),
                Err(e) => {
                    tracing::warn!(error = %e, name = %runner.name, "failed to delete runner record")
                }
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(name: &str, status: &str, busy: bool) -> SelfHostedRunner {
        serde_json::from_value(serde_json::json!({
            "id": 7,
            "name": name,
            "os": "linux",
            "status": status,
            "busy": busy,
            "labels": [],
        }))
        .unwrap()
    }

    #[test]
    fn state_derivation() {
        assert_eq!(
            GithubRunnerState::of(&runner("mgr-a-x", "online", true)),
            GithubRunnerState::Busy
        );
        assert_eq!(
            GithubRunnerState::of(&runner("mgr-a-x", "online", false)),
            GithubRunnerState::Idle
        );
        assert_eq!(
            GithubRunnerState::of(&runner("mgr-a-x", "offline", false)),
            GithubRunnerState::Offline
        );
        // A busy flag wins over a stale offline status.
        assert_eq!(
            GithubRunnerState::of(&runner("mgr-a-x", "offline", true)),
            GithubRunnerState::Busy
        );
    }
}
