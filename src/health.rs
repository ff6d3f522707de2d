//! Runner health classification.
//!
//! The decision logic is a pure function over one [`Observation`] so every
//! branch is testable without a cloud; the async wrapper only gathers the
//! observation over SSH. `Unknown` is a legitimate terminal answer — a VM
//! that is still installing must never be mistaken for a crashed one — and
//! callers must propagate it rather than collapse it into `Unhealthy`.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::openstack::{CloudInstance, CloudRunnerState, KeyStore};
use crate::ssh::{SshClient, SshError};

/// Below this age a not-yet-live runner may still be building its image.
pub fn build_mode_timeout() -> Duration {
    Duration::hours(2)
}

/// Brand-new instances get this long before SSH unreachability counts
/// against them.
pub fn ssh_grace_window() -> Duration {
    Duration::minutes(10)
}

const SSH_ATTEMPTS: u32 = 3;
const SSH_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

const LISTENER_PROCESS: &str = "Runner.Listener";
const WORKER_PROCESS: &str = "Runner.Worker";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudInitStatus {
    NotStarted,
    Running,
    Done,
    Error,
    Degraded,
    Disabled,
}

impl CloudInitStatus {
    /// Parse `cloud-init status` output, e.g. `status: done`.
    pub fn parse(output: &str) -> Option<Self> {
        let line = output
            .lines()
            .find_map(|l| l.trim().strip_prefix("status:"))?
            .trim();

        match line {
            s if s.starts_with("not started") || s.starts_with("not run") => {
                Some(Self::NotStarted)
            }
            s if s.starts_with("running") => Some(Self::Running),
            s if s.starts_with("done") => Some(Self::Done),
            s if s.starts_with("error") => Some(Self::Error),
            s if s.starts_with("degraded") => Some(Self::Degraded),
            s if s.starts_with("disabled") => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub listener_present: bool,
    pub worker_present: bool,
}

impl ProcessSnapshot {
    pub fn from_process_list(output: &str) -> Self {
        Self {
            listener_present: output.contains(LISTENER_PROCESS),
            worker_present: output.contains(WORKER_PROCESS),
        }
    }
}

/// Everything the classification needs, gathered once per check.
#[derive(Clone, Debug)]
pub struct Observation {
    pub cloud_state: CloudRunnerState,
    pub age: Option<Duration>,
    pub ssh_reachable: bool,
    pub cloud_init: Option<CloudInitStatus>,
    pub processes: Option<ProcessSnapshot>,
}

pub fn classify(observation: &Observation, accept_finished_job: bool) -> HealthState {
    match observation.cloud_state {
        CloudRunnerState::Error | CloudRunnerState::Stopped | CloudRunnerState::Deleted => {
            return HealthState::Unhealthy;
        }
        _ => {}
    }

    let young = |window: Duration| observation.age.is_some_and(|age| age <= window);

    if observation.cloud_state == CloudRunnerState::Created && young(build_mode_timeout()) {
        return HealthState::Unknown;
    }

    if !observation.ssh_reachable {
        return if young(ssh_grace_window()) {
            HealthState::Unknown
        } else {
            HealthState::Unhealthy
        };
    }

    match observation.cloud_init {
        Some(CloudInitStatus::Error) | Some(CloudInitStatus::Disabled) => {
            return HealthState::Unhealthy;
        }
        Some(CloudInitStatus::Running) | Some(CloudInitStatus::NotStarted) => {
            return if young(build_mode_timeout()) {
                HealthState::Unknown
            } else {
                HealthState::Unhealthy
            };
        }
        Some(CloudInitStatus::Done) | Some(CloudInitStatus::Degraded) => {}
        // Reachable but unreadable status: nothing conclusive either way.
        None => return HealthState::Unknown,
    }

    match observation.processes {
        Some(processes) => {
            if !processes.listener_present {
                if !processes.worker_present && accept_finished_job {
                    // The runner already took and finished its one job while
                    // we were still finalizing its construction.
                    return HealthState::Healthy;
                }
                return HealthState::Unhealthy;
            }
            HealthState::Healthy
        }
        None => HealthState::Unknown,
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    ssh: SshClient,
    keys: KeyStore,
}

impl HealthChecker {
    pub fn new(ssh: SshClient, keys: KeyStore) -> Self {
        Self { ssh, keys }
    }

    #[tracing::instrument(skip(self, instance), fields(name = %instance.name, state = ?instance.state))]
    pub async fn check(&self, instance: &CloudInstance, accept_finished_job: bool) -> HealthState {
        let observation = self.observe(instance).await;
        let health = classify(&observation, accept_finished_job);
        tracing::debug!(?health, ?observation, "classified runner");
        health
    }

    async fn observe(&self, instance: &CloudInstance) -> Observation {
        let age = instance.age(Utc::now());
        let mut observation = Observation {
            cloud_state: instance.state.clone(),
            age,
            ssh_reachable: false,
            cloud_init: None,
            processes: None,
        };

        // Anything terminal or still in the build window classifies without
        // touching the VM.
        if matches!(
            observation.cloud_state,
            CloudRunnerState::Error | CloudRunnerState::Stopped | CloudRunnerState::Deleted
        ) {
            return observation;
        }
        if observation.cloud_state == CloudRunnerState::Created
            && age.is_some_and(|a| a <= build_mode_timeout())
        {
            return observation;
        }

        let keyfile = self.keys.key_path(&instance.name);
        if !self.probe_with_retries(instance, &keyfile).await {
            return observation;
        }
        observation.ssh_reachable = true;

        match self
            .ssh
            .exec(
                instance.addresses.clone(),
                keyfile.clone(),
                "cloud-init status".to_string(),
            )
            .await
        {
            Ok(output) => observation.cloud_init = CloudInitStatus::parse(&output.stdout),
            Err(e) => {
                tracing::debug!(error = %e, "failed to read cloud-init status");
                return observation;
            }
        }

        match self
            .ssh
            .exec(
                instance.addresses.clone(),
                keyfile,
                "ps -eo args".to_string(),
            )
            .await
        {
            Ok(output) => {
                observation.processes = Some(ProcessSnapshot::from_process_list(&output.stdout));
            }
            Err(e) => tracing::debug!(error = %e, "failed to list runner processes"),
        }

        observation
    }

    async fn probe_with_retries(
        &self,
        instance: &CloudInstance,
        keyfile: &std::path::Path,
    ) -> bool {
        for attempt in 0..SSH_ATTEMPTS {
            match self
                .ssh
                .probe(instance.addresses.clone(), keyfile.to_path_buf())
                .await
            {
                Ok(()) => return true,
                Err(e @ SshError::Keyfile { .. }) => {
                    // Without a keyfile the VM can never be reached again.
                    tracing::warn!(error = %e, name = %instance.name, "keyfile lost");
                    return false;
                }
                Err(e) => {
                    tracing::debug!(error = %e, attempt, name = %instance.name, "ssh probe failed");
                    if attempt + 1 < SSH_ATTEMPTS {
                        tokio::time::sleep(SSH_RETRY_DELAY).await;
                    }
                }
            }
        }
        false
    }
}
