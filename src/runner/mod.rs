//! The joined view of the fleet and the operations the scaler drives.
//!
//! A runner only exists here if the cloud backs it; a CI record without a
//! server is a phantom and is handled by the cleanup path, never surfaced
//! through [`RunnerManager::get_runners`].

pub mod cloud;
pub mod github_side;

pub use cloud::CloudRunnerManager;
pub use github_side::{GithubRunner, GithubRunnerManager, GithubRunnerState};

use chrono::Utc;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use thiserror::Error;
use tracing::instrument;

use crate::github::GithubError;
use crate::metrics::events::EventLogError;
use crate::metrics::{Event, EventLog, MetricsError, MetricsStorage, PostJobStatus, RunnerMetrics, StopStatus};
use crate::naming::InstanceName;
use crate::openstack::{CloudError, CloudInstance, CloudRunnerState};
use crate::ssh::SshError;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Github(#[from] GithubError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("failed to persist keyfile")]
    Keyfile(#[source] std::io::Error),

    #[error("failed to render userdata")]
    Userdata(#[source] serde_yaml::Error),

    #[error("failed to append lifecycle event")]
    Events(#[from] EventLogError),
}

impl RunnerError {
    /// Authentication failures poison every further call this cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Github(GithubError::Token))
    }
}

/// One runner as seen from both sides at enumeration time. Transient;
/// rebuilt on every cycle.
#[derive(Clone, Debug)]
pub struct RunnerInstance {
    pub cloud: CloudInstance,
    pub github: Option<GithubRunner>,
}

impl RunnerInstance {
    pub fn name(&self) -> &InstanceName {
        &self.cloud.name
    }

    pub fn github_state(&self) -> Option<GithubRunnerState> {
        self.github.as_ref().map(|g| g.state)
    }

    pub fn is_busy(&self) -> bool {
        self.github_state() == Some(GithubRunnerState::Busy)
    }

    pub fn is_idle(&self) -> bool {
        self.github_state() == Some(GithubRunnerState::Idle)
    }
}

/// Match cloud instances to CI records by full name. CI records without a
/// backing instance are dropped here (phantoms).
pub fn join_runners(
    cloud: Vec<CloudInstance>,
    github: Vec<GithubRunner>,
) -> Vec<RunnerInstance> {
    let mut by_name: HashMap<InstanceName, GithubRunner> = github
        .into_iter()
        .map(|runner| (runner.name.clone(), runner))
        .collect();

    cloud
        .into_iter()
        .map(|instance| {
            let github = by_name.remove(&instance.name);
            RunnerInstance {
                cloud: instance,
                github,
            }
        })
        .collect()
}

pub fn filter_runners<'a>(
    runners: &'a [RunnerInstance],
    github_states: Option<&[GithubRunnerState]>,
    cloud_states: Option<&[CloudRunnerState]>,
) -> Vec<&'a RunnerInstance> {
    runners
        .iter()
        .filter(|runner| {
            github_states.is_none_or(|states| {
                runner
                    .github_state()
                    .is_some_and(|state| states.contains(&state))
            })
        })
        .filter(|runner| {
            cloud_states.is_none_or(|states| states.contains(&runner.cloud.state))
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushMode {
    /// Delete idle runners only.
    FlushIdle,
    /// Delete idle and busy runners.
    FlushBusy,
}

/// Pick up to `limit` runners for deletion, oldest first. Busy runners are
/// untouchable unless `include_busy`; runners without a CI record are left
/// alone here — they are either still registering (health cleanup's call)
/// or phantoms-in-reverse.
pub fn select_deletable(
    runners: &[RunnerInstance],
    limit: usize,
    include_busy: bool,
) -> Vec<RunnerInstance> {
    let mut candidates: Vec<&RunnerInstance> = runners
        .iter()
        .filter(|runner| runner.is_idle() || (include_busy && runner.is_busy()))
        .collect();

    candidates.sort_by_key(|runner| runner.cloud.created_at.unwrap_or(chrono::DateTime::<Utc>::MAX_UTC));

    candidates
        .into_iter()
        .take(limit)
        .cloned()
        .collect()
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupStats {
    pub crashed: usize,
    pub phantoms: usize,
}

#[derive(Clone)]
pub struct RunnerManager {
    cloud: CloudRunnerManager,
    github: GithubRunnerManager,
    storage: MetricsStorage,
    events: EventLog,
    flavor: String,
}

impl RunnerManager {
    /// Wire the full stack from configuration: CI client, cloud session,
    /// key store, metrics storage, health checker and event log.
    pub async fn connect(config: &crate::config::Config) -> Result<Self, RunnerError> {
        let github_client = crate::github::GithubClient::new(config)?;
        let openstack =
            crate::openstack::OpenStackClient::connect(&config.openstack, config.prefix.clone())
                .await?;
        let keys = crate::openstack::KeyStore::new(config.keys_dir());
        let storage = MetricsStorage::new(config.metrics_dir(), config.quarantine_dir());
        let ssh = crate::ssh::SshClient::default();
        let health = crate::health::HealthChecker::new(ssh.clone(), keys.clone());
        let events = EventLog::new(config.events_log_path());

        let cloud = CloudRunnerManager::new(
            config.clone(),
            openstack,
            keys,
            storage.clone(),
            health,
            ssh,
        );
        let github = GithubRunnerManager::new(github_client, config.prefix.clone());

        Ok(Self::new(
            cloud,
            github,
            storage,
            events,
            config.name.clone(),
        ))
    }

    pub fn new(
        cloud: CloudRunnerManager,
        github: GithubRunnerManager,
        storage: MetricsStorage,
        events: EventLog,
        flavor: String,
    ) -> Self {
        Self {
            cloud,
            github,
            storage,
            events,
            flavor,
        }
    }

    pub fn github_client(&self) -> &crate::github::GithubClient {
        self.github.client()
    }

    /// Enumerate both sides in parallel and join by name.
    #[instrument(skip(self))]
    pub async fn get_runners(&self) -> Result<Vec<RunnerInstance>, RunnerError> {
        let (cloud, github) =
            tokio::join!(self.cloud.list_instances(), self.github.list_runners());
        Ok(join_runners(cloud?, github?))
    }

    /// Create up to `count` runners under one registration token. Partial
    /// success is fine: the shortfall is retried by the next cycle.
    #[instrument(skip(self))]
    pub async fn create_runners(&self, count: usize) -> Result<Vec<InstanceName>, RunnerError> {
        if count == 0 {
            return Ok(vec![]);
        }

        let token = self.github.client().registration_token().await?;

        let results: Vec<Result<(InstanceName, i64), RunnerError>> =
            stream::iter((0..count).map(|_| {
                let manager = self.cloud.clone();
                let token = token.token.clone();
                async move {
                    let started = Utc::now();
                    let name = manager.create_runner(&token).await?;
                    Ok((name, (Utc::now() - started).num_seconds()))
                }
            }))
            .buffer_unordered(count)
            .collect()
            .await;

        let mut created = vec![];
        for result in results {
            match result {
                Ok((name, duration)) => {
                    self.events.append(&Event::RunnerInstalled {
                        timestamp: Utc::now().timestamp(),
                        flavor: self.flavor.clone(),
                        runner_name: name.to_string(),
                        duration: Some(duration),
                    })?;
                    created.push(name);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::error!(error = %e, "failed to create runner"),
            }
        }

        tracing::info!(
            requested = count,
            successful = created.len(),
            failed = count - created.len(),
            "completed runner creation"
        );
        Ok(created)
    }

    /// Delete up to `count` idle runners, oldest first. Busy runners are
    /// never selected.
    #[instrument(skip(self))]
    pub async fn delete_runners(&self, count: usize) -> Result<usize, RunnerError> {
        if count == 0 {
            return Ok(0);
        }

        let runners = self.get_runners().await?;
        let selected = select_deletable(&runners, count, false);
        self.delete_selected(selected).await
    }

    /// Bulk deletion: idle only, or idle and busy.
    #[instrument(skip(self))]
    pub async fn flush_runners(&self, mode: FlushMode) -> Result<usize, RunnerError> {
        let runners = self.get_runners().await?;
        let selected = select_deletable(&runners, usize::MAX, mode == FlushMode::FlushBusy);
        self.delete_selected(selected).await
    }

    async fn delete_selected(&self, selected: Vec<RunnerInstance>) -> Result<usize, RunnerError> {
        if selected.is_empty() {
            return Ok(0);
        }

        let token = self.github.client().removal_token().await?;
        let concurrency = selected.len();

        let results: Vec<(InstanceName, Result<Option<RunnerMetrics>, RunnerError>)> =
            stream::iter(selected.into_iter().map(|runner| {
                let manager = self.cloud.clone();
                let token = token.token.clone();
                async move {
                    let result = manager.delete_runner(&runner.cloud, &token).await;
                    (runner.cloud.name, result)
                }
            }))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut deleted = 0;
        for (name, result) in results {
            match result {
                Ok(metrics) => {
                    deleted += 1;
                    self.emit_stop(&name, metrics.as_ref(), StopStatus::Normal)?;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::error!(error = %e, name = %name, "failed to delete runner"),
            }
        }

        Ok(deleted)
    }

    /// Reclaim crashed instances, stale key material, offline phantoms and
    /// orphaned metric directories.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<CleanupStats, RunnerError> {
        let token = self.github.client().removal_token().await?;
        let mut stats = CleanupStats::default();

        for (name, metrics) in self.cloud.cleanup(&token.token).await? {
            stats.crashed += 1;
            self.emit_stop(&name, metrics.as_ref(), StopStatus::Crashed)?;
        }

        for name in self
            .github
            .delete_runners_in_states(&[GithubRunnerState::Offline])
            .await?
        {
            stats.phantoms += 1;
            // The server is long gone; whatever the metrics directory still
            // holds is the only trace of this runner's life.
            let metrics = self.storage.load_or_quarantine(&name);
            if let Err(e) = self.storage.delete_dir(&name) {
                tracing::warn!(error = %e, name = %name, "failed to remove phantom metrics directory");
            }
            self.emit_stop(&name, metrics.as_ref(), StopStatus::Crashed)?;
        }

        Ok(stats)
    }

    fn emit_stop(
        &self,
        name: &InstanceName,
        metrics: Option<&RunnerMetrics>,
        fallback: StopStatus,
    ) -> Result<(), RunnerError> {
        // A runner that picked up a job also gets its start recorded, with
        // how long it sat idle between install and job.
        if let Some(m) = metrics {
            if let (Some(pre), Some(installed)) = (&m.pre_job, m.installed_at) {
                self.events.append(&Event::RunnerStart {
                    timestamp: Utc::now().timestamp(),
                    flavor: self.flavor.clone(),
                    runner_name: name.to_string(),
                    idle: (pre.timestamp - installed).max(0),
                })?;
            }
        }

        let status = match metrics.and_then(|m| m.post_job.as_ref()) {
            Some(post) => match post.status {
                PostJobStatus::Normal => StopStatus::Normal,
                PostJobStatus::Abnormal | PostJobStatus::RepoPolicyCheckFailure => {
                    StopStatus::Abnormal
                }
            },
            None => fallback,
        };

        self.events.append(&Event::RunnerStop {
            timestamp: Utc::now().timestamp(),
            flavor: self.flavor.clone(),
            runner_name: name.to_string(),
            status,
            workflow: metrics
                .and_then(|m| m.pre_job.as_ref())
                .map(|pre| pre.workflow.clone()),
            repository: metrics
                .and_then(|m| m.pre_job.as_ref())
                .map(|pre| pre.repository.clone()),
            job_duration: metrics.and_then(|m| m.job_duration()),
        })?;

        Ok(())
    }
}
