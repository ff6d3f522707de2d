//! Typed wrapper over the GitHub Actions runner-admin API.
//!
//! All calls fully materialize paginated lists before returning and map
//! failures into the fixed [`GithubError`] taxonomy so callers can decide
//! between halt, skip and retry without inspecting HTTP details.

use chrono::{DateTime, Utc};
use octocrab::models::actions::SelfHostedRunner;
use octocrab::models::RunnerId;
use octocrab::{Octocrab, Page};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

use crate::config::{Config, GithubPath};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum GithubError {
    /// The token was rejected outright. Fatal: reconciliation must halt.
    #[error("github token rejected (401)")]
    Token,

    /// The job is gone from the service. Non-fatal: treat as already handled.
    #[error("github job not found")]
    JobNotFound,

    /// Transient service or transport failure. Retryable by the caller.
    #[error("github api failure{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Api {
        status: Option<u16>,
        rate_limited: bool,
        message: String,
    },

    #[error("github client error: {0}")]
    Client(String),
}

impl GithubError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Api { .. })
    }
}

fn classify(err: octocrab::Error, job_lookup: bool) -> GithubError {
    match err {
        octocrab::Error::GitHub { source, .. } => {
            let status = source.status_code.as_u16();
            match status {
                401 => GithubError::Token,
                404 if job_lookup => GithubError::JobNotFound,
                429 => GithubError::Api {
                    status: Some(status),
                    rate_limited: true,
                    message: format!("rate limited: {}", source.message),
                },
                500..=599 => GithubError::Api {
                    status: Some(status),
                    rate_limited: false,
                    message: source.message,
                },
                _ => GithubError::Client(source.message),
            }
        }
        // Anything that never reached the service (DNS, TLS, resets) is
        // transport-level and worth a retry.
        other => GithubError::Api {
            status: None,
            rate_limited: false,
            message: other.to_string(),
        },
    }
}

/// A runner registration or removal token, valid for roughly an hour.
#[derive(Clone, Debug, Deserialize)]
pub struct RunnerAdminToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Waiting,
    Pending,
    Requested,
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// A job in one of these states has already been picked up; creating a
    /// runner for it would only produce an idle leftover.
    pub fn already_handled(&self) -> bool {
        matches!(self, Self::InProgress | Self::Completed)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    pub run_id: u64,
    pub status: JobStatus,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJobs {
    jobs: Vec<WorkflowJob>,
}

#[derive(Clone)]
pub struct GithubClient {
    octocrab: Octocrab,
    path: GithubPath,
    retry: RetryPolicy,
}

impl GithubClient {
    pub fn new(config: &Config) -> Result<Self, GithubError> {
        let octocrab = octocrab::OctocrabBuilder::default()
            .personal_token(config.github_token.clone())
            .build()
            .map_err(|e| classify(e, false))?;

        Ok(Self {
            octocrab,
            path: config.github_path.clone(),
            retry: RetryPolicy::default(),
        })
    }

    fn runners_base(&self) -> String {
        match &self.path {
            GithubPath::Repo { owner, repo } => {
                format!("/repos/{owner}/{repo}/actions/runners")
            }
            GithubPath::Org { org } => format!("/orgs/{org}/actions/runners"),
        }
    }

    /// List every self-hosted runner registered at the configured scope.
    /// Pagination is followed to the end; a partial view is never returned.
    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn list_runners(&self) -> Result<Vec<SelfHostedRunner>, GithubError> {
        self.retry
            .run(|| self.list_runners_once(), GithubError::retryable)
            .await
    }

    async fn list_runners_once(&self) -> Result<Vec<SelfHostedRunner>, GithubError> {
        let route = format!("{}?per_page=100", self.runners_base());
        let mut runners = vec![];

        let mut page: Page<SelfHostedRunner> = self
            .octocrab
            .get(&route, None::<&()>)
            .await
            .map_err(|e| classify(e, false))?;

        loop {
            runners.extend(page.items.clone());

            page = match self
                .octocrab
                .get_page(&page.next)
                .await
                .map_err(|e| classify(e, false))?
            {
                Some(next_page) => next_page,
                None => break,
            };
        }

        Ok(runners)
    }

    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn registration_token(&self) -> Result<RunnerAdminToken, GithubError> {
        let route = format!("{}/registration-token", self.runners_base());
        self.retry
            .run(
                || async {
                    self.octocrab
                        .post(&route, None::<&()>)
                        .await
                        .map_err(|e| classify(e, false))
                },
                GithubError::retryable,
            )
            .await
    }

    #[instrument(skip(self), fields(path = %self.path))]
    pub async fn removal_token(&self) -> Result<RunnerAdminToken, GithubError> {
        let route = format!("{}/remove-token", self.runners_base());
        self.retry
            .run(
                || async {
                    self.octocrab
                        .post(&route, None::<&()>)
                        .await
                        .map_err(|e| classify(e, false))
                },
                GithubError::retryable,
            )
            .await
    }

    #[instrument(skip(self), fields(path = %self.path, runner_id = %id))]
    pub async fn delete_runner(&self, id: RunnerId) -> Result<(), GithubError> {
        let result = match &self.path {
            GithubPath::Org { org } => self.octocrab.actions().delete_org_runner(org, id).await,
            GithubPath::Repo { owner, repo } => {
                self.octocrab
                    .actions()
                    .delete_repo_runner(owner, repo, id)
                    .await
            }
        };

        match result {
            Ok(()) => {
                tracing::info!("deleted github runner record");
                Ok(())
            }
            Err(e) => {
                let e = classify(e, false);
                tracing::error!(error = %e, "failed to delete github runner record");
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn job_info(
        &self,
        owner: &str,
        repo: &str,
        job_id: u64,
    ) -> Result<WorkflowJob, GithubError> {
        let route = format!("/repos/{owner}/{repo}/actions/jobs/{job_id}");
        self.octocrab
            .get(&route, None::<&()>)
            .await
            .map_err(|e| classify(e, true))
    }

    /// Find the job a runner is (or was) assigned to within one workflow run.
    #[instrument(skip(self))]
    pub async fn job_info_by_runner_name(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
        runner_name: &str,
    ) -> Result<Option<WorkflowJob>, GithubError> {
        let route = format!("/repos/{owner}/{repo}/actions/runs/{run_id}/jobs?per_page=100");
        let listing: WorkflowJobs = self
            .octocrab
            .get(&route, None::<&()>)
            .await
            .map_err(|e| classify(e, true))?;

        Ok(listing
            .jobs
            .into_iter()
            .find(|job| job.runner_name.as_deref() == Some(runner_name)))
    }
}

/// Reference to one job, parsed out of the URL carried by a queue message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRef {
    pub owner: String,
    pub repo: String,
    pub job_id: u64,
}

impl JobRef {
    /// Accepts both API job URLs
    /// (`https://api.github.com/repos/{owner}/{repo}/actions/jobs/{id}`) and
    /// web job URLs
    /// (`https://github.com/{owner}/{repo}/actions/runs/{run}/job/{id}`).
    pub fn parse(url: &str) -> Option<Self> {
        let path = url.split_once("://").map(|(_, rest)| rest)?;
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let _host = segments.next()?;
        let segments: Vec<&str> = segments.collect();

        match segments.as_slice() {
            ["repos", owner, repo, "actions", "jobs", id] => Some(Self {
                owner: (*owner).to_string(),
                repo: (*repo).to_string(),
                job_id: id.parse().ok()?,
            }),
            [owner, repo, "actions", "runs", _run, "job", id] => Some(Self {
                owner: (*owner).to_string(),
                repo: (*repo).to_string(),
                job_id: id.parse().ok()?,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ref_parses_api_urls() {
        let job = JobRef::parse("https://api.github.com/repos/my-org/my-repo/actions/jobs/42")
            .unwrap();
        assert_eq!(
            job,
            JobRef {
                owner: "my-org".into(),
                repo: "my-repo".into(),
                job_id: 42
            }
        );
    }

    #[test]
    fn job_ref_parses_web_urls() {
        let job =
            JobRef::parse("https://github.com/my-org/my-repo/actions/runs/7/job/99").unwrap();
        assert_eq!(job.job_id, 99);
        assert_eq!(job.owner, "my-org");
    }

    #[test]
    fn job_ref_rejects_malformed_urls() {
        assert_eq!(JobRef::parse(""), None);
        assert_eq!(JobRef::parse("https://api.github.com"), None);
        assert_eq!(JobRef::parse("https://api.github.com/"), None);
        assert_eq!(
            JobRef::parse("https://api.github.com/repos/my-org/my-repo/actions/jobs/not-a-number"),
            None
        );
        assert_eq!(JobRef::parse("no scheme at all"), None);
    }

    #[test]
    fn job_status_handled_states() {
        assert!(JobStatus::Completed.already_handled());
        assert!(JobStatus::InProgress.already_handled());
        assert!(!JobStatus::Queued.already_handled());
        assert!(!JobStatus::Waiting.already_handled());
    }

    #[test]
    fn job_status_tolerates_future_values() {
        let status: JobStatus = serde_json::from_str("\"some_new_state\"").unwrap();
        assert_eq!(status, JobStatus::Unknown);
        assert!(!status.already_handled());
    }
}
