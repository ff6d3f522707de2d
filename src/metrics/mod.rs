//! Runner metrics: the small files a VM writes about itself, their on-disk
//! store on the manager host, and the lifecycle event log derived from them.

pub mod events;
pub mod storage;

pub use events::{Event, EventLog, StopStatus};
pub use storage::{MetricsError, MetricsStorage};

use serde::{Deserialize, Serialize};

use crate::naming::InstanceName;

/// Written by the VM just before the agent starts a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreJobMetrics {
    pub timestamp: i64,
    pub workflow: String,
    #[serde(default)]
    pub workflow_run_id: String,
    pub repository: String,
    pub event: String,
}

/// Written by the VM after the job finished (or was aborted).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostJobMetrics {
    pub timestamp: i64,
    pub status: PostJobStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PostJobStatus {
    Normal,
    Abnormal,
    RepoPolicyCheckFailure,
}

/// Everything known about one runner's life, aggregated from the on-VM
/// files at deletion time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunnerMetrics {
    pub runner_name: String,
    pub install_started_at: Option<i64>,
    pub installed_at: Option<i64>,
    pub pre_job: Option<PreJobMetrics>,
    pub post_job: Option<PostJobMetrics>,
}

impl RunnerMetrics {
    pub fn named(name: &InstanceName) -> Self {
        Self {
            runner_name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn installation_duration(&self) -> Option<i64> {
        match (self.install_started_at, self.installed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }

    pub fn job_duration(&self) -> Option<i64> {
        match (&self.pre_job, &self.post_job) {
            (Some(pre), Some(post)) if post.timestamp >= pre.timestamp => {
                Some(post.timestamp - pre.timestamp)
            }
            _ => None,
        }
    }

    pub fn ran_a_job(&self) -> bool {
        self.pre_job.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_require_both_endpoints() {
        let mut metrics = RunnerMetrics::default();
        assert_eq!(metrics.installation_duration(), None);

        metrics.install_started_at = Some(100);
        assert_eq!(metrics.installation_duration(), None);

        metrics.installed_at = Some(160);
        assert_eq!(metrics.installation_duration(), Some(60));

        // Clock skew across files must not produce negative durations.
        metrics.installed_at = Some(40);
        assert_eq!(metrics.installation_duration(), None);
    }

    #[test]
    fn job_duration_from_pre_and_post() {
        let metrics = RunnerMetrics {
            pre_job: Some(PreJobMetrics {
                timestamp: 1_000,
                workflow: "build".into(),
                workflow_run_id: "7".into(),
                repository: "my-org/my-repo".into(),
                event: "push".into(),
            }),
            post_job: Some(PostJobMetrics {
                timestamp: 1_300,
                status: PostJobStatus::Normal,
            }),
            ..RunnerMetrics::default()
        };
        assert_eq!(metrics.job_duration(), Some(300));
        assert!(metrics.ran_a_job());
    }

    #[test]
    fn post_job_status_wire_format() {
        let parsed: PostJobStatus =
            serde_json::from_str("\"repo-policy-check-failure\"").unwrap();
        assert_eq!(parsed, PostJobStatus::RepoPolicyCheckFailure);
        assert_eq!(
            serde_json::to_string(&PostJobStatus::Normal).unwrap(),
            "\"normal\""
        );
    }
}
