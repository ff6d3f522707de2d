//! The reactive worker: one process, one queue message, at most one runner.
//!
//! The worker blocks for a single message, validates it, checks that the
//! job is still up for grabs, creates exactly one runner and settles the
//! delivery. SIGTERM is trapped: a termination request never interrupts an
//! in-flight creation, it only stops the worker at its checkpoints.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::config::Config;
use crate::github::{GithubError, JobRef};
use crate::reactive::queue::{self, Disposition, JobDetails, QueueClient, QueueError};
use crate::runner::{RunnerError, RunnerManager};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("configuration has no reactive section")]
    NotReactive,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Github(#[from] GithubError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("runner creation reported no runner")]
    NothingCreated,
}

/// How the worker's single pass ended. Exactly one of these per process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    CreatedRunner,
    AlreadyHandled,
    Requeued,
    Dropped,
    Terminated,
}

pub struct Worker {
    config: Config,
    shutdown: tokio::sync::watch::Receiver<bool>,
    create_lock: Arc<Mutex<()>>,
}

impl Worker {
    pub fn new(config: Config, shutdown: tokio::sync::watch::Receiver<bool>) -> Self {
        Self {
            config,
            shutdown,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    #[instrument(skip(self), fields(unit = %self.config.name))]
    pub async fn run(mut self) -> Result<WorkerOutcome, WorkerError> {
        let reactive = self
            .config
            .reactive
            .clone()
            .ok_or(WorkerError::NotReactive)?;

        let client = QueueClient::connect(
            &reactive.queue_uri,
            &reactive.queue_name,
            reactive
                .visibility_timeout_secs
                .map(std::time::Duration::from_secs),
        )
        .await?;
        let consumer_tag = format!("{}-worker-{}", self.config.name, std::process::id());

        let delivery = tokio::select! {
            delivery = client.consume_one(&consumer_tag) => delivery?,
            _ = self.shutdown.changed() => {
                tracing::info!("terminated while waiting for work");
                return Ok(WorkerOutcome::Terminated);
            }
        };

        let details: JobDetails = match serde_json::from_slice(&delivery.data) {
            Ok(details) => details,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed message");
                queue::nack(&delivery, false).await?;
                return Ok(WorkerOutcome::Dropped);
            }
        };

        let job = match queue::evaluate(&details, &reactive.supported_labels) {
            Disposition::Proceed(job) => job,
            Disposition::Requeue => {
                tracing::info!(labels = ?details.labels, "labels not ours, requeueing");
                queue::nack(&delivery, true).await?;
                return Ok(WorkerOutcome::Requeued);
            }
            Disposition::Malformed(reason) => {
                tracing::warn!(reason, "dropping malformed message");
                queue::nack(&delivery, false).await?;
                return Ok(WorkerOutcome::Dropped);
            }
        };

        let manager = RunnerManager::connect(&self.config).await?;

        match self.job_still_pending(&manager, &job).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(job_id = job.job_id, "job already handled elsewhere");
                queue::ack(&delivery).await?;
                return Ok(WorkerOutcome::AlreadyHandled);
            }
            Err(e) => {
                // Can't tell; give the message back and let the supervisor
                // respawn us.
                queue::nack(&delivery, true).await?;
                return Err(e.into());
            }
        }

        // Termination checkpoint: past this point a creation is in flight
        // and must complete before the process may exit.
        if *self.shutdown.borrow() {
            tracing::info!("terminated before creation started, requeueing");
            queue::nack(&delivery, true).await?;
            return Ok(WorkerOutcome::Terminated);
        }

        let guard = self.create_lock.lock().await;
        let created = manager.create_runners(1).await?;
        drop(guard);

        if created.is_empty() {
            queue::nack(&delivery, true).await?;
            return Err(WorkerError::NothingCreated);
        }

        queue::ack(&delivery).await?;
        tracing::info!(runner = %created[0], job_id = job.job_id, "runner created for queued job");
        Ok(WorkerOutcome::CreatedRunner)
    }

    /// Still worth a runner? Gone or already picked up both mean no.
    async fn job_still_pending(
        &self,
        manager: &RunnerManager,
        job: &JobRef,
    ) -> Result<bool, GithubError> {
        match manager
            .github_client()
            .job_info(&job.owner, &job.repo, job.job_id)
            .await
        {
            Ok(info) => Ok(!info.status.already_handled()),
            Err(GithubError::JobNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Wire SIGTERM into a shutdown flag for [`Worker`].
pub fn shutdown_signal() -> std::io::Result<tokio::sync::watch::Receiver<bool>> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        sigterm.recv().await;
        tracing::info!("received SIGTERM");
        let _ = tx.send(true);
        // Keep the sender alive so later borrows still see the flag.
        std::future::pending::<()>().await;
    });

    Ok(rx)
}
