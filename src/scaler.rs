//! The top-level control loop.
//!
//! One reconciliation is one pass of enumerate, classify, act, report. The
//! scaler owns every client by composition; a cycle is never re-entered —
//! an overlapping call observes the previous delta and walks away.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::config::Config;
use crate::metrics::events::EventLogError;
use crate::metrics::{Event, EventLog};
use crate::reactive::supervisor::SupervisorError;
use crate::reactive::{QueueClient, QueueError, ReactiveSupervisor};
use crate::runner::{FlushMode, RunnerError, RunnerInstance, RunnerManager};

#[derive(Debug, Error)]
pub enum ScalerError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Events(#[from] EventLogError),
}

/// Proactive arithmetic: converge the live count onto the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScalingPlan {
    pub create: usize,
    pub delete: usize,
}

pub fn plan_proactive(current: usize, quantity: u32) -> ScalingPlan {
    let quantity = quantity as usize;
    ScalingPlan {
        create: quantity.saturating_sub(current),
        delete: current.saturating_sub(quantity),
    }
}

/// Reactive arithmetic: workers absorb the demand the current fleet cannot,
/// and an over-target fleet sheds idle runners, not just workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReactivePlan {
    pub worker_target: usize,
    pub delete_runners: usize,
}

pub fn plan_reactive(current_runners: usize, quantity: u32) -> ReactivePlan {
    let quantity = quantity as usize;
    ReactivePlan {
        worker_target: quantity.saturating_sub(current_runners),
        delete_runners: current_runners.saturating_sub(quantity),
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct FleetCounts {
    active: usize,
    idle: usize,
    busy: usize,
}

fn count_fleet(runners: &[RunnerInstance]) -> FleetCounts {
    FleetCounts {
        active: runners
            .iter()
            .filter(|r| r.cloud.state.is_provisioning_or_live())
            .count(),
        idle: runners.iter().filter(|r| r.is_idle()).count(),
        busy: runners.iter().filter(|r| r.is_busy()).count(),
    }
}

pub struct Scaler {
    config: Config,
    runners: RunnerManager,
    supervisor: Option<ReactiveSupervisor>,
    queue: Option<QueueClient>,
    events: EventLog,
    cycle: Mutex<()>,
    last_delta: AtomicI64,
    reconcile_error: StdMutex<Option<String>>,
}

impl Scaler {
    /// Build the whole aggregate from configuration. `config_path` is what
    /// spawned workers are pointed at.
    pub async fn connect(config: Config, config_path: PathBuf) -> Result<Self, ScalerError> {
        let runners = RunnerManager::connect(&config).await?;

        let (supervisor, queue) = match &config.reactive {
            Some(reactive) => {
                let queue = QueueClient::connect(
                    &reactive.queue_uri,
                    &reactive.queue_name,
                    reactive
                        .visibility_timeout_secs
                        .map(std::time::Duration::from_secs),
                )
                .await?;
                (Some(ReactiveSupervisor::new(config_path)), Some(queue))
            }
            None => (None, None),
        };

        let events = EventLog::new(config.events_log_path());

        Ok(Self {
            config,
            runners,
            supervisor,
            queue,
            events,
            cycle: Mutex::new(()),
            last_delta: AtomicI64::new(0),
            reconcile_error: StdMutex::new(None),
        })
    }

    /// Whether the previous cycle failed at the scaler's own boundary, and
    /// why. Cleared by the next successful cycle.
    pub fn reconcile_error(&self) -> Option<String> {
        self.reconcile_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Run one reconciliation toward `quantity`. Overlapping calls do not
    /// queue: they return the last cycle's delta untouched.
    #[instrument(skip(self), fields(unit = %self.config.name))]
    pub async fn reconcile(&self, quantity: u32) -> Result<i64, ScalerError> {
        let Ok(_guard) = self.cycle.try_lock() else {
            tracing::debug!("reconciliation already in flight");
            return Ok(self.last_delta.load(Ordering::SeqCst));
        };

        let started = std::time::Instant::now();
        let result = if self.supervisor.is_some() {
            self.reconcile_reactive(quantity).await
        } else {
            self.reconcile_proactive(quantity).await
        };

        let mut error_slot = self
            .reconcile_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &result {
            Ok(delta) => {
                *error_slot = None;
                self.last_delta.store(*delta, Ordering::SeqCst);
                tracing::info!(
                    delta,
                    duration_secs = started.elapsed().as_secs_f64(),
                    "completed reconciliation"
                );
            }
            Err(e) => {
                *error_slot = Some(e.to_string());
                tracing::error!(error = %e, "reconciliation failed");
            }
        }

        result
    }

    async fn reconcile_proactive(&self, quantity: u32) -> Result<i64, ScalerError> {
        let started = std::time::Instant::now();
        let cleanup = self.runners.cleanup().await?;

        let runners = self.runners.get_runners().await?;
        let current = count_fleet(&runners).active;
        let plan = plan_proactive(current, quantity);

        let created = self.runners.create_runners(plan.create).await?.len();
        let deleted = self.runners.delete_runners(plan.delete).await?;

        let counts = count_fleet(&self.runners.get_runners().await?);
        self.events.append(&Event::Reconciliation {
            timestamp: Utc::now().timestamp(),
            flavor: self.config.name.clone(),
            crashed: cleanup.crashed,
            idle: counts.idle,
            busy: counts.busy,
            active: counts.active,
            expected: Some(quantity),
            duration: started.elapsed().as_secs_f64(),
        })?;

        Ok(created as i64 - deleted as i64)
    }

    async fn reconcile_reactive(&self, quantity: u32) -> Result<i64, ScalerError> {
        let started = std::time::Instant::now();
        let cleanup = self.runners.cleanup().await?;

        // Both were set together in connect().
        let (Some(supervisor), Some(queue)) = (&self.supervisor, &self.queue) else {
            return Ok(0);
        };

        let mut flushed = 0usize;
        let pending = queue.message_count().await?;
        if pending == 0 {
            // Nothing queued: idle runners are pure budget, and cheap to
            // resurrect on demand.
            flushed = self.runners.flush_runners(FlushMode::FlushIdle).await?;
        }

        let runners = self.runners.get_runners().await?;
        let current = count_fleet(&runners).active;
        let plan = plan_reactive(current, quantity);

        let mut deleted = flushed;
        let mut spawned = 0usize;
        let mut killed = 0usize;

        if plan.delete_runners > 0 {
            killed = supervisor.worker_count();
            supervisor.kill_all()?;
            deleted += self.runners.delete_runners(plan.delete_runners).await?;
        } else {
            match supervisor.reconcile(plan.worker_target)? {
                crate::reactive::Adjustment::Spawn(n) => spawned = n,
                crate::reactive::Adjustment::Kill(n) => killed = n,
                crate::reactive::Adjustment::None => {}
            }
        }

        let counts = count_fleet(&self.runners.get_runners().await?);
        self.events.append(&Event::Reconciliation {
            timestamp: Utc::now().timestamp(),
            flavor: self.config.name.clone(),
            crashed: cleanup.crashed,
            idle: counts.idle,
            busy: counts.busy,
            active: counts.active,
            expected: None,
            duration: started.elapsed().as_secs_f64(),
        })?;

        Ok(spawned as i64 - killed as i64 - deleted as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::InstanceName;
    use crate::openstack::{CloudInstance, CloudRunnerState};
    use crate::runner::{GithubRunner, GithubRunnerState};

    fn runner(name: &str, state: CloudRunnerState, github: Option<GithubRunnerState>) -> RunnerInstance {
        RunnerInstance {
            cloud: CloudInstance {
                name: InstanceName::parse("mgr-a", name).unwrap(),
                server_id: name.to_string(),
                addresses: vec![],
                created_at: None,
                state,
            },
            github: github.map(|state| GithubRunner {
                name: InstanceName::parse("mgr-a", name).unwrap(),
                id: serde_json::from_value(serde_json::json!(1)).unwrap(),
                state,
            }),
        }
    }

    #[test]
    fn fleet_counting() {
        let fleet = vec![
            runner("mgr-a-aaa11", CloudRunnerState::Active, Some(GithubRunnerState::Idle)),
            runner("mgr-a-bbb22", CloudRunnerState::Active, Some(GithubRunnerState::Busy)),
            runner("mgr-a-ccc33", CloudRunnerState::Created, None),
            runner("mgr-a-ddd44", CloudRunnerState::Error, None),
        ];

        let counts = count_fleet(&fleet);
        assert_eq!(counts.active, 3);
        assert_eq!(counts.idle, 1);
        assert_eq!(counts.busy, 1);
    }

    #[test]
    fn proactive_plan_converges_up_and_down() {
        assert_eq!(plan_proactive(0, 3), ScalingPlan { create: 3, delete: 0 });
        assert_eq!(plan_proactive(5, 2), ScalingPlan { create: 0, delete: 3 });
        assert_eq!(plan_proactive(3, 3), ScalingPlan { create: 0, delete: 0 });
        assert_eq!(plan_proactive(2, 0), ScalingPlan { create: 0, delete: 2 });
    }

    #[test]
    fn reactive_plan_splits_workers_and_runner_deletions() {
        // Short of target: spawn workers only.
        assert_eq!(
            plan_reactive(0, 4),
            ReactivePlan { worker_target: 4, delete_runners: 0 }
        );
        assert_eq!(
            plan_reactive(1, 4),
            ReactivePlan { worker_target: 3, delete_runners: 0 }
        );
        // At target: no workers, nothing to delete.
        assert_eq!(
            plan_reactive(4, 4),
            ReactivePlan { worker_target: 0, delete_runners: 0 }
        );
        // Over target: runners themselves must go.
        assert_eq!(
            plan_reactive(5, 2),
            ReactivePlan { worker_target: 0, delete_runners: 3 }
        );
    }
}
