//! Supervision of reactive worker processes.
//!
//! Workers are separate OS processes running the `reactive-runner` binary
//! against the same configuration file. Ownership is recognized purely by
//! command line, so a restarted manager picks up workers it did not spawn
//! itself. Surplus workers get SIGTERM, which they trap to settle their
//! queue message before exiting.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use sysinfo::System;
use thiserror::Error;
use tracing::instrument;

pub const WORKER_BINARY: &str = "reactive-runner";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("cannot locate the worker binary")]
    WorkerBinary(#[source] std::io::Error),

    #[error("failed to spawn worker process")]
    Spawn(#[source] std::io::Error),
}

/// What one reconciliation of the pool has to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Adjustment {
    Spawn(usize),
    Kill(usize),
    None,
}

pub fn compute_adjustment(observed: usize, target: usize) -> Adjustment {
    match observed.cmp(&target) {
        std::cmp::Ordering::Less => Adjustment::Spawn(target - observed),
        std::cmp::Ordering::Greater => Adjustment::Kill(observed - target),
        std::cmp::Ordering::Equal => Adjustment::None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: u32,
    pub started_at: u64,
}

/// Newest workers die first: they are the least likely to already hold a
/// message.
pub fn select_victims(mut workers: Vec<WorkerProcess>, count: usize) -> Vec<WorkerProcess> {
    workers.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    workers.truncate(count);
    workers
}

#[derive(Clone, Debug)]
pub struct ReactiveSupervisor {
    config_path: PathBuf,
}

impl ReactiveSupervisor {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Every live process whose command line marks it as one of our
    /// workers: the worker binary driven by our exact configuration file.
    pub fn observed_workers(&self) -> Vec<WorkerProcess> {
        let system = System::new_all();
        let config = self.config_path.to_string_lossy();

        system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let cmd: Vec<String> = process
                    .cmd()
                    .iter()
                    .map(|part| part.to_string_lossy().into_owned())
                    .collect();

                let is_worker = cmd
                    .first()
                    .is_some_and(|argv0| argv0.ends_with(WORKER_BINARY))
                    && cmd.iter().any(|part| part == config.as_ref());

                is_worker.then_some(WorkerProcess {
                    pid: pid.as_u32(),
                    started_at: process.start_time(),
                })
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.observed_workers().len()
    }

    /// Converge the pool to `target` workers: spawn the shortfall or
    /// terminate the surplus, newest first.
    #[instrument(skip(self))]
    pub fn reconcile(&self, target: usize) -> Result<Adjustment, SupervisorError> {
        let workers = self.observed_workers();
        let adjustment = compute_adjustment(workers.len(), target);

        match adjustment {
            Adjustment::Spawn(count) => {
                for _ in 0..count {
                    self.spawn_worker()?;
                }
                tracing::info!(spawned = count, "expanded worker pool");
            }
            Adjustment::Kill(count) => {
                for worker in select_victims(workers, count) {
                    self.terminate(worker);
                }
                tracing::info!(killed = count, "shrank worker pool");
            }
            Adjustment::None => {}
        }

        Ok(adjustment)
    }

    pub fn kill_all(&self) -> Result<(), SupervisorError> {
        self.reconcile(0)?;
        Ok(())
    }

    fn spawn_worker(&self) -> Result<(), SupervisorError> {
        let binary = worker_binary().map_err(SupervisorError::WorkerBinary)?;

        let child = tokio::process::Command::new(&binary)
            .arg("--config")
            .arg(&self.config_path)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        tracing::info!(pid = child.id(), "spawned reactive worker");
        // The child is intentionally not awaited; the runtime reaps it and
        // the next reconciliation re-counts the pool from the process table.
        drop(child);
        Ok(())
    }

    fn terminate(&self, worker: WorkerProcess) {
        match kill(Pid::from_raw(worker.pid as i32), Signal::SIGTERM) {
            Ok(()) => tracing::info!(pid = worker.pid, "terminated reactive worker"),
            Err(e) => tracing::warn!(pid = worker.pid, error = %e, "failed to signal worker"),
        }
    }
}

/// The worker binary ships next to the manager binary.
fn worker_binary() -> std::io::Result<PathBuf> {
    let current = std::env::current_exe()?;
    let dir = current.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "executable has no parent")
    })?;
    Ok(dir.join(WORKER_BINARY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjustment_arithmetic() {
        assert_eq!(compute_adjustment(0, 4), Adjustment::Spawn(4));
        assert_eq!(compute_adjustment(4, 4), Adjustment::None);
        assert_eq!(compute_adjustment(6, 4), Adjustment::Kill(2));
        assert_eq!(compute_adjustment(3, 0), Adjustment::Kill(3));
    }

    #[test]
    fn victims_are_newest_first() {
        let workers = vec![
            WorkerProcess { pid: 1, started_at: 100 },
            WorkerProcess { pid: 2, started_at: 300 },
            WorkerProcess { pid: 3, started_at: 200 },
        ];

        let victims = select_victims(workers, 2);
        let pids: Vec<u32> = victims.iter().map(|w| w.pid).collect();
        assert_eq!(pids, vec![2, 3]);
    }

    #[test]
    fn victim_count_is_bounded_by_pool() {
        let workers = vec![WorkerProcess { pid: 1, started_at: 1 }];
        assert_eq!(select_victims(workers, 5).len(), 1);
    }
}
