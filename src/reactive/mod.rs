//! Reactive mode: queue consumption and the worker-process pool that turns
//! queued jobs into runner creations, one job per worker.

pub mod queue;
pub mod supervisor;
pub mod worker;

pub use queue::{Disposition, JobDetails, QueueClient, QueueError};
pub use supervisor::{Adjustment, ReactiveSupervisor, SupervisorError};
pub use worker::{Worker, WorkerError, WorkerOutcome};
