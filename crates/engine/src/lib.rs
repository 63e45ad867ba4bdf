#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Dependency-aware job queue engine: a master loop that owns all job
//! state, plus workers (in-process tasks or OS subprocesses) that
//! evaluate opaque queries and may suspend on one another's results.

/// Public API for the queue engine.
pub mod api;

mod executor;
mod master;
mod registry;
mod report;
mod worker;

pub use api::{
    JobResult, QueueConfig, QueueError, QueueEvent, QueueHandle, QueueSnapshot, SpawnMode,
    start_queue,
};
pub use executor::{Executor, JobContext};
pub use worker::{spawned_as_worker, worker_main};

pub use jobq_core::{
    JobError, JobErrorKind, JobInfo, JobStatus, WorkerId, WorkerInfo, WorkerStatus,
};
