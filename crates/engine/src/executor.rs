use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use jobq_core::{JobError, JobInfo, JobStatus, WorkerId};

use crate::worker::{CtxRequest, WaitOutcome};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Turns a query into a result, possibly by waiting on other queries.
///
/// Implementations run on blocking threads inside a worker; everything the
/// queue offers them goes through the [`JobContext`] handle. An executor is
/// shared by every job its worker runs, so it must be `Sync`.
pub trait Executor: Send + Sync + 'static {
    /// One-time setup, run between the worker's `Starting` and `Ready`
    /// announcements. A failure here takes the worker down.
    fn initialize(&self) -> Result<(), JobError> {
        Ok(())
    }

    /// Evaluate one query.
    ///
    /// Returning `Err` fails the job; the error travels to the master and
    /// to every waiter. Dependency failures surfaced by
    /// [`JobContext::wait_for`] are usually just propagated with `?`.
    fn execute(&self, ctx: &JobContext, query: &str) -> Result<String, JobError>;
}

/// The queue handle an executor sees while evaluating one job.
///
/// All methods are synchronous and safe to call from the blocking executor
/// thread; they talk to the worker's channel loop, never to the master
/// directly.
pub struct JobContext {
    worker_id: WorkerId,
    query: String,
    cancel: Arc<AtomicBool>,
    local_jobs: Arc<Mutex<HashMap<String, JobInfo>>>,
    override_outcome: Arc<Mutex<Option<Result<String, JobError>>>>,
    requests: mpsc::UnboundedSender<CtxRequest>,
}

impl JobContext {
    pub(crate) fn new(
        worker_id: WorkerId,
        query: String,
        cancel: Arc<AtomicBool>,
        local_jobs: Arc<Mutex<HashMap<String, JobInfo>>>,
        override_outcome: Arc<Mutex<Option<Result<String, JobError>>>>,
        requests: mpsc::UnboundedSender<CtxRequest>,
    ) -> Self {
        Self {
            worker_id,
            query,
            cancel,
            local_jobs,
            override_outcome,
            requests,
        }
    }

    /// The query this context belongs to.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// The worker evaluating the job.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Whether cancellation of this job has been requested. Long-running
    /// executors should poll this and bail out with a `Cancelled` error.
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Ask the master to evaluate `query` without waiting on it. The
    /// worker is kept posted on its progress, so a later
    /// [`wait_for`](Self::wait_for) may complete locally.
    pub fn submit(&self, query: impl Into<String>) {
        let _ = self.requests.send(CtxRequest::Submit {
            query: query.into(),
        });
    }

    /// Status of `query` as of the last snapshot this worker received.
    /// Never blocks; unknown queries read as `NotInQueue`.
    pub fn status(&self, query: &str) -> JobStatus {
        lock(&self.local_jobs)
            .get(query)
            .map(|job| job.status)
            .unwrap_or(JobStatus::NotInQueue)
    }

    /// Block until `query` reaches a terminal state, then return its
    /// record.
    ///
    /// Submits the query if the master does not know it yet. While this
    /// job is suspended here, its worker may pick up other queued jobs;
    /// that is what keeps deep dependency chains from wedging the pool.
    /// A failed dependency comes back as `Err` carrying the dependency's
    /// own error, ready to be propagated.
    pub fn wait_for(&self, query: &str) -> Result<JobInfo, JobError> {
        if self.cancelled() {
            return Err(JobError::cancelled(format!(
                "{} cancelled before waiting on {query}",
                self.query
            )));
        }

        if let Some(info) = self.local_terminal(query) {
            return settled(info);
        }

        let (reply, outcome) = std::sync::mpsc::sync_channel(1);
        self.requests
            .send(CtxRequest::Wait {
                from: self.query.clone(),
                dependency: query.to_string(),
                reply,
            })
            .map_err(|_| JobError::worker_crash("worker loop is gone"))?;

        match outcome.recv() {
            Ok(WaitOutcome::Terminal(info)) => settled(info),
            Ok(WaitOutcome::Cancelled) => Err(JobError::cancelled(format!(
                "{} cancelled while waiting on {query}",
                self.query
            ))),
            Err(_) => Err(JobError::worker_crash("worker loop dropped the wait")),
        }
    }

    /// Record an explicit result for this job, overriding whatever the
    /// executor returns.
    pub fn set_result(&self, value: impl Into<String>) {
        *lock(&self.override_outcome) = Some(Ok(value.into()));
    }

    /// Record an explicit failure for this job, overriding whatever the
    /// executor returns.
    pub fn set_error(&self, error: JobError) {
        *lock(&self.override_outcome) = Some(Err(error));
    }

    fn local_terminal(&self, query: &str) -> Option<JobInfo> {
        lock(&self.local_jobs)
            .get(query)
            .filter(|job| job.is_terminal())
            .cloned()
    }
}

fn settled(info: JobInfo) -> Result<JobInfo, JobError> {
    match info.status {
        JobStatus::Completed => Ok(info),
        JobStatus::Failed => Err(info.error.clone().unwrap_or_else(|| {
            JobError::invalid_state(format!("{} failed without an error payload", info.query))
        })),
        other => Err(JobError::invalid_state(format!(
            "{} delivered as settled while {other}",
            info.query
        ))),
    }
}
