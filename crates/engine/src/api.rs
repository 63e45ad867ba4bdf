//! Public API types for the `jobq` queue engine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use jobq_core::{JobError, JobInfo, JobStatus, QueueSettings, WorkerId, WorkerInfo};

use crate::executor::Executor;
use crate::master::{Command, MasterShared};

/// How the master obtains its workers.
#[derive(Clone)]
pub enum SpawnMode {
    /// Workers run as tokio tasks inside the master process, evaluating
    /// queries through the given executor. The protocol is identical to
    /// subprocess mode; only the transport differs.
    InProcess(Arc<dyn Executor>),
    /// Workers run as OS processes with a framed channel over their
    /// stdin/stdout. The program must branch into
    /// [`worker_main`](crate::worker_main) when
    /// [`spawned_as_worker`](crate::spawned_as_worker) reports true.
    Subprocess {
        /// Worker executable, typically `std::env::current_exe()`.
        program: PathBuf,
        /// Extra arguments passed to the worker process.
        args: Vec<String>,
    },
}

impl std::fmt::Debug for SpawnMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnMode::InProcess(_) => f.write_str("InProcess"),
            SpawnMode::Subprocess { program, args } => f
                .debug_struct("Subprocess")
                .field("program", program)
                .field("args", args)
                .finish(),
        }
    }
}

/// Configuration for one queue instance.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of workers started with the queue.
    pub workers: usize,

    /// How often an otherwise silent worker announces liveness.
    pub heartbeat_interval: Duration,

    /// Silence threshold after which a worker is declared dead and its
    /// jobs are requeued.
    pub dead_worker_timeout: Duration,

    /// Optional per-job wall-clock budget, measured from first
    /// assignment. Expiry behaves like `cancel`.
    pub job_timeout: Option<Duration>,

    /// How many times a job may be requeued after losing its worker
    /// before it fails with a worker-crash error.
    pub max_requeues: u32,

    /// Worker transport and executor wiring.
    pub spawn: SpawnMode,
}

impl QueueConfig {
    /// Default worker pool size.
    pub const DEFAULT_WORKERS: usize = 4;

    /// Default heartbeat cadence.
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

    /// Default dead-worker threshold.
    pub const DEFAULT_DEAD_WORKER_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default requeue cap before a worker-crash failure.
    pub const DEFAULT_MAX_REQUEUES: u32 = 3;

    /// Defaults with in-process workers running `executor`.
    pub fn in_process(executor: Arc<dyn Executor>) -> Self {
        Self::with_spawn(SpawnMode::InProcess(executor))
    }

    /// Defaults with subprocess workers launched from `program`.
    pub fn subprocess(program: PathBuf, args: Vec<String>) -> Self {
        Self::with_spawn(SpawnMode::Subprocess { program, args })
    }

    fn with_spawn(spawn: SpawnMode) -> Self {
        Self {
            workers: Self::DEFAULT_WORKERS,
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            dead_worker_timeout: Self::DEFAULT_DEAD_WORKER_TIMEOUT,
            job_timeout: None,
            max_requeues: Self::DEFAULT_MAX_REQUEUES,
            spawn,
        }
    }

    /// Apply the operator settings file on top of a spawn mode.
    pub fn from_settings(settings: &QueueSettings, spawn: SpawnMode) -> Self {
        Self {
            workers: settings.workers,
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs.max(1)),
            dead_worker_timeout: Duration::from_secs(settings.dead_worker_timeout_secs.max(1)),
            job_timeout: settings.job_timeout_secs.map(Duration::from_secs),
            max_requeues: settings.max_requeues,
            spawn,
        }
    }
}

/// Queue event stream payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum QueueEvent {
    /// Master loop is up.
    Started,
    /// Graceful shutdown requested; queued jobs are being cancelled.
    StopRequested,
    /// A worker was launched.
    WorkerSpawned {
        /// Worker identifier.
        worker_id: WorkerId,
    },
    /// A worker finished initialization and is open for dispatch.
    WorkerReady {
        /// Worker identifier.
        worker_id: WorkerId,
    },
    /// A worker was removed after dying or going silent; its jobs were
    /// requeued or failed.
    WorkerEvicted {
        /// Worker identifier.
        worker_id: WorkerId,
    },
    /// A query entered the ready queue.
    JobQueued {
        /// The query.
        query: String,
    },
    /// A queued job was bound to a worker.
    JobAssigned {
        /// The query.
        query: String,
        /// The worker it was sent to.
        worker_id: WorkerId,
    },
    /// A running job suspended itself on a dependency.
    JobWaiting {
        /// The suspended query.
        query: String,
        /// The query it waits on.
        dependency: String,
    },
    /// A waiting job resumed after its dependency settled.
    JobResumed {
        /// The query.
        query: String,
    },
    /// A job reached a terminal state; `job` carries the result or error.
    JobFinished {
        /// Terminal job record.
        job: JobInfo,
    },
    /// Something noteworthy but non-fatal.
    Warning {
        /// Human-readable description.
        message: String,
    },
    /// Master loop exited.
    Stopped,
}

/// Point-in-time view of the whole queue, published on every change.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    /// Whether graceful shutdown is underway.
    pub stopping: bool,
    /// Every known job record, oldest first.
    pub jobs: Vec<JobInfo>,
    /// Queries currently in the ready queue, in dispatch order.
    pub ready: Vec<String>,
    /// The worker roster.
    pub workers: Vec<WorkerInfo>,
}

impl QueueSnapshot {
    /// Record for `query`, if known.
    pub fn job(&self, query: &str) -> Option<&JobInfo> {
        self.jobs.iter().find(|job| job.query == query)
    }

    /// Status of `query`; unknown queries read as `NotInQueue`.
    pub fn status(&self, query: &str) -> JobStatus {
        self.job(query)
            .map(|job| job.status)
            .unwrap_or(JobStatus::NotInQueue)
    }
}

/// Non-blocking answer to [`QueueHandle::result`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// The query is unknown or not terminal yet.
    Pending,
    /// Terminal success with the stored value.
    Completed(String),
    /// Terminal failure with the stored error.
    Failed(JobError),
}

/// Failure talking to the queue through its handle.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The master loop is gone.
    #[error("queue is shut down")]
    Closed,
    /// The query is not known to the queue.
    #[error("query {0:?} is not in the queue")]
    UnknownQuery(String),
}

/// Handle to a running queue instance.
///
/// Reads (`status`, `result`, `snapshot`, `report`) are served from the
/// latest published snapshot and never block. Mutations round-trip
/// through the master loop, which serializes all state changes.
pub struct QueueHandle {
    pub(crate) cmd_tx: mpsc::UnboundedSender<Command>,
    pub(crate) snapshot_rx: watch::Receiver<QueueSnapshot>,
    pub(crate) shared: Arc<MasterShared>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

/// Start a queue instance and return its handle.
pub fn start_queue(config: QueueConfig) -> QueueHandle {
    crate::master::start_queue(config)
}

impl QueueHandle {
    async fn round_trip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, answer) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .map_err(|_| QueueError::Closed)?;
        answer.await.map_err(|_| QueueError::Closed)
    }

    /// Submit a query. Returns `true` if it was new; a known query is
    /// left untouched and `false` comes back.
    pub async fn submit(&self, query: impl Into<String>) -> Result<bool, QueueError> {
        let query = query.into();
        self.round_trip(|reply| Command::Submit { query, reply }).await
    }

    /// Re-evaluate a terminal query by rebinding it to a fresh record.
    /// Returns `false` if the query is still live (nothing changes).
    pub async fn resubmit(&self, query: impl Into<String>) -> Result<bool, QueueError> {
        let query = query.into();
        self.round_trip(|reply| Command::Resubmit { query, reply })
            .await
    }

    /// Cancel a query: queued jobs fail immediately, running jobs are
    /// asked to stop cooperatively (and may still complete).
    pub async fn cancel(&self, query: impl Into<String>) -> Result<(), QueueError> {
        let query = query.into();
        self.round_trip(|reply| Command::Cancel { query, reply })
            .await?
    }

    /// Current status of a query. Never blocks.
    pub fn status(&self, query: &str) -> JobStatus {
        self.snapshot_rx.borrow().status(query)
    }

    /// Current record of a query, if known. Never blocks.
    pub fn job(&self, query: &str) -> Option<JobInfo> {
        self.snapshot_rx.borrow().job(query).cloned()
    }

    /// Result of a query: the stored value or error once terminal, else
    /// a pending marker. Never blocks.
    pub fn result(&self, query: &str) -> JobResult {
        match self.job(query) {
            Some(job) if job.status == JobStatus::Completed => {
                JobResult::Completed(job.result.unwrap_or_default())
            }
            Some(job) if job.status == JobStatus::Failed => JobResult::Failed(
                job.error
                    .unwrap_or_else(|| JobError::invalid_state("failed without an error payload")),
            ),
            _ => JobResult::Pending,
        }
    }

    /// Poll until `query` reaches a terminal state and return its record.
    ///
    /// Polls the snapshot at 10 Hz. A query nobody ever submits keeps
    /// this pending until the queue shuts down.
    pub async fn wait(&self, query: &str) -> Result<JobInfo, QueueError> {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let settled = {
                let snapshot = self.snapshot_rx.borrow();
                snapshot.job(query).filter(|job| job.is_terminal()).cloned()
            };
            if let Some(job) = settled {
                return Ok(job);
            }
            if self.snapshot_rx.has_changed().is_err() {
                return Err(QueueError::Closed);
            }
        }
    }

    /// Top the worker pool up to `count` workers; returns how many were
    /// spawned.
    pub async fn start_workers(&self, count: usize) -> Result<usize, QueueError> {
        self.round_trip(|reply| Command::StartWorkers { count, reply })
            .await
    }

    /// Stop and remove every worker. Held jobs go back to the queue tail
    /// and sit there until workers are started again.
    pub async fn stop_workers(&self) -> Result<(), QueueError> {
        self.round_trip(|reply| Command::StopWorkers { reply }).await
    }

    /// Latest queue snapshot.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Human-readable dump of jobs, queue and workers for operators.
    pub fn report(&self) -> String {
        crate::report::render_report(&self.snapshot())
    }

    /// Subscribe to the queue event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Request graceful shutdown: queued jobs are cancelled, in-flight
    /// jobs drain, workers are stopped.
    pub fn request_stop(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }

    /// Request graceful shutdown and wait for the master loop to exit.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_stop();
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("master task join error: {err}")),
        }
    }
}
