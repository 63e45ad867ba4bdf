use serde::{Deserialize, Serialize};

/// Identifier of one worker, unique within a master for its lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle state of a worker as seen by the master.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Process launched, nothing heard yet.
    Spawned,
    /// `Starting` received; executor initialization in progress.
    Starting,
    /// Available for dispatch.
    Ready,
    /// Holds at least one assigned or running job.
    Busy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WorkerStatus::Spawned => "spawned",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Busy => "busy",
        };
        f.write_str(name)
    }
}

/// Snapshot of one worker's registry entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub worker_status: WorkerStatus,
    /// Epoch milliseconds at spawn.
    pub start_time: i64,
    /// Epoch milliseconds of the last message received from the worker.
    pub last_update_time: i64,
    /// OS process id in subprocess mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Jobs currently assigned or running (waiting jobs excluded).
    #[serde(default)]
    pub running_jobs: usize,
}
