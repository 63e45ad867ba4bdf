use serde::{Deserialize, Serialize};

/// Classification of job failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The executor reported a failure (or panicked).
    Executor,
    /// The job sat on a directed cycle in the dependency relation.
    DependencyCycle,
    /// The worker holding the job died too many times.
    WorkerCrash,
    /// An illegal state-machine transition was attempted; indicates a bug.
    InvalidState,
    /// The job was cancelled by the client or timed out.
    Cancelled,
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobErrorKind::Executor => "executor error",
            JobErrorKind::DependencyCycle => "dependency cycle",
            JobErrorKind::WorkerCrash => "worker crash",
            JobErrorKind::InvalidState => "invalid state",
            JobErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Failure payload attached to a `Failed` job.
///
/// Errors never cross the process boundary as panics or exceptions; they
/// travel as this serialized record and are re-surfaced by waiters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Executor-reported failure; `message` carries the executor's text
    /// and trace.
    pub fn executor(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Executor, message)
    }

    pub fn dependency_cycle(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::DependencyCycle, message)
    }

    pub fn worker_crash(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::WorkerCrash, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::InvalidState, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(JobErrorKind::Cancelled, message)
    }
}
