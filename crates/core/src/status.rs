use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// `Completed` and `Failed` are terminal; once a job reaches either, its
/// result or error payload never changes again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Status has not been established yet (local mirrors only).
    Unknown,
    /// The query is not known to the queue.
    NotInQueue,
    /// In the ready queue, not yet bound to a worker.
    Queued,
    /// Bound to a worker, acceptance pending.
    Assigned,
    /// A worker is evaluating the query.
    Running,
    /// Evaluation is suspended on a dependency.
    Waiting,
    /// Evaluation produced a result.
    Completed,
    /// Evaluation failed; the error payload says why.
    Failed,
}

impl JobStatus {
    /// Whether the status is `Completed` or `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Unknown => "unknown",
            JobStatus::NotInQueue => "not in queue",
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Waiting => "waiting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_and_failed_are_terminal() {
        for status in [
            JobStatus::Unknown,
            JobStatus::NotInQueue,
            JobStatus::Queued,
            JobStatus::Assigned,
            JobStatus::Running,
            JobStatus::Waiting,
        ] {
            assert!(!status.is_terminal(), "{status} must not be terminal");
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
