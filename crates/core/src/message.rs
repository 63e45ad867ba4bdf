use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::JobInfo;
use crate::worker::WorkerId;

/// Messages the master sends down a worker channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum MasterMessage {
    /// Offer a queued job to the worker.
    SubmitJob { worker_id: WorkerId, query: String },
    /// Push the current state of a job the worker asked about or waits on.
    JobSnapshot { worker_id: WorkerId, job: JobInfo },
    /// Request cooperative cancellation of a held job.
    CancelJob { worker_id: WorkerId, query: String },
    /// Liveness probe; the worker answers with `Pong`.
    Ping { worker_id: WorkerId },
    /// Finish held jobs, then exit the loop.
    Stop { worker_id: WorkerId },
}

/// Messages a worker sends up its channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Loop entered; executor initialization starting.
    Starting { worker_id: WorkerId },
    /// Initialization done, or all held jobs drained; open for dispatch.
    Ready { worker_id: WorkerId },
    /// The worker took the offered job and is executing it.
    AcceptedJob { worker_id: WorkerId, query: String },
    /// The worker is busy; the job must go back to the queue head.
    RejectedJob { worker_id: WorkerId, query: String },
    /// The named job is suspended until `dependency` reaches a terminal
    /// state.
    Waiting {
        worker_id: WorkerId,
        query: String,
        dependency: String,
    },
    /// The named job resumed after its dependency settled.
    Resuming { worker_id: WorkerId, query: String },
    /// An executor asked for `query` to be evaluated without waiting on
    /// it; the master enqueues it if unknown and keeps the worker posted.
    RequestedJob { worker_id: WorkerId, query: String },
    /// Terminal success for the named job.
    FinishedJob {
        worker_id: WorkerId,
        query: String,
        result: String,
    },
    /// Terminal failure for the named job.
    FailedJob {
        worker_id: WorkerId,
        query: String,
        error: JobError,
    },
    /// The worker could not make sense of an inbound frame.
    WrongRequest { worker_id: WorkerId, detail: String },
    /// Periodic liveness signal while otherwise silent.
    Heartbeat { worker_id: WorkerId },
    /// Answer to `Ping`.
    Pong { worker_id: WorkerId },
}

impl WorkerMessage {
    /// The sender, carried by every variant.
    pub fn worker_id(&self) -> WorkerId {
        match self {
            WorkerMessage::Starting { worker_id }
            | WorkerMessage::Ready { worker_id }
            | WorkerMessage::AcceptedJob { worker_id, .. }
            | WorkerMessage::RejectedJob { worker_id, .. }
            | WorkerMessage::Waiting { worker_id, .. }
            | WorkerMessage::Resuming { worker_id, .. }
            | WorkerMessage::RequestedJob { worker_id, .. }
            | WorkerMessage::FinishedJob { worker_id, .. }
            | WorkerMessage::FailedJob { worker_id, .. }
            | WorkerMessage::WrongRequest { worker_id, .. }
            | WorkerMessage::Heartbeat { worker_id }
            | WorkerMessage::Pong { worker_id } => *worker_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::JobStatus;

    #[test]
    fn messages_are_tagged_by_kind() {
        let msg = WorkerMessage::Waiting {
            worker_id: WorkerId(3),
            query: "Job2".into(),
            dependency: "Job1".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "Waiting");
        assert_eq!(value["worker_id"], 3);
        assert_eq!(value["dependency"], "Job1");

        let back: WorkerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.worker_id(), WorkerId(3));
    }

    #[test]
    fn snapshot_carries_the_job_record() {
        let job = JobInfo::queued("Job0");
        let msg = MasterMessage::JobSnapshot {
            worker_id: WorkerId(1),
            job: job.clone(),
        };
        let text = serde_json::to_string(&msg).unwrap();
        let back: MasterMessage = serde_json::from_str(&text).unwrap();
        match back {
            MasterMessage::JobSnapshot { job: got, .. } => {
                assert_eq!(got.query, job.query);
                assert_eq!(got.status, JobStatus::Queued);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
