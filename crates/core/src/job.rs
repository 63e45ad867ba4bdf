use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::status::JobStatus;
use crate::worker::WorkerId;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Rejected state-machine transition.
///
/// The master converts this into an `invalid state` failure on the job
/// rather than letting the registry drift silently.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("job {query}: cannot {attempted} while {from}")]
pub struct InvalidTransition {
    pub query: String,
    pub from: JobStatus,
    pub attempted: &'static str,
}

/// Everything the master knows about one query.
///
/// The master owns the authoritative record; workers hold snapshots of it
/// received over their channel (`MasterMessage::JobSnapshot`) and never
/// mutate queue state directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobInfo {
    pub query: String,
    pub status: JobStatus,
    /// Worker currently responsible for the job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    /// Epoch milliseconds at which the record was created.
    pub start_time: i64,
    /// Epoch milliseconds of the last state change.
    pub last_update_time: i64,
    /// Present iff `status == Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Present iff `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Query this job is suspended on while `Waiting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    /// Operator-facing progress note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Times the job was returned to the queue after losing its worker.
    #[serde(default)]
    pub requeue_count: u32,
    /// Cooperative cancellation mark; the worker polls it between waits.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Absolute expiry (epoch milliseconds) when a job timeout is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<i64>,
}

impl JobInfo {
    /// Fresh record in the given status.
    pub fn new(query: impl Into<String>, status: JobStatus) -> Self {
        let now = now_millis();
        Self {
            query: query.into(),
            status,
            worker_id: None,
            start_time: now,
            last_update_time: now,
            result: None,
            error: None,
            dependency: None,
            message: None,
            requeue_count: 0,
            cancel_requested: false,
            deadline: None,
        }
    }

    /// Fresh record already enqueued.
    pub fn queued(query: impl Into<String>) -> Self {
        Self::new(query, JobStatus::Queued)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.last_update_time = now_millis();
    }

    fn reject(&self, attempted: &'static str) -> InvalidTransition {
        InvalidTransition {
            query: self.query.clone(),
            from: self.status,
            attempted,
        }
    }

    /// `Queued -> Assigned`, binding the worker.
    pub fn assign_to(&mut self, worker_id: WorkerId) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Queued {
            return Err(self.reject("assign"));
        }
        self.status = JobStatus::Assigned;
        self.worker_id = Some(worker_id);
        self.touch();
        Ok(())
    }

    /// `Assigned | Waiting | Running -> Running`. Clears any dependency,
    /// so it also models resumption after a wait.
    pub fn running(&mut self) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            self.status,
            JobStatus::Assigned | JobStatus::Waiting | JobStatus::Running
        );
        if !allowed || self.worker_id.is_none() {
            return Err(self.reject("run"));
        }
        self.status = JobStatus::Running;
        self.dependency = None;
        self.touch();
        Ok(())
    }

    /// `Assigned | Running | Waiting -> Waiting` on the given dependency.
    pub fn waiting_on(&mut self, dependency: impl Into<String>) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            self.status,
            JobStatus::Assigned | JobStatus::Running | JobStatus::Waiting
        );
        if !allowed || self.worker_id.is_none() {
            return Err(self.reject("wait"));
        }
        self.status = JobStatus::Waiting;
        self.dependency = Some(dependency.into());
        self.touch();
        Ok(())
    }

    /// Terminal success. Illegal once terminal.
    pub fn completed(&mut self, result: impl Into<String>) -> Result<(), InvalidTransition> {
        if self.is_terminal() {
            return Err(self.reject("complete"));
        }
        self.status = JobStatus::Completed;
        self.result = Some(result.into());
        self.error = None;
        self.dependency = None;
        self.touch();
        Ok(())
    }

    /// Terminal failure. Illegal once terminal.
    pub fn failed(&mut self, error: JobError) -> Result<(), InvalidTransition> {
        if self.is_terminal() {
            return Err(self.reject("fail"));
        }
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.result = None;
        self.dependency = None;
        self.touch();
        Ok(())
    }

    fn back_to_queue(&mut self, attempted: &'static str) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            self.status,
            JobStatus::Assigned | JobStatus::Running | JobStatus::Waiting
        );
        if !allowed {
            return Err(self.reject(attempted));
        }
        self.status = JobStatus::Queued;
        self.worker_id = None;
        self.dependency = None;
        self.touch();
        Ok(())
    }

    /// Back to `Queued` after the holding worker died; bumps the requeue
    /// counter that feeds the worker-crash failure cap.
    pub fn requeued_after_crash(&mut self) -> Result<(), InvalidTransition> {
        self.back_to_queue("requeue")?;
        self.requeue_count += 1;
        Ok(())
    }

    /// Back to `Queued` after a worker rejected the assignment.
    pub fn returned_to_queue(&mut self) -> Result<(), InvalidTransition> {
        self.back_to_queue("return to queue")
    }
}
