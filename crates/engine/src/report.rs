use std::fmt::Write as _;

use crate::api::QueueSnapshot;

const RAIL: &str = "==============================================\n";

/// Render the operator report: one row per job, the ready queue, and the
/// worker roster.
pub(crate) fn render_report(snapshot: &QueueSnapshot) -> String {
    let mut text = String::new();
    text.push_str(RAIL);

    for job in &snapshot.jobs {
        let worker = job
            .worker_id
            .map(|worker_id| worker_id.to_string())
            .unwrap_or_default();
        let mut payload = job.result.clone().unwrap_or_default();
        if let Some(error) = &job.error {
            let _ = write!(payload, "{error}");
        }
        let _ = writeln!(
            text,
            "{:>10} {:>12} {:>10} {} {}",
            worker,
            job.query,
            job.status,
            job.dependency.as_deref().unwrap_or(""),
            payload,
        );
    }

    let _ = writeln!(text, "Queue: {}", snapshot.ready.len());
    let _ = writeln!(text, "  {:?}", snapshot.ready);

    let workers: Vec<String> = snapshot
        .workers
        .iter()
        .map(|worker| {
            format!(
                "{} {}({})",
                worker.worker_id, worker.worker_status, worker.running_jobs
            )
        })
        .collect();
    let _ = writeln!(text, "Workers: {}", workers.join(", "));
    if snapshot.stopping {
        text.push_str("(stopping)\n");
    }

    text.push_str(RAIL);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::{JobInfo, WorkerId, WorkerInfo, WorkerStatus, now_millis};

    #[test]
    fn report_lists_jobs_queue_and_workers() {
        let mut done = JobInfo::queued("Job0");
        done.assign_to(WorkerId(1)).unwrap();
        done.running().unwrap();
        done.completed("Result-Job0(~)").unwrap();

        let snapshot = QueueSnapshot {
            stopping: false,
            jobs: vec![done, JobInfo::queued("Job1")],
            ready: vec!["Job1".to_string()],
            workers: vec![WorkerInfo {
                worker_id: WorkerId(1),
                worker_status: WorkerStatus::Ready,
                start_time: now_millis(),
                last_update_time: now_millis(),
                pid: None,
                running_jobs: 0,
            }],
        };

        let report = render_report(&snapshot);
        assert!(report.contains("Job0"));
        assert!(report.contains("Result-Job0(~)"));
        assert!(report.contains("completed"));
        assert!(report.contains("Queue: 1"));
        assert!(report.contains("worker-1 ready(0)"));
    }
}
