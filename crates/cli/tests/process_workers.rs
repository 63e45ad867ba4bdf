//! Crash-recovery scenarios against real worker subprocesses.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::Duration;

use jobq_engine::{JobStatus, QueueConfig, QueueHandle, WorkerId, start_queue};

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_jobq"))
}

fn subprocess_queue(workers: usize, dead_worker_timeout: Duration) -> QueueHandle {
    let mut cfg = QueueConfig::subprocess(worker_binary(), Vec::new());
    cfg.workers = workers;
    cfg.heartbeat_interval = Duration::from_millis(100);
    cfg.dead_worker_timeout = dead_worker_timeout;
    start_queue(cfg)
}

async fn wait_for_status(handle: &QueueHandle, query: &str, wanted: JobStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if handle.status(query) == wanted {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{query} never reached {wanted} (currently {})",
            handle.status(query)
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Pid of the worker currently bound to `query`.
fn bound_worker(handle: &QueueHandle, query: &str) -> (WorkerId, u32) {
    let snapshot = handle.snapshot();
    let worker_id = snapshot
        .job(query)
        .and_then(|job| job.worker_id)
        .expect("running job is bound to a worker");
    let pid = snapshot
        .workers
        .iter()
        .find(|worker| worker.worker_id == worker_id)
        .and_then(|worker| worker.pid)
        .expect("subprocess worker has a pid");
    (worker_id, pid)
}

#[tokio::test(flavor = "multi_thread")]
async fn killed_worker_is_evicted_and_the_job_retried() {
    let handle = subprocess_queue(2, Duration::from_secs(10));

    handle.submit("Slow0").await.unwrap();
    wait_for_status(&handle, "Slow0", JobStatus::Running).await;
    let (victim, pid) = bound_worker(&handle, "Slow0");

    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    let job = tokio::time::timeout(Duration::from_secs(30), handle.wait("Slow0"))
        .await
        .expect("job settled after the crash")
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_deref(), Some("Result-Slow0(~)"));
    assert_eq!(job.requeue_count, 1);
    assert_ne!(job.worker_id, Some(victim), "job moved to another worker");

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn frozen_worker_misses_heartbeats_and_is_evicted() {
    let handle = subprocess_queue(1, Duration::from_millis(700));

    handle.submit("Slow0").await.unwrap();
    wait_for_status(&handle, "Slow0", JobStatus::Running).await;
    let (victim, pid) = bound_worker(&handle, "Slow0");

    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGSTOP);
    }

    // The health monitor notices the silence and requeues the job; with
    // no workers left it parks in the ready queue.
    wait_for_status(&handle, "Slow0", JobStatus::Queued).await;
    let parked = handle.job("Slow0").unwrap();
    assert_eq!(parked.worker_id, None);
    assert_eq!(parked.requeue_count, 1);

    assert_eq!(handle.start_workers(1).await.unwrap(), 1);
    let job = tokio::time::timeout(Duration::from_secs(30), handle.wait("Slow0"))
        .await
        .expect("job settled after the replacement worker arrived")
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_ne!(job.worker_id, Some(victim));

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_chain_works_across_processes() {
    let handle = subprocess_queue(2, Duration::from_secs(10));

    handle.submit("Job2").await.unwrap();
    let job = tokio::time::timeout(Duration::from_secs(30), handle.wait("Job2"))
        .await
        .expect("chain settled")
        .unwrap();
    assert_eq!(
        job.result.as_deref(),
        Some("Result-Job2(Result-Job1(Result-Job0(~)))")
    );

    handle.shutdown().await.unwrap();
}
