//! End-to-end queue behavior over in-process workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobq_engine::{
    Executor, JobContext, JobError, JobErrorKind, JobResult, JobStatus, QueueConfig, QueueEvent,
    QueueHandle, start_queue,
};

/// The chain executor from the original system: a query with a positive
/// trailing integer `N` depends on its `N-1` sibling; everything else
/// evaluates directly. A few query families drive specific scenarios.
#[derive(Default)]
struct TestExecutor {
    calls: Mutex<HashMap<String, usize>>,
}

impl TestExecutor {
    fn calls_for(&self, query: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(query)
            .copied()
            .unwrap_or(0)
    }
}

fn split_trailing_number(query: &str) -> Option<(&str, u32)> {
    let digits_at = query.rfind(|c: char| !c.is_ascii_digit())? + 1;
    let (stem, digits) = query.split_at(digits_at);
    digits.parse().ok().map(|n| (stem, n))
}

fn dep_result(info: jobq_engine::JobInfo) -> String {
    info.result.unwrap_or_default()
}

impl Executor for TestExecutor {
    fn execute(&self, ctx: &JobContext, query: &str) -> Result<String, JobError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(query.to_string())
            .or_insert(0) += 1;

        if query.starts_with("Slow") {
            std::thread::sleep(Duration::from_millis(300));
            return Ok(format!("Result-{query}(~)"));
        }
        if query.starts_with("Bad") {
            return Err(JobError::executor(format!("{query} refused")));
        }
        if query == "NeedsBad" {
            let dep = ctx.wait_for("Bad")?;
            return Ok(format!("Result-{query}({})", dep_result(dep)));
        }
        if query == "Spin" {
            for _ in 0..500 {
                if ctx.cancelled() {
                    return Err(JobError::cancelled("spin cancelled"));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            return Ok("spun dry".to_string());
        }
        if query == "CycA" {
            let dep = ctx.wait_for("CycB")?;
            return Ok(format!("Result-{query}({})", dep_result(dep)));
        }
        if query == "CycB" {
            let dep = ctx.wait_for("CycA")?;
            return Ok(format!("Result-{query}({})", dep_result(dep)));
        }
        if query == "Fan" {
            ctx.submit("Leaf0");
            ctx.submit("Leaf1");
            let left = ctx.wait_for("Leaf0")?;
            let right = ctx.wait_for("Leaf1")?;
            return Ok(format!(
                "Result-Fan({},{})",
                dep_result(left),
                dep_result(right)
            ));
        }

        match split_trailing_number(query) {
            Some((stem, n)) if n > 0 => {
                let dep = ctx.wait_for(&format!("{stem}{}", n - 1))?;
                Ok(format!("Result-{query}({})", dep_result(dep)))
            }
            _ => Ok(format!("Result-{query}(~)")),
        }
    }
}

fn queue_with(workers: usize, executor: Arc<TestExecutor>) -> QueueHandle {
    let mut cfg = QueueConfig::in_process(executor);
    cfg.workers = workers;
    cfg.heartbeat_interval = Duration::from_millis(100);
    cfg.dead_worker_timeout = Duration::from_secs(10);
    start_queue(cfg)
}

async fn wait_done(handle: &QueueHandle, query: &str) -> jobq_engine::JobInfo {
    tokio::time::timeout(Duration::from_secs(15), handle.wait(query))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {query}"))
        .expect("queue closed while waiting")
}

async fn wait_until(handle: &QueueHandle, query: &str, wanted: JobStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if handle.status(query) == wanted {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{query} never reached {wanted} (currently {})",
            handle.status(query)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_job_completes() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(1, executor.clone());

    assert!(handle.submit("Job0").await.unwrap());
    let job = wait_done(&handle, "Job0").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_deref(), Some("Result-Job0(~)"));
    assert_eq!(job.error, None);

    assert_eq!(
        handle.result("Job0"),
        JobResult::Completed("Result-Job0(~)".to_string())
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dependency_chain_completes_with_two_workers() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(2, executor.clone());

    assert!(handle.submit("Job3").await.unwrap());
    let job = wait_done(&handle, "Job3").await;
    assert_eq!(
        job.result.as_deref(),
        Some("Result-Job3(Result-Job2(Result-Job1(Result-Job0(~))))")
    );

    let snapshot = handle.snapshot();
    for query in ["Job0", "Job1", "Job2", "Job3"] {
        assert_eq!(snapshot.status(query), JobStatus::Completed, "{query}");
        let records = snapshot.jobs.iter().filter(|j| j.query == query).count();
        assert_eq!(records, 1, "exactly one record for {query}");
        assert_eq!(executor.calls_for(query), 1, "one execution of {query}");
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_submit_shares_one_evaluation() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(2, executor.clone());

    assert!(handle.submit("Job0").await.unwrap());
    assert!(!handle.submit("Job0").await.unwrap());
    wait_done(&handle, "Job0").await;
    assert!(!handle.submit("Job0").await.unwrap());

    assert_eq!(executor.calls_for("Job0"), 1);
    assert_eq!(
        handle.snapshot().jobs.iter().filter(|j| j.query == "Job0").count(),
        1
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn independent_queries_share_the_pool() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(2, executor.clone());

    assert!(handle.submit("Job5").await.unwrap());
    assert!(handle.submit("Other0").await.unwrap());

    let other = wait_done(&handle, "Other0").await;
    assert_eq!(other.result.as_deref(), Some("Result-Other0(~)"));

    let chain = wait_done(&handle, "Job5").await;
    assert_eq!(chain.status, JobStatus::Completed);
    assert!(
        chain.result.as_deref().unwrap().starts_with("Result-Job5("),
        "unexpected result: {:?}",
        chain.result
    );
    for n in 0..=5 {
        assert_eq!(handle.status(&format!("Job{n}")), JobStatus::Completed);
    }
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_propagates_to_waiters() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(2, executor.clone());

    handle.submit("Bad").await.unwrap();
    let bad = wait_done(&handle, "Bad").await;
    assert_eq!(bad.status, JobStatus::Failed);
    let error = bad.error.expect("failed job carries its error");
    assert_eq!(error.kind, JobErrorKind::Executor);
    assert!(error.message.contains("Bad refused"));

    handle.submit("NeedsBad").await.unwrap();
    let needs = wait_done(&handle, "NeedsBad").await;
    assert_eq!(needs.status, JobStatus::Failed);
    let error = needs.error.expect("propagated error");
    assert_eq!(error.kind, JobErrorKind::Executor);
    assert!(error.message.contains("Bad refused"), "{}", error.message);
    assert_eq!(needs.result, None);
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cycle_fails_exactly_the_jobs_on_it() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(2, executor.clone());

    handle.submit("CycA").await.unwrap();
    handle.submit("Solo").await.unwrap();

    let cyc_a = wait_done(&handle, "CycA").await;
    let cyc_b = wait_done(&handle, "CycB").await;
    for job in [cyc_a, cyc_b] {
        assert_eq!(job.status, JobStatus::Failed, "{}", job.query);
        assert_eq!(
            job.error.as_ref().map(|e| e.kind),
            Some(JobErrorKind::DependencyCycle),
            "{}",
            job.query
        );
    }

    let solo = wait_done(&handle, "Solo").await;
    assert_eq!(solo.status, JobStatus::Completed);
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn one_worker_finishes_a_deep_chain() {
    // A waiting job frees its worker, so even a single worker walks the
    // whole dependency chain without deadlocking.
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(1, executor.clone());

    handle.submit("Job3").await.unwrap();
    let job = wait_done(&handle, "Job3").await;
    assert_eq!(
        job.result.as_deref(),
        Some("Result-Job3(Result-Job2(Result-Job1(Result-Job0(~))))")
    );
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn fan_in_submits_and_waits_on_both_legs() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(2, executor.clone());

    handle.submit("Fan").await.unwrap();
    let fan = wait_done(&handle, "Fan").await;
    assert_eq!(
        fan.result.as_deref(),
        Some("Result-Fan(Result-Leaf0(~),Result-Leaf1(~))")
    );
    assert_eq!(handle.status("Leaf0"), JobStatus::Completed);
    assert_eq!(handle.status("Leaf1"), JobStatus::Completed);
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_while_queued_fails_immediately() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(0, executor.clone());

    handle.submit("Job0").await.unwrap();
    wait_until(&handle, "Job0", JobStatus::Queued).await;
    handle.cancel("Job0").await.unwrap();

    let job = wait_done(&handle, "Job0").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().map(|e| e.kind), Some(JobErrorKind::Cancelled));
    assert!(handle.snapshot().ready.is_empty());
    assert_eq!(executor.calls_for("Job0"), 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_while_running_is_cooperative() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(1, executor.clone());

    handle.submit("Spin").await.unwrap();
    wait_until(&handle, "Spin", JobStatus::Running).await;
    handle.cancel("Spin").await.unwrap();

    let job = wait_done(&handle, "Spin").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().map(|e| e.kind), Some(JobErrorKind::Cancelled));
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn job_timeout_acts_like_cancel() {
    let executor = Arc::new(TestExecutor::default());
    let mut cfg = QueueConfig::in_process(executor.clone());
    cfg.workers = 1;
    cfg.heartbeat_interval = Duration::from_millis(100);
    cfg.dead_worker_timeout = Duration::from_secs(10);
    cfg.job_timeout = Some(Duration::from_millis(200));
    let handle = start_queue(cfg);

    handle.submit("Spin").await.unwrap();
    let job = wait_done(&handle, "Spin").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().map(|e| e.kind), Some(JobErrorKind::Cancelled));
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn resubmit_reevaluates_a_settled_query() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(1, executor.clone());

    handle.submit("Job0").await.unwrap();
    wait_done(&handle, "Job0").await;
    assert_eq!(executor.calls_for("Job0"), 1);

    assert!(handle.resubmit("Job0").await.unwrap());
    wait_done(&handle, "Job0").await;
    assert_eq!(executor.calls_for("Job0"), 2);
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ready_queue_mirrors_queued_status() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(0, executor.clone());

    for query in ["Other0", "Other1x", "Plain"] {
        handle.submit(query).await.unwrap();
    }
    wait_until(&handle, "Plain", JobStatus::Queued).await;

    let snapshot = handle.snapshot();
    let queued: Vec<&str> = snapshot
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Queued)
        .map(|job| job.query.as_str())
        .collect();
    assert_eq!(snapshot.ready.len(), queued.len());
    for query in &queued {
        assert!(snapshot.ready.iter().any(|ready| ready == query));
    }
    assert_eq!(handle.result("Plain"), JobResult::Pending);

    // Workers arrive late; everything still drains.
    assert_eq!(handle.start_workers(1).await.unwrap(), 1);
    for query in ["Other0", "Other1x", "Plain"] {
        assert_eq!(wait_done(&handle, query).await.status, JobStatus::Completed);
    }
    assert!(handle.snapshot().ready.is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_workers_return_jobs_to_the_queue() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(1, executor.clone());

    handle.submit("Slow0").await.unwrap();
    wait_until(&handle, "Slow0", JobStatus::Running).await;

    handle.stop_workers().await.unwrap();
    wait_until(&handle, "Slow0", JobStatus::Queued).await;
    let job = handle.job("Slow0").expect("record survives worker stop");
    assert_eq!(job.worker_id, None);
    assert_eq!(job.requeue_count, 0, "operator stop is not a crash");

    handle.start_workers(1).await.unwrap();
    let job = wait_done(&handle, "Slow0").await;
    assert_eq!(job.status, JobStatus::Completed);
    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn event_stream_covers_the_job_lifecycle() {
    let executor = Arc::new(TestExecutor::default());
    let handle = queue_with(1, executor.clone());
    let mut events = handle.subscribe();

    handle.submit("Job1").await.unwrap();
    wait_done(&handle, "Job1").await;
    handle.shutdown().await.unwrap();

    let mut saw_queued = false;
    let mut saw_waiting = false;
    let mut saw_resumed = false;
    let mut finished = Vec::new();
    let mut saw_stopped = false;
    while let Ok(event) = events.try_recv() {
        match event {
            QueueEvent::JobQueued { query } if query == "Job1" => saw_queued = true,
            QueueEvent::JobWaiting {
                query, dependency, ..
            } if query == "Job1" => {
                assert_eq!(dependency, "Job0");
                saw_waiting = true;
            }
            QueueEvent::JobResumed { query } if query == "Job1" => saw_resumed = true,
            QueueEvent::JobFinished { job } => finished.push(job.query),
            QueueEvent::Stopped => saw_stopped = true,
            _ => {}
        }
    }
    assert!(saw_queued && saw_waiting && saw_resumed, "lifecycle events missing");
    assert!(finished.contains(&"Job0".to_string()));
    assert!(finished.contains(&"Job1".to_string()));
    assert!(saw_stopped);
}
