use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use jobq_core::{
    Channel, ChannelError, FramedWriter, JobError, JobInfo, JobStatus, MasterMessage,
    WorkerId, WorkerMessage, stdio_channel,
};

use crate::executor::{Executor, JobContext, lock};

pub(crate) const WORKER_ID_ENV: &str = "JOBQ_WORKER_ID";
pub(crate) const HEARTBEAT_ENV: &str = "JOBQ_HEARTBEAT_MS";

const DEFAULT_HEARTBEAT_MS: u64 = 5_000;

/// Requests flowing from a blocking executor thread into its worker's
/// channel loop.
pub(crate) enum CtxRequest {
    Submit {
        query: String,
    },
    Wait {
        from: String,
        dependency: String,
        reply: std::sync::mpsc::SyncSender<WaitOutcome>,
    },
}

/// How a pending `wait_for` was released.
pub(crate) enum WaitOutcome {
    Terminal(JobInfo),
    Cancelled,
}

struct PendingWait {
    dependency: String,
    reply: std::sync::mpsc::SyncSender<WaitOutcome>,
}

struct HeldJob {
    query: String,
    cancel: Arc<AtomicBool>,
    override_outcome: Arc<std::sync::Mutex<Option<Result<String, JobError>>>>,
    waiting: Option<PendingWait>,
}

struct WorkerState {
    worker_id: WorkerId,
    writer: FramedWriter,
    executor: Arc<dyn Executor>,
    local_jobs: Arc<std::sync::Mutex<HashMap<String, JobInfo>>>,
    ctx_tx: mpsc::UnboundedSender<CtxRequest>,
    done_tx: mpsc::UnboundedSender<(String, Result<String, JobError>)>,
    held: Vec<HeldJob>,
    stopping: bool,
}

/// Whether this process was launched as a queue worker.
pub fn spawned_as_worker() -> bool {
    std::env::var_os(WORKER_ID_ENV).is_some()
}

/// Entry point for a worker subprocess.
///
/// A binary that runs the queue in subprocess mode must call this (after
/// checking [`spawned_as_worker`]) before doing anything else with stdio:
/// stdout carries the message channel back to the master.
pub async fn worker_main(executor: Arc<dyn Executor>) -> anyhow::Result<()> {
    let raw_id = std::env::var(WORKER_ID_ENV)
        .map_err(|_| anyhow::anyhow!("{WORKER_ID_ENV} is not set"))?;
    let worker_id = WorkerId(
        raw_id
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {WORKER_ID_ENV}: {raw_id:?}"))?,
    );
    let heartbeat_ms = std::env::var(HEARTBEAT_ENV)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_HEARTBEAT_MS);

    run_worker(
        worker_id,
        stdio_channel(),
        executor,
        Duration::from_millis(heartbeat_ms.max(1)),
    )
    .await
}

/// The worker loop: announce, initialize, then serve messages until the
/// master says stop or hangs up. Executors run on blocking threads; the
/// loop itself never blocks on anything but its channel.
pub(crate) async fn run_worker(
    worker_id: WorkerId,
    channel: Channel,
    executor: Arc<dyn Executor>,
    heartbeat_interval: Duration,
) -> anyhow::Result<()> {
    let Channel { mut reader, writer } = channel;

    let (ctx_tx, mut ctx_rx) = mpsc::unbounded_channel::<CtxRequest>();
    let (done_tx, mut done_rx) =
        mpsc::unbounded_channel::<(String, Result<String, JobError>)>();

    let mut state = WorkerState {
        worker_id,
        writer,
        executor,
        local_jobs: Arc::new(std::sync::Mutex::new(HashMap::new())),
        ctx_tx,
        done_tx,
        held: Vec::new(),
        stopping: false,
    };

    state.send(WorkerMessage::Starting { worker_id }).await?;
    if let Err(err) = state.executor.initialize() {
        tracing::error!(%worker_id, %err, "executor initialization failed");
        anyhow::bail!("executor initialization failed: {err}");
    }
    state.send(WorkerMessage::Ready { worker_id }).await?;

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            inbound = reader.recv::<MasterMessage>() => match inbound {
                Ok(Some(message)) => state.on_master(message).await?,
                Ok(None) => {
                    tracing::debug!(%worker_id, "master channel closed");
                    break;
                }
                Err(ChannelError::Codec(err)) => {
                    state
                        .send(WorkerMessage::WrongRequest {
                            worker_id,
                            detail: err.to_string(),
                        })
                        .await?;
                }
                Err(err) => return Err(err.into()),
            },
            Some(request) = ctx_rx.recv() => state.on_ctx(request).await?,
            Some((query, outcome)) = done_rx.recv() => state.on_done(query, outcome).await?,
            _ = heartbeat.tick() => state.send(WorkerMessage::Heartbeat { worker_id }).await?,
        }

        if state.stopping && state.held.is_empty() {
            break;
        }
    }

    Ok(())
}

impl WorkerState {
    async fn send(&mut self, message: WorkerMessage) -> Result<(), ChannelError> {
        self.writer.send(&message).await
    }

    fn computing_count(&self) -> usize {
        self.held.iter().filter(|job| job.waiting.is_none()).count()
    }

    async fn on_master(&mut self, message: MasterMessage) -> anyhow::Result<()> {
        match message {
            MasterMessage::SubmitJob { query, .. } => self.on_submit_job(query).await?,
            MasterMessage::JobSnapshot { job, .. } => self.on_snapshot(job).await?,
            MasterMessage::CancelJob { query, .. } => self.on_cancel(query).await?,
            MasterMessage::Ping { .. } => {
                let worker_id = self.worker_id;
                self.send(WorkerMessage::Pong { worker_id }).await?;
            }
            MasterMessage::Stop { .. } => {
                tracing::debug!(worker_id = %self.worker_id, "stop requested");
                self.stopping = true;
            }
        }
        Ok(())
    }

    async fn on_submit_job(&mut self, query: String) -> anyhow::Result<()> {
        let worker_id = self.worker_id;
        let already_held = self.held.iter().any(|job| job.query == query);
        if self.stopping || already_held || self.computing_count() > 0 {
            self.send(WorkerMessage::RejectedJob { worker_id, query })
                .await?;
            return Ok(());
        }

        self.send(WorkerMessage::AcceptedJob {
            worker_id,
            query: query.clone(),
        })
        .await?;

        let cancel = Arc::new(AtomicBool::new(false));
        let override_outcome = Arc::new(std::sync::Mutex::new(None));
        self.held.push(HeldJob {
            query: query.clone(),
            cancel: cancel.clone(),
            override_outcome: override_outcome.clone(),
            waiting: None,
        });

        let ctx = JobContext::new(
            worker_id,
            query.clone(),
            cancel,
            self.local_jobs.clone(),
            override_outcome,
            self.ctx_tx.clone(),
        );
        let executor = self.executor.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let join = tokio::task::spawn_blocking(move || {
                let query = ctx.query().to_string();
                executor.execute(&ctx, &query)
            })
            .await;
            let outcome = join.unwrap_or_else(|err| Err(panic_error(err)));
            let _ = done_tx.send((query, outcome));
        });

        Ok(())
    }

    async fn on_snapshot(&mut self, job: JobInfo) -> anyhow::Result<()> {
        let terminal = job.is_terminal();
        lock(&self.local_jobs).insert(job.query.clone(), job.clone());
        if !terminal {
            return Ok(());
        }

        let worker_id = self.worker_id;
        let mut resumed = Vec::new();
        for held in &mut self.held {
            let waits_on_it = held
                .waiting
                .as_ref()
                .is_some_and(|wait| wait.dependency == job.query);
            if waits_on_it {
                if let Some(wait) = held.waiting.take() {
                    let _ = wait.reply.send(WaitOutcome::Terminal(job.clone()));
                }
                resumed.push(held.query.clone());
            }
        }
        for query in resumed {
            self.send(WorkerMessage::Resuming { worker_id, query }).await?;
        }
        Ok(())
    }

    async fn on_cancel(&mut self, query: String) -> anyhow::Result<()> {
        let worker_id = self.worker_id;
        let Some(held) = self.held.iter_mut().find(|job| job.query == query) else {
            tracing::debug!(%worker_id, %query, "cancel for a job this worker no longer holds");
            return Ok(());
        };

        held.cancel.store(true, Ordering::SeqCst);
        if let Some(wait) = held.waiting.take() {
            let _ = wait.reply.send(WaitOutcome::Cancelled);
            self.send(WorkerMessage::Resuming { worker_id, query }).await?;
        }
        Ok(())
    }

    async fn on_ctx(&mut self, request: CtxRequest) -> anyhow::Result<()> {
        let worker_id = self.worker_id;
        match request {
            CtxRequest::Submit { query } => {
                lock(&self.local_jobs)
                    .entry(query.clone())
                    .or_insert_with(|| JobInfo::new(query.as_str(), JobStatus::Unknown));
                self.send(WorkerMessage::RequestedJob { worker_id, query })
                    .await?;
            }
            CtxRequest::Wait {
                from,
                dependency,
                reply,
            } => {
                // Re-check under the loop; the snapshot may have landed
                // between the executor's fast path and this request.
                let settled = lock(&self.local_jobs)
                    .get(&dependency)
                    .filter(|job| job.is_terminal())
                    .cloned();
                if let Some(info) = settled {
                    let _ = reply.send(WaitOutcome::Terminal(info));
                    return Ok(());
                }

                let Some(held) = self.held.iter_mut().find(|job| job.query == from) else {
                    tracing::warn!(%worker_id, %from, "wait request from a job this worker does not hold");
                    return Ok(());
                };
                held.waiting = Some(PendingWait {
                    dependency: dependency.clone(),
                    reply,
                });

                lock(&self.local_jobs)
                    .entry(dependency.clone())
                    .or_insert_with(|| JobInfo::new(dependency.as_str(), JobStatus::Unknown));
                self.send(WorkerMessage::Waiting {
                    worker_id,
                    query: from,
                    dependency,
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn on_done(
        &mut self,
        query: String,
        outcome: Result<String, JobError>,
    ) -> anyhow::Result<()> {
        let worker_id = self.worker_id;
        let Some(position) = self.held.iter().position(|job| job.query == query) else {
            return Ok(());
        };
        let held = self.held.swap_remove(position);
        let outcome = lock(&held.override_outcome).take().unwrap_or(outcome);

        let mut local = JobInfo::new(query.as_str(), JobStatus::Running);
        match outcome {
            Ok(result) => {
                let _ = local.completed(result.clone());
                lock(&self.local_jobs).insert(query.clone(), local);
                self.send(WorkerMessage::FinishedJob {
                    worker_id,
                    query,
                    result,
                })
                .await?;
            }
            Err(error) => {
                let _ = local.failed(error.clone());
                lock(&self.local_jobs).insert(query.clone(), local);
                self.send(WorkerMessage::FailedJob {
                    worker_id,
                    query,
                    error,
                })
                .await?;
            }
        }
        self.send(WorkerMessage::Ready { worker_id }).await?;
        Ok(())
    }
}

fn panic_error(err: tokio::task::JoinError) -> JobError {
    let detail = if err.is_panic() {
        match err.into_panic().downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => payload
                .downcast::<&str>()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "opaque panic payload".to_string()),
        }
    } else {
        err.to_string()
    };
    JobError::executor(format!("executor panicked: {detail}"))
}
