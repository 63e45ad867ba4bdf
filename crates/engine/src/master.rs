use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use jobq_core::{
    InvalidTransition, JobError, JobInfo, JobStatus, MasterMessage, WorkerId, now_millis,
};

use crate::api::{QueueConfig, QueueError, QueueEvent, QueueHandle, QueueSnapshot};
use crate::registry::{WorkerEvent, WorkerRegistry};

/// How long the master waits for workers to exit on their own during
/// shutdown before killing them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct MasterShared {
    pub(crate) event_tx: broadcast::Sender<QueueEvent>,
}

/// Requests from the embedding API into the master loop.
pub(crate) enum Command {
    Submit {
        query: String,
        reply: oneshot::Sender<bool>,
    },
    Resubmit {
        query: String,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        query: String,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    StartWorkers {
        count: usize,
        reply: oneshot::Sender<usize>,
    },
    StopWorkers {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

pub(crate) fn start_queue(cfg: QueueConfig) -> QueueHandle {
    let (event_tx, _) = broadcast::channel::<QueueEvent>(1024);
    let (snapshot_tx, snapshot_rx) = watch::channel(QueueSnapshot::default());
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<(WorkerId, WorkerEvent)>();

    let shared = Arc::new(MasterShared { event_tx });

    let runtime = MasterRuntime {
        registry: WorkerRegistry::new(inbound_tx),
        cfg,
        jobs: HashMap::new(),
        ready: VecDeque::new(),
        requests: HashMap::new(),
        inbound_rx,
        cmd_rx,
        cmd_closed: false,
        snapshot_tx,
        shared: shared.clone(),
        stopping: false,
        stalled_logged: false,
        dirty: true,
    };
    let join = tokio::spawn(runtime.run());

    QueueHandle {
        cmd_tx,
        snapshot_rx,
        shared,
        join,
    }
}

/// The single authority over all job state. Every mutation happens inside
/// this loop, one message at a time; workers and clients only ever talk
/// to it through channels.
struct MasterRuntime {
    cfg: QueueConfig,

    /// Authoritative job registry, keyed by query.
    jobs: HashMap<String, JobInfo>,
    /// Queries in `Queued` state, dispatch order.
    ready: VecDeque<String>,
    /// Workers to notify per query once it settles.
    requests: HashMap<String, HashSet<WorkerId>>,

    registry: WorkerRegistry,
    inbound_rx: mpsc::UnboundedReceiver<(WorkerId, WorkerEvent)>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_closed: bool,

    snapshot_tx: watch::Sender<QueueSnapshot>,
    shared: Arc<MasterShared>,

    stopping: bool,
    stalled_logged: bool,
    dirty: bool,
}

impl MasterRuntime {
    async fn run(mut self) -> anyhow::Result<()> {
        self.emit(QueueEvent::Started);
        for _ in 0..self.cfg.workers {
            self.spawn_worker();
        }

        let mut tick = tokio::time::interval(self.health_period());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.dispatch();
            if self.stopping && self.drained() {
                break;
            }
            if self.dirty {
                self.push_snapshot();
            }

            tokio::select! {
                command = self.cmd_rx.recv(), if !self.cmd_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        // Every handle is gone; nobody can read results
                        // anymore, so wind the queue down.
                        self.cmd_closed = true;
                        self.begin_stop();
                    }
                },
                inbound = self.inbound_rx.recv() => {
                    if let Some((worker_id, event)) = inbound {
                        self.handle_worker_event(worker_id, event);
                    }
                }
                _ = tick.tick() => self.health_check(),
            }
        }

        self.shutdown_workers().await;
        self.emit(QueueEvent::Stopped);
        self.push_snapshot();
        Ok(())
    }

    fn health_period(&self) -> Duration {
        let mut period = self
            .cfg
            .heartbeat_interval
            .min(self.cfg.dead_worker_timeout / 2);
        if let Some(job_timeout) = self.cfg.job_timeout {
            period = period.min(job_timeout / 2);
        }
        period.max(Duration::from_millis(25))
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    fn warn(&self, message: String) {
        tracing::warn!("{message}");
        self.emit(QueueEvent::Warning { message });
    }

    fn push_snapshot(&mut self) {
        let mut jobs: Vec<JobInfo> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.query.cmp(&b.query))
        });
        let snapshot = QueueSnapshot {
            stopping: self.stopping,
            jobs,
            ready: self.ready.iter().cloned().collect(),
            workers: self.registry.infos(),
        };
        let _ = self.snapshot_tx.send(snapshot);
        self.dirty = false;
    }

    fn spawn_worker(&mut self) -> bool {
        match self
            .registry
            .spawn(&self.cfg.spawn, self.cfg.heartbeat_interval)
        {
            Ok(worker_id) => {
                tracing::info!(%worker_id, "worker spawned");
                self.emit(QueueEvent::WorkerSpawned { worker_id });
                self.stalled_logged = false;
                self.dirty = true;
                true
            }
            Err(err) => {
                self.warn(format!("failed to spawn worker: {err:#}"));
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Client commands

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { query, reply } => {
                let created = if self.stopping {
                    false
                } else {
                    self.submit_job(&query)
                };
                let _ = reply.send(created);
            }
            Command::Resubmit { query, reply } => {
                let _ = reply.send(self.resubmit_job(&query));
            }
            Command::Cancel { query, reply } => {
                let _ = reply.send(self.cancel_job(&query));
            }
            Command::StartWorkers { count, reply } => {
                let mut spawned = 0;
                while self.registry.len() < count && !self.stopping {
                    if !self.spawn_worker() {
                        break;
                    }
                    spawned += 1;
                }
                let _ = reply.send(spawned);
            }
            Command::StopWorkers { reply } => {
                for worker_id in self.registry.ids() {
                    self.evict(worker_id, false);
                }
                let _ = reply.send(());
            }
            Command::Shutdown => self.begin_stop(),
        }
    }

    /// Idempotent submit: unknown queries are enqueued, known ones are
    /// left exactly as they are.
    fn submit_job(&mut self, query: &str) -> bool {
        if self.jobs.contains_key(query) {
            return false;
        }

        if self.stopping {
            // A dependency surfaced mid-shutdown; park it as cancelled so
            // its waiters unblock instead of hanging on a job that will
            // never be dispatched.
            let mut job = JobInfo::new(query, JobStatus::Queued);
            let _ = job.failed(JobError::cancelled("queue is stopping"));
            let snapshot = job.clone();
            self.jobs.insert(query.to_string(), job);
            self.emit(QueueEvent::JobFinished { job: snapshot });
            self.dirty = true;
            return true;
        }

        self.jobs.insert(query.to_string(), JobInfo::queued(query));
        self.ready.push_back(query.to_string());
        self.emit(QueueEvent::JobQueued {
            query: query.to_string(),
        });
        self.dirty = true;
        true
    }

    /// Rebind a settled query to a fresh record and enqueue it again.
    fn resubmit_job(&mut self, query: &str) -> bool {
        if self.stopping {
            return false;
        }
        match self.jobs.get(query) {
            Some(job) if job.is_terminal() => {
                self.jobs
                    .insert(query.to_string(), JobInfo::queued(query));
                self.ready.push_back(query.to_string());
                self.emit(QueueEvent::JobQueued {
                    query: query.to_string(),
                });
                self.dirty = true;
                true
            }
            Some(_) => false,
            None => self.submit_job(query),
        }
    }

    fn cancel_job(&mut self, query: &str) -> Result<(), QueueError> {
        let Some(job) = self.jobs.get(query) else {
            return Err(QueueError::UnknownQuery(query.to_string()));
        };

        match job.status {
            status if status.is_terminal() => Ok(()),
            JobStatus::Queued => {
                self.ready.retain(|queued| queued != query);
                self.fail_job(query, JobError::cancelled("cancelled while queued"));
                Ok(())
            }
            _ => {
                let worker = {
                    let Some(job) = self.jobs.get_mut(query) else {
                        return Ok(());
                    };
                    job.cancel_requested = true;
                    job.message = Some("cancellation requested".to_string());
                    job.worker_id
                };
                if let Some(worker_id) = worker {
                    self.registry.send(
                        worker_id,
                        MasterMessage::CancelJob {
                            worker_id,
                            query: query.to_string(),
                        },
                    );
                }
                self.dirty = true;
                Ok(())
            }
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.emit(QueueEvent::StopRequested);

        let queued: Vec<String> = self.ready.drain(..).collect();
        for query in queued {
            self.fail_job(&query, JobError::cancelled("queue is stopping"));
        }
        self.dirty = true;
    }

    fn drained(&self) -> bool {
        self.ready.is_empty()
            && !self.jobs.values().any(|job| {
                matches!(
                    job.status,
                    JobStatus::Assigned | JobStatus::Running | JobStatus::Waiting
                )
            })
    }

    // ------------------------------------------------------------------
    // Dispatch

    /// Pair ready workers with queued jobs until one side runs out.
    /// FIFO on the queue, oldest-idle worker first.
    fn dispatch(&mut self) {
        if self.stopping {
            return;
        }

        while !self.ready.is_empty() {
            let Some(worker_id) = self.registry.pick_idle() else {
                break;
            };
            let Some(query) = self.ready.pop_front() else {
                break;
            };

            let deadline = self
                .cfg
                .job_timeout
                .map(|timeout| now_millis() + timeout.as_millis() as i64);
            let mut rejected: Option<InvalidTransition> = None;
            match self.jobs.get_mut(&query) {
                None => {
                    tracing::error!(%query, "ready queue entry without a job record");
                    continue;
                }
                Some(job) => {
                    if job.status != JobStatus::Queued {
                        tracing::error!(%query, status = %job.status, "non-queued job in ready queue");
                        continue;
                    }
                    match job.assign_to(worker_id) {
                        Ok(()) => {
                            if job.deadline.is_none() {
                                job.deadline = deadline;
                            }
                        }
                        Err(transition) => rejected = Some(transition),
                    }
                }
            }
            if let Some(transition) = rejected {
                self.invalid_state(&query, transition);
                continue;
            }

            if let Some(entry) = self.registry.get_mut(worker_id) {
                entry.active.insert(query.clone());
                entry.settle();
            }
            self.registry.send(
                worker_id,
                MasterMessage::SubmitJob {
                    worker_id,
                    query: query.clone(),
                },
            );
            self.emit(QueueEvent::JobAssigned { query, worker_id });
            self.dirty = true;
        }
    }

    // ------------------------------------------------------------------
    // Worker protocol

    fn handle_worker_event(&mut self, worker_id: WorkerId, event: WorkerEvent) {
        match event {
            WorkerEvent::Disconnected => {
                if self.stopping {
                    // Expected during drain; anything the worker still
                    // held fails as cancelled inside `evict`.
                    self.evict(worker_id, false);
                } else {
                    self.warn(format!("{worker_id} hung up; evicting"));
                    self.evict(worker_id, true);
                }
            }
            WorkerEvent::Message(message) => {
                let Some(entry) = self.registry.get_mut(worker_id) else {
                    tracing::debug!(%worker_id, "message from an evicted worker");
                    return;
                };
                entry.touch();
                self.handle_worker_message(worker_id, message);
            }
        }
    }

    fn handle_worker_message(&mut self, worker_id: WorkerId, message: jobq_core::WorkerMessage) {
        use jobq_core::WorkerMessage;

        match message {
            WorkerMessage::Starting { .. } => {
                if let Some(entry) = self.registry.get_mut(worker_id) {
                    entry.status = jobq_core::WorkerStatus::Starting;
                    self.dirty = true;
                }
            }
            WorkerMessage::Ready { .. } => self.on_ready(worker_id),
            WorkerMessage::AcceptedJob { query, .. } => self.on_accepted(worker_id, query),
            WorkerMessage::RejectedJob { query, .. } => self.on_rejected(worker_id, query),
            WorkerMessage::Waiting {
                query, dependency, ..
            } => self.on_waiting(worker_id, query, dependency),
            WorkerMessage::Resuming { query, .. } => self.on_resuming(worker_id, query),
            WorkerMessage::RequestedJob { query, .. } => self.on_requested(worker_id, query),
            WorkerMessage::FinishedJob { query, result, .. } => {
                self.on_settled(worker_id, query, Ok(result))
            }
            WorkerMessage::FailedJob { query, error, .. } => {
                self.on_settled(worker_id, query, Err(error))
            }
            WorkerMessage::WrongRequest { detail, .. } => {
                self.warn(format!("{worker_id} could not process a request: {detail}"));
            }
            WorkerMessage::Heartbeat { .. } | WorkerMessage::Pong { .. } => {}
        }
    }

    fn on_ready(&mut self, worker_id: WorkerId) {
        let Some(entry) = self.registry.get_mut(worker_id) else {
            return;
        };
        let first_ready = matches!(
            entry.status,
            jobq_core::WorkerStatus::Spawned | jobq_core::WorkerStatus::Starting
        );
        if entry.active.is_empty() {
            entry.status = jobq_core::WorkerStatus::Ready;
            if entry.idle_since.is_none() {
                entry.idle_since = Some(Instant::now());
            }
        } else {
            entry.status = jobq_core::WorkerStatus::Busy;
        }
        if first_ready {
            self.emit(QueueEvent::WorkerReady { worker_id });
        }
        self.dirty = true;
    }

    fn on_accepted(&mut self, worker_id: WorkerId, query: String) {
        let mut rejected = None;
        match self.jobs.get_mut(&query) {
            Some(job) if job.worker_id == Some(worker_id) && !job.is_terminal() => {
                if job.status != JobStatus::Running {
                    if let Err(transition) = job.running() {
                        rejected = Some(transition);
                    }
                }
            }
            _ => {
                tracing::debug!(%worker_id, %query, "acceptance for a job no longer bound to the worker");
                return;
            }
        }
        if let Some(transition) = rejected {
            self.invalid_state(&query, transition);
        }
        self.dirty = true;
    }

    fn on_rejected(&mut self, worker_id: WorkerId, query: String) {
        if let Some(entry) = self.registry.get_mut(worker_id) {
            entry.active.remove(&query);
            entry.settle();
        }

        if self.stopping {
            self.fail_job(&query, JobError::cancelled("queue is stopping"));
            return;
        }

        let mut rejected = None;
        match self.jobs.get_mut(&query) {
            Some(job) if job.worker_id == Some(worker_id) && job.status == JobStatus::Assigned => {
                match job.returned_to_queue() {
                    // Back to the head: the job did not lose its turn.
                    Ok(()) => self.ready.push_front(query.clone()),
                    Err(transition) => rejected = Some(transition),
                }
            }
            _ => {
                tracing::debug!(%worker_id, %query, "rejection for a job no longer bound to the worker");
                return;
            }
        }
        if let Some(transition) = rejected {
            self.invalid_state(&query, transition);
        }
        self.dirty = true;
    }

    fn on_waiting(&mut self, worker_id: WorkerId, query: String, dependency: String) {
        if !self.jobs.contains_key(&dependency) {
            self.submit_job(&dependency);
        }

        // Register interest before anything can settle the dependency,
        // then hand the worker the current state so an already-terminal
        // dependency unblocks it without another round trip.
        if let Some(dep_job) = self.jobs.get(&dependency).cloned() {
            if !dep_job.is_terminal() {
                self.requests
                    .entry(dependency.clone())
                    .or_default()
                    .insert(worker_id);
            }
            self.registry.send(
                worker_id,
                MasterMessage::JobSnapshot {
                    worker_id,
                    job: dep_job,
                },
            );
        }

        let mut rejected = None;
        match self.jobs.get_mut(&query) {
            Some(job) if job.worker_id == Some(worker_id) && !job.is_terminal() => {
                match job.waiting_on(&dependency) {
                    Ok(()) => self.emit(QueueEvent::JobWaiting {
                        query: query.clone(),
                        dependency: dependency.clone(),
                    }),
                    Err(transition) => rejected = Some(transition),
                }
            }
            _ => {
                tracing::debug!(%worker_id, %query, "wait for a job no longer bound to the worker")
            }
        }
        if let Some(transition) = rejected {
            self.invalid_state(&query, transition);
        }

        // The job no longer occupies its worker; that capacity may serve
        // queued jobs, which is what keeps dependency chains moving.
        if let Some(entry) = self.registry.get_mut(worker_id) {
            entry.active.remove(&query);
            entry.settle();
        }

        self.detect_cycle(&query);
        self.dirty = true;
    }

    fn on_resuming(&mut self, worker_id: WorkerId, query: String) {
        let mut rejected = None;
        match self.jobs.get_mut(&query) {
            Some(job) if job.worker_id == Some(worker_id) && !job.is_terminal() => {
                match job.running() {
                    Ok(()) => {
                        if let Some(entry) = self.registry.get_mut(worker_id) {
                            entry.active.insert(query.clone());
                            entry.settle();
                        }
                        self.emit(QueueEvent::JobResumed {
                            query: query.clone(),
                        });
                    }
                    Err(transition) => rejected = Some(transition),
                }
            }
            _ => {
                // Resumption races with cycle kills and requeues; the
                // worker's terminal report for this job will be ignored
                // the same way.
                tracing::debug!(%worker_id, %query, "resume for a job no longer bound to the worker");
            }
        }
        if let Some(transition) = rejected {
            self.invalid_state(&query, transition);
        }
        self.dirty = true;
    }

    fn on_requested(&mut self, worker_id: WorkerId, query: String) {
        if !self.jobs.contains_key(&query) {
            self.submit_job(&query);
        }
        if let Some(job) = self.jobs.get(&query).cloned() {
            if !job.is_terminal() {
                self.requests
                    .entry(query.clone())
                    .or_default()
                    .insert(worker_id);
            }
            self.registry
                .send(worker_id, MasterMessage::JobSnapshot { worker_id, job });
        }
        self.dirty = true;
    }

    /// Terminal report from a worker, success or failure.
    fn on_settled(
        &mut self,
        worker_id: WorkerId,
        query: String,
        outcome: Result<String, JobError>,
    ) {
        if let Some(entry) = self.registry.get_mut(worker_id) {
            entry.active.remove(&query);
            entry.settle();
        }

        let mut rejected = None;
        let mut settled = None;
        match self.jobs.get_mut(&query) {
            Some(job) if job.worker_id == Some(worker_id) && !job.is_terminal() => {
                let transition = match outcome {
                    Ok(result) => job.completed(result),
                    Err(error) => job.failed(error),
                };
                match transition {
                    Ok(()) => settled = Some(job.clone()),
                    Err(transition) => rejected = Some(transition),
                }
            }
            _ => {
                tracing::debug!(%worker_id, %query, "terminal report for a job no longer bound to the worker");
                self.dirty = true;
                return;
            }
        }
        if let Some(transition) = rejected {
            self.invalid_state(&query, transition);
        }
        if let Some(job) = settled {
            self.notify_waiters(&query);
            self.emit(QueueEvent::JobFinished { job });
        }
        self.dirty = true;
    }

    // ------------------------------------------------------------------
    // Terminal bookkeeping

    /// Push the job's terminal record to every worker registered for it.
    fn notify_waiters(&mut self, query: &str) {
        let Some(job) = self.jobs.get(query) else {
            return;
        };
        if !job.is_terminal() {
            return;
        }
        let Some(waiters) = self.requests.remove(query) else {
            return;
        };
        let job = job.clone();
        for waiter in waiters {
            self.registry.send(
                waiter,
                MasterMessage::JobSnapshot {
                    worker_id: waiter,
                    job: job.clone(),
                },
            );
        }
    }

    /// Fail a non-terminal job and flush its waiters.
    fn fail_job(&mut self, query: &str, error: JobError) {
        let settled = match self.jobs.get_mut(query) {
            Some(job) if !job.is_terminal() => match job.failed(error) {
                Ok(()) => Some(job.clone()),
                Err(transition) => {
                    tracing::error!(%query, %transition, "failed to fail a job");
                    None
                }
            },
            _ => None,
        };
        if let Some(job) = settled {
            self.ready.retain(|queued| queued != query);
            self.notify_waiters(query);
            self.emit(QueueEvent::JobFinished { job });
            self.dirty = true;
        }
    }

    /// A guarded transition was refused: surface the bug as a distinct
    /// failure on the job instead of corrupting the registry.
    fn invalid_state(&mut self, query: &str, transition: InvalidTransition) {
        tracing::error!(%query, %transition, "illegal job transition");
        self.fail_job(query, JobError::invalid_state(transition.to_string()));
    }

    /// Walk the dependency edges among waiting jobs starting at `query`;
    /// if they loop back, fail every job on the loop.
    fn detect_cycle(&mut self, query: &str) {
        let mut members = vec![query.to_string()];
        let mut cursor = match self.jobs.get(query).and_then(|job| job.dependency.clone()) {
            Some(dependency) => dependency,
            None => return,
        };

        loop {
            if cursor == query {
                self.fail_cycle(members);
                return;
            }
            if members.contains(&cursor) {
                return;
            }
            match self.jobs.get(&cursor) {
                Some(job) if job.status == JobStatus::Waiting => {
                    members.push(cursor.clone());
                    match job.dependency.clone() {
                        Some(next) => cursor = next,
                        None => return,
                    }
                }
                _ => return,
            }
        }
    }

    fn fail_cycle(&mut self, members: Vec<String>) {
        let description = format!("{} -> {}", members.join(" -> "), members[0]);
        tracing::warn!(cycle = %description, "dependency cycle detected");
        for query in members {
            self.fail_job(
                &query,
                JobError::dependency_cycle(format!("dependency cycle: {description}")),
            );
        }
    }

    // ------------------------------------------------------------------
    // Worker lifecycle

    /// Remove a worker and deal with everything it held. `count_crash`
    /// distinguishes death (counts against the requeue cap) from an
    /// operator-driven stop.
    fn evict(&mut self, worker_id: WorkerId, count_crash: bool) {
        if !self.registry.remove(worker_id) {
            return;
        }

        for waiters in self.requests.values_mut() {
            waiters.remove(&worker_id);
        }
        self.requests.retain(|_, waiters| !waiters.is_empty());

        let held: Vec<String> = self
            .jobs
            .values()
            .filter(|job| {
                job.worker_id == Some(worker_id)
                    && matches!(
                        job.status,
                        JobStatus::Assigned | JobStatus::Running | JobStatus::Waiting
                    )
            })
            .map(|job| job.query.clone())
            .collect();
        for query in held {
            self.requeue_or_fail(&query, worker_id, count_crash);
        }

        self.emit(QueueEvent::WorkerEvicted { worker_id });
        self.dirty = true;
    }

    /// Return a job held by a lost worker to the queue tail, unless its
    /// requeue budget is spent, in which case it fails for good. Waiter
    /// registrations for the job survive either way.
    fn requeue_or_fail(&mut self, query: &str, lost_worker: WorkerId, count_crash: bool) {
        if self.stopping {
            // Nothing will be dispatched anymore; settle the job so the
            // drain can finish and its waiters unblock.
            self.fail_job(query, JobError::cancelled("queue is stopping"));
            return;
        }

        if count_crash {
            let spent = self
                .jobs
                .get(query)
                .is_some_and(|job| job.requeue_count >= self.cfg.max_requeues);
            if spent {
                self.fail_job(
                    query,
                    JobError::worker_crash(format!(
                        "lost {lost_worker} after {} requeues",
                        self.cfg.max_requeues
                    )),
                );
                return;
            }
        }

        let mut rejected = None;
        match self.jobs.get_mut(query) {
            None => return,
            Some(job) => {
                let transition = if count_crash {
                    job.requeued_after_crash()
                } else {
                    job.returned_to_queue()
                };
                match transition {
                    Ok(()) => {
                        if count_crash {
                            job.message = Some(format!(
                                "requeued after losing {lost_worker} ({}/{})",
                                job.requeue_count, self.cfg.max_requeues
                            ));
                        }
                    }
                    Err(transition) => rejected = Some(transition),
                }
            }
        }
        if let Some(transition) = rejected {
            self.invalid_state(query, transition);
            return;
        }

        self.ready.push_back(query.to_string());
        self.emit(QueueEvent::JobQueued {
            query: query.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Health monitoring

    fn health_check(&mut self) {
        let now = Instant::now();
        let dead: Vec<WorkerId> = self
            .registry
            .entries()
            .filter(|entry| now.duration_since(entry.last_seen) > self.cfg.dead_worker_timeout)
            .map(|entry| entry.worker_id)
            .collect();
        for worker_id in dead {
            self.warn(format!("{worker_id} missed heartbeats; evicting"));
            self.evict(worker_id, true);
        }

        if self.cfg.job_timeout.is_some() {
            let now = now_millis();
            let expired: Vec<String> = self
                .jobs
                .values()
                .filter(|job| {
                    matches!(
                        job.status,
                        JobStatus::Assigned | JobStatus::Running | JobStatus::Waiting
                    ) && !job.cancel_requested
                        && job.deadline.is_some_and(|deadline| now >= deadline)
                })
                .map(|job| job.query.clone())
                .collect();
            for query in expired {
                self.warn(format!("job {query} exceeded its timeout; cancelling"));
                let _ = self.cancel_job(&query);
            }
        }

        if self.registry.is_empty() && !self.ready.is_empty() && !self.stalled_logged {
            tracing::error!(
                queued = self.ready.len(),
                "all workers lost with jobs still queued; start workers to resume"
            );
            self.emit(QueueEvent::Warning {
                message: format!(
                    "all workers lost with {} job(s) still queued",
                    self.ready.len()
                ),
            });
            self.stalled_logged = true;
        }
    }

    // ------------------------------------------------------------------
    // Shutdown

    async fn shutdown_workers(&mut self) {
        for worker_id in self.registry.ids() {
            self.registry
                .send(worker_id, MasterMessage::Stop { worker_id });
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.registry.is_empty() {
            match tokio::time::timeout_at(deadline, self.inbound_rx.recv()).await {
                Ok(Some((worker_id, WorkerEvent::Disconnected))) => {
                    self.registry.remove(worker_id);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        self.registry.shutdown_all();
    }
}
