use std::collections::{BTreeMap, HashSet};
use std::process::Stdio;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use jobq_core::{
    Channel, ChannelError, FramedReader, FramedWriter, MasterMessage, WorkerId, WorkerInfo,
    WorkerMessage, WorkerStatus, duplex_pair, now_millis,
};

use crate::api::SpawnMode;
use crate::worker::{HEARTBEAT_ENV, WORKER_ID_ENV, run_worker};

/// What the master's multiplexed inbound channel carries per worker.
pub(crate) enum WorkerEvent {
    Message(WorkerMessage),
    Disconnected,
}

pub(crate) struct WorkerEntry {
    pub(crate) worker_id: WorkerId,
    pub(crate) status: WorkerStatus,
    pub(crate) start_time: i64,
    pub(crate) last_seen_wall: i64,
    pub(crate) last_seen: Instant,
    pub(crate) idle_since: Option<Instant>,
    /// Jobs currently assigned or running on the worker. Jobs suspended in
    /// a dependency wait are not in here; that freed capacity is what the
    /// dispatcher hands new work to.
    pub(crate) active: HashSet<String>,
    pub(crate) pid: Option<u32>,
    outbound: mpsc::UnboundedSender<MasterMessage>,
    io_tasks: Vec<JoinHandle<()>>,
    worker_task: Option<JoinHandle<()>>,
    child: Option<tokio::process::Child>,
}

impl WorkerEntry {
    pub(crate) fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.last_seen_wall = now_millis();
    }

    /// Recompute dispatchability after the active set changed.
    pub(crate) fn settle(&mut self) {
        if matches!(self.status, WorkerStatus::Spawned | WorkerStatus::Starting) {
            return;
        }
        if self.active.is_empty() {
            if self.status != WorkerStatus::Ready {
                self.status = WorkerStatus::Ready;
            }
            if self.idle_since.is_none() {
                self.idle_since = Some(Instant::now());
            }
        } else {
            self.status = WorkerStatus::Busy;
            self.idle_since = None;
        }
    }

    pub(crate) fn info(&self) -> WorkerInfo {
        WorkerInfo {
            worker_id: self.worker_id,
            worker_status: self.status,
            start_time: self.start_time,
            last_update_time: self.last_seen_wall,
            pid: self.pid,
            running_jobs: self.active.len(),
        }
    }

    fn shutdown(mut self) {
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
        if let Some(task) = self.worker_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            tokio::spawn(async move {
                let _ = child.kill().await;
            });
        }
    }
}

/// Book-keeps the worker pool: identity, channels, process handles,
/// liveness. All entries are owned by the master loop.
pub(crate) struct WorkerRegistry {
    workers: BTreeMap<WorkerId, WorkerEntry>,
    next_id: u64,
    inbound_tx: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>,
}

impl WorkerRegistry {
    pub(crate) fn new(inbound_tx: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>) -> Self {
        Self {
            workers: BTreeMap::new(),
            next_id: 0,
            inbound_tx,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub(crate) fn ids(&self) -> Vec<WorkerId> {
        self.workers.keys().copied().collect()
    }

    pub(crate) fn get_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerEntry> {
        self.workers.get_mut(&worker_id)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &WorkerEntry> {
        self.workers.values()
    }

    pub(crate) fn infos(&self) -> Vec<WorkerInfo> {
        self.workers.values().map(WorkerEntry::info).collect()
    }

    /// Queue a message for the worker's writer task. Returns `false` if
    /// the worker is unknown or its channel is gone.
    pub(crate) fn send(&self, worker_id: WorkerId, message: MasterMessage) -> bool {
        match self.workers.get(&worker_id) {
            Some(entry) => entry.outbound.send(message).is_ok(),
            None => false,
        }
    }

    /// Oldest-idle worker that can take a job right now.
    pub(crate) fn pick_idle(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|entry| entry.status == WorkerStatus::Ready && entry.active.is_empty())
            .min_by_key(|entry| entry.idle_since)
            .map(|entry| entry.worker_id)
    }

    /// Launch one worker and wire its channel into the inbound mux.
    pub(crate) fn spawn(
        &mut self,
        mode: &SpawnMode,
        heartbeat_interval: std::time::Duration,
    ) -> anyhow::Result<WorkerId> {
        self.next_id += 1;
        let worker_id = WorkerId(self.next_id);

        let (channel, pid, worker_task, child) = match mode {
            SpawnMode::InProcess(executor) => {
                let (master_end, worker_end) = duplex_pair();
                let executor = executor.clone();
                let task = tokio::spawn(async move {
                    if let Err(err) =
                        run_worker(worker_id, worker_end, executor, heartbeat_interval).await
                    {
                        tracing::error!(%worker_id, "worker loop failed: {err:#}");
                    }
                });
                (master_end, None, Some(task), None)
            }
            SpawnMode::Subprocess { program, args } => {
                let mut child = tokio::process::Command::new(program)
                    .args(args)
                    .env(WORKER_ID_ENV, worker_id.0.to_string())
                    .env(HEARTBEAT_ENV, heartbeat_interval.as_millis().to_string())
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("worker child has no stdin"))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| anyhow::anyhow!("worker child has no stdout"))?;
                let pid = child.id();
                let channel = Channel {
                    reader: FramedReader::new(stdout),
                    writer: FramedWriter::new(stdin),
                };
                (channel, pid, None, Some(child))
            }
        };

        let Channel { reader, writer } = channel;
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<MasterMessage>();
        let writer_task = tokio::spawn(pump_outbound(outbound_rx, writer));
        let reader_task = tokio::spawn(pump_inbound(worker_id, reader, self.inbound_tx.clone()));

        let now = now_millis();
        self.workers.insert(
            worker_id,
            WorkerEntry {
                worker_id,
                status: WorkerStatus::Spawned,
                start_time: now,
                last_seen_wall: now,
                last_seen: Instant::now(),
                idle_since: None,
                active: HashSet::new(),
                pid,
                outbound,
                io_tasks: vec![writer_task, reader_task],
                worker_task,
                child,
            },
        );

        Ok(worker_id)
    }

    /// Drop a worker: abort its channel tasks and kill its process. The
    /// caller owns the job-side consequences.
    pub(crate) fn remove(&mut self, worker_id: WorkerId) -> bool {
        match self.workers.remove(&worker_id) {
            Some(entry) => {
                entry.shutdown();
                true
            }
            None => false,
        }
    }

    pub(crate) fn shutdown_all(&mut self) {
        let ids = self.ids();
        for worker_id in ids {
            self.remove(worker_id);
        }
    }
}

async fn pump_outbound(
    mut outbound_rx: mpsc::UnboundedReceiver<MasterMessage>,
    mut writer: FramedWriter,
) {
    while let Some(message) = outbound_rx.recv().await {
        if let Err(err) = writer.send(&message).await {
            tracing::debug!(err = %err, "worker channel write failed");
            break;
        }
    }
}

async fn pump_inbound(
    worker_id: WorkerId,
    mut reader: FramedReader,
    inbound_tx: mpsc::UnboundedSender<(WorkerId, WorkerEvent)>,
) {
    loop {
        match reader.recv::<WorkerMessage>().await {
            Ok(Some(message)) => {
                if inbound_tx
                    .send((worker_id, WorkerEvent::Message(message)))
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                let _ = inbound_tx.send((worker_id, WorkerEvent::Disconnected));
                break;
            }
            Err(ChannelError::Codec(err)) => {
                tracing::warn!(%worker_id, err = %err, "dropping malformed worker frame");
            }
            Err(ChannelError::Io(err)) => {
                tracing::debug!(%worker_id, err = %err, "worker channel read failed");
                let _ = inbound_tx.send((worker_id, WorkerEvent::Disconnected));
                break;
            }
        }
    }
}
