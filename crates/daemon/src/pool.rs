//! Worker pool manager.
//!
//! Supervises a bounded set of worker processes. Jobs go to an idle worker,
//! to a freshly spawned one while below the limit, or to a FIFO pending list.
//! Worker reports are forwarded into the [`JobQueue`]. A worker that exits
//! while holding a job fails that job, and a replacement is spawned after a
//! fixed delay by a separately scheduled task.

use crate::concurrency::ConcurrencyPlan;
use crate::config::PoolConfig;
use crate::jobs::{current_timestamp_ms, JobStatus, StatusPatch};
use crate::protocol::{decode_line, encode_line, EncodeJob, MainMessage, WorkerEvent, WorkerMessage};
use crate::queue::JobQueue;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Reason recorded on jobs still pending or running at shutdown.
pub const SHUTDOWN_REASON: &str = "service shutting down";

/// Longest accepted IPC line.
const MAX_IPC_LINE: usize = 1024 * 1024;

/// Error type for pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),

    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub description: String,
}

impl WorkerExit {
    fn unknown() -> Self {
        Self {
            code: None,
            description: "exit status unavailable".to_string(),
        }
    }
}

/// Channels connecting the pool to one launched worker
pub struct WorkerLink {
    pub pid: Option<u32>,
    pub commands: mpsc::UnboundedSender<MainMessage>,
    pub events: mpsc::UnboundedReceiver<WorkerMessage>,
    /// Resolves once the worker is gone. Must resolve after `events` closes.
    pub exited: oneshot::Receiver<WorkerExit>,
    /// Firing (or dropping) this force-kills the worker.
    pub kill: oneshot::Sender<()>,
}

/// Starts worker processes
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, worker_id: usize) -> io::Result<WorkerLink>;
}

/// Launches workers as `<program> worker --worker-id N [--config path]`
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, config_path: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path,
        }
    }

    /// Launcher that re-executes the running binary
    pub fn current_exe(config_path: Option<PathBuf>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path))
    }

    pub fn command(&self, worker_id: usize) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg("worker")
            .arg("--worker-id")
            .arg(worker_id.to_string());
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, worker_id: usize) -> io::Result<WorkerLink> {
        let mut child = self.command(worker_id).spawn()?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("worker stdout not captured"))?;

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<MainMessage>();
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut sink = FramedWrite::new(stdin, LinesCodec::new());
            while let Some(msg) = cmd_rx.recv().await {
                let line = match encode_line(&msg) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(worker_id, error = %e, "failed to encode command");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    tracing::debug!(worker_id, error = %e, "worker stdin closed");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_IPC_LINE));
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => match decode_line::<WorkerMessage>(&line) {
                        Ok(msg) => {
                            if evt_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(worker_id, error = %e, "unparseable worker message")
                        }
                    },
                    Err(e) => {
                        tracing::warn!(worker_id, error = %e, "worker output unreadable");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let finished = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match finished {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let exit = match status {
                Ok(status) => WorkerExit {
                    code: status.code(),
                    description: status.to_string(),
                },
                Err(e) => WorkerExit {
                    code: None,
                    description: e.to_string(),
                },
            };
            let _ = exit_tx.send(exit);
        });

        Ok(WorkerLink {
            pid,
            commands: cmd_tx,
            events: evt_rx,
            exited: exit_rx,
            kill: kill_tx,
        })
    }
}

/// Pool tuning
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub restart_delay: Duration,
    pub shutdown_grace: Duration,
    pub heartbeat_timeout: Duration,
}

impl PoolSettings {
    pub fn from_config(cfg: &PoolConfig, plan: &ConcurrencyPlan) -> Self {
        Self {
            max_workers: plan.max_workers.max(1) as usize,
            restart_delay: Duration::from_millis(cfg.restart_delay_ms),
            shutdown_grace: Duration::from_millis(cfg.shutdown_grace_ms),
            heartbeat_timeout: Duration::from_millis(cfg.heartbeat_timeout_ms),
        }
    }
}

struct WorkerInfo {
    worker_id: usize,
    pid: Option<u32>,
    commands: mpsc::UnboundedSender<MainMessage>,
    kill: Option<oneshot::Sender<()>>,
    current_job_id: Option<String>,
    started_at: i64,
    last_seen: Instant,
    memory_usage: u64,
    is_healthy: bool,
    jobs_completed: u64,
}

impl WorkerInfo {
    fn is_idle(&self) -> bool {
        self.current_job_id.is_none() && self.is_healthy
    }

    fn force_kill(&mut self) {
        self.is_healthy = false;
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id,
            pid: self.pid,
            current_job_id: self.current_job_id.clone(),
            started_at: self.started_at,
            memory_usage: self.memory_usage,
            is_healthy: self.is_healthy,
            jobs_completed: self.jobs_completed,
        }
    }
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<usize, WorkerInfo>,
    pending: VecDeque<EncodeJob>,
    next_worker_id: usize,
    shutting_down: bool,
    restarts: u64,
    memory_warnings: u64,
}

impl PoolState {
    fn idle_worker(&self) -> Option<usize> {
        self.workers
            .values()
            .filter(|w| w.is_idle())
            .map(|w| w.worker_id)
            .min()
    }
}

/// Where a submitted job went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Assigned { worker_id: usize },
    Pending { position: usize },
}

/// What cancelling did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    RemovedFromPending,
    SignalledWorker { worker_id: usize },
    NotFound,
}

/// Per-worker view for the stats endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub worker_id: usize,
    pub pid: Option<u32>,
    pub current_job_id: Option<String>,
    pub started_at: i64,
    pub memory_usage: u64,
    pub is_healthy: bool,
    pub jobs_completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub max_workers: usize,
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub pending_jobs: usize,
    pub restarts: u64,
    pub memory_warnings: u64,
    pub shutting_down: bool,
    pub workers: Vec<WorkerSnapshot>,
}

struct PoolInner {
    settings: PoolSettings,
    launcher: Arc<dyn WorkerLauncher>,
    queue: Arc<JobQueue>,
    state: Mutex<PoolState>,
    all_exited: Notify,
}

/// Handle to the worker pool; clones share the same pool
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        settings: PoolSettings,
        launcher: Arc<dyn WorkerLauncher>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                settings,
                launcher,
                queue,
                state: Mutex::new(PoolState::default()),
                all_exited: Notify::new(),
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Pre-spawn one worker so the first job starts without launch latency.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock().await;
        if state.workers.is_empty() {
            self.spawn_worker(&mut state)?;
        }
        Ok(())
    }

    fn spawn_worker(&self, state: &mut PoolState) -> Result<usize, PoolError> {
        let worker_id = state.next_worker_id;
        state.next_worker_id += 1;

        let link = self.inner.launcher.launch(worker_id)?;
        tracing::info!(worker_id, pid = ?link.pid, "worker spawned");

        state.workers.insert(
            worker_id,
            WorkerInfo {
                worker_id,
                pid: link.pid,
                commands: link.commands,
                kill: Some(link.kill),
                current_job_id: None,
                started_at: current_timestamp_ms(),
                last_seen: Instant::now(),
                memory_usage: 0,
                is_healthy: true,
                jobs_completed: 0,
            },
        );

        tokio::spawn(self.clone().monitor(worker_id, link.events, link.exited));
        Ok(worker_id)
    }

    /// Hand a job to a worker. On a dead command channel the job goes back
    /// to the front of the pending list.
    fn assign(&self, state: &mut PoolState, worker_id: usize, job: EncodeJob) -> bool {
        let Some(worker) = state.workers.get_mut(&worker_id) else {
            state.pending.push_front(job);
            return false;
        };

        let job_id = job.job_id.clone();
        if worker.commands.send(MainMessage::StartJob { job: job.clone() }).is_err() {
            tracing::warn!(worker_id, job_id = %job_id, "worker gone before assignment");
            worker.is_healthy = false;
            state.pending.push_front(job);
            return false;
        }

        worker.current_job_id = Some(job_id.clone());
        worker.last_seen = Instant::now();
        tracing::info!(worker_id, job_id = %job_id, "job assigned");
        true
    }

    /// Give pending jobs to idle workers, oldest first.
    fn drain_pending(&self, state: &mut PoolState) {
        while !state.pending.is_empty() {
            let Some(worker_id) = state.idle_worker() else {
                break;
            };
            let Some(job) = state.pending.pop_front() else {
                break;
            };
            self.assign(state, worker_id, job);
        }
    }

    /// Submit a queued job. Never waits for a worker.
    pub async fn submit_job(&self, job: EncodeJob) -> Result<SubmitOutcome, PoolError> {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return Err(PoolError::ShuttingDown);
        }

        if let Some(worker_id) = state.idle_worker() {
            if self.assign(&mut state, worker_id, job.clone()) {
                return Ok(SubmitOutcome::Assigned { worker_id });
            }
            // assign() re-queued it at the front
            state.pending.pop_front();
        }

        if state.workers.len() < self.inner.settings.max_workers {
            let worker_id = self.spawn_worker(&mut state)?;
            if self.assign(&mut state, worker_id, job) {
                return Ok(SubmitOutcome::Assigned { worker_id });
            }
            return Ok(SubmitOutcome::Pending {
                position: state.pending.len(),
            });
        }

        tracing::debug!(job_id = %job.job_id, "all workers busy, job pending");
        state.pending.push_back(job);
        Ok(SubmitOutcome::Pending {
            position: state.pending.len(),
        })
    }

    async fn monitor(
        self,
        worker_id: usize,
        mut events: mpsc::UnboundedReceiver<WorkerMessage>,
        exited: oneshot::Receiver<WorkerExit>,
    ) {
        while let Some(msg) = events.recv().await {
            self.handle_message(worker_id, msg).await;
        }
        let exit = exited.await.unwrap_or_else(|_| WorkerExit::unknown());
        self.handle_exit(worker_id, exit).await;
    }

    async fn handle_message(&self, worker_id: usize, msg: WorkerMessage) {
        {
            let mut state = self.inner.state.lock().await;
            let shutting_down = state.shutting_down;
            let mut memory_warning = false;

            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.last_seen = Instant::now();

                match &msg.event {
                    WorkerEvent::MemoryWarning { job_id, memory_usage } => {
                        worker.memory_usage = *memory_usage;
                        memory_warning = true;
                        tracing::warn!(worker_id, job_id = %job_id, memory_usage, "worker memory warning");
                    }
                    event if event.ends_job() => {
                        if worker.current_job_id.as_deref() == Some(event.job_id()) {
                            worker.current_job_id = None;
                            if matches!(event, WorkerEvent::Complete { .. }) {
                                worker.jobs_completed += 1;
                            }
                        }
                    }
                    _ => {}
                }
            }

            if memory_warning {
                state.memory_warnings += 1;
            }
            if msg.event.ends_job() && !shutting_down {
                self.drain_pending(&mut state);
            }
        }

        if let Err(e) = self.inner.queue.apply_worker_event(&msg.event).await {
            tracing::debug!(worker_id, error = %e, "worker event for unknown job");
        }
    }

    async fn handle_exit(&self, worker_id: usize, exit: WorkerExit) {
        let (orphaned, shutting_down) = {
            let mut state = self.inner.state.lock().await;
            let worker = state.workers.remove(&worker_id);
            let orphaned = worker.and_then(|w| w.current_job_id);
            if state.workers.is_empty() {
                self.inner.all_exited.notify_waiters();
            }
            (orphaned, state.shutting_down)
        };

        if shutting_down {
            tracing::info!(worker_id, status = %exit.description, "worker exited");
        } else {
            tracing::warn!(worker_id, status = %exit.description, job_id = ?orphaned, "worker exited unexpectedly");
        }

        if let Some(job_id) = orphaned {
            let event = WorkerEvent::Error {
                job_id,
                error: format!("worker {} crashed ({})", worker_id, exit.description),
            };
            if let Err(e) = self.inner.queue.apply_worker_event(&event).await {
                tracing::debug!(worker_id, error = %e, "crashed worker held unknown job");
            }
        }

        if !shutting_down {
            self.schedule_respawn();
        }
    }

    /// Spawn a replacement after the restart delay, from a separate task.
    fn schedule_respawn(&self) {
        let pool = self.clone();
        let delay = self.inner.settings.restart_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.respawn().await;
        });
    }

    async fn respawn(&self) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down || state.workers.len() >= self.inner.settings.max_workers {
            return;
        }

        match self.spawn_worker(&mut state) {
            Ok(worker_id) => {
                state.restarts += 1;
                tracing::info!(worker_id, "replacement worker started");
                self.drain_pending(&mut state);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to respawn worker");
                if state.workers.is_empty() {
                    self.schedule_respawn();
                }
            }
        }
    }

    /// Kill busy workers that have been silent longer than the heartbeat
    /// timeout. Their exit then fails the job and schedules a replacement.
    pub async fn check_heartbeats(&self) -> usize {
        let timeout = self.inner.settings.heartbeat_timeout;
        let mut state = self.inner.state.lock().await;
        let mut killed = 0;

        for worker in state.workers.values_mut() {
            if worker.is_healthy
                && worker.current_job_id.is_some()
                && worker.last_seen.elapsed() > timeout
            {
                tracing::warn!(
                    worker_id = worker.worker_id,
                    job_id = ?worker.current_job_id,
                    "worker missed heartbeats, killing"
                );
                worker.force_kill();
                killed += 1;
            }
        }

        killed
    }

    /// Whether the job is waiting in the pool or held by a worker.
    pub async fn holds_job(&self, job_id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state.pending.iter().any(|j| j.job_id == job_id)
            || state
                .workers
                .values()
                .any(|w| w.current_job_id.as_deref() == Some(job_id))
    }

    /// Cancel a job wherever it is in the pool.
    pub async fn cancel_job(&self, job_id: &str) -> CancelOutcome {
        let mut state = self.inner.state.lock().await;

        if let Some(pos) = state.pending.iter().position(|j| j.job_id == job_id) {
            state.pending.remove(pos);
            tracing::info!(job_id, "pending job cancelled");
            return CancelOutcome::RemovedFromPending;
        }

        let holder = state
            .workers
            .values()
            .find(|w| w.current_job_id.as_deref() == Some(job_id))
            .map(|w| (w.worker_id, w.commands.clone()));

        match holder {
            Some((worker_id, commands)) => {
                if commands.send(MainMessage::CancelJob).is_err() {
                    tracing::warn!(worker_id, job_id, "cancel could not reach worker");
                }
                tracing::info!(worker_id, job_id, "cancel sent to worker");
                CancelOutcome::SignalledWorker { worker_id }
            }
            None => CancelOutcome::NotFound,
        }
    }

    /// Stop every worker.
    ///
    /// Pending and in-flight jobs are failed, workers get `SHUTDOWN`, and
    /// any still alive after the grace period are killed. No respawns happen
    /// afterwards.
    pub async fn shutdown(&self) {
        let (orphaned, has_workers) = {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;

            let mut orphaned: Vec<String> =
                state.pending.drain(..).map(|job| job.job_id).collect();
            for worker in state.workers.values() {
                if let Some(job_id) = &worker.current_job_id {
                    orphaned.push(job_id.clone());
                }
                let _ = worker.commands.send(MainMessage::Shutdown);
            }
            (orphaned, !state.workers.is_empty())
        };

        for job_id in &orphaned {
            let _ = self
                .inner
                .queue
                .update_job_status(job_id, JobStatus::Failed, StatusPatch::error(SHUTDOWN_REASON))
                .await;
        }

        if !has_workers {
            return;
        }

        let wait_all = async {
            loop {
                let notified = self.inner.all_exited.notified();
                if self.inner.state.lock().await.workers.is_empty() {
                    break;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(self.inner.settings.shutdown_grace, wait_all)
            .await
            .is_err()
        {
            let mut state = self.inner.state.lock().await;
            for worker in state.workers.values_mut() {
                tracing::warn!(worker_id = worker.worker_id, "worker ignored shutdown, killing");
                worker.force_kill();
            }
        }

        tracing::info!("worker pool stopped");
    }

    pub async fn get_stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let mut workers: Vec<WorkerSnapshot> =
            state.workers.values().map(WorkerInfo::snapshot).collect();
        workers.sort_by_key(|w| w.worker_id);

        let busy = workers.iter().filter(|w| w.current_job_id.is_some()).count();
        let idle = state.workers.values().filter(|w| w.is_idle()).count();

        PoolStats {
            max_workers: self.inner.settings.max_workers,
            total_workers: workers.len(),
            busy_workers: busy,
            idle_workers: idle,
            pending_jobs: state.pending.len(),
            restarts: state.restarts,
            memory_warnings: state.memory_warnings,
            shutting_down: state.shutting_down,
            workers,
        }
    }
}
