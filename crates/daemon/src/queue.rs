//! Job queue: the single owner of render job state.
//!
//! Every mutation of a `RenderJob` goes through here, so status updates for
//! one job are totally ordered. Subscribers receive the current snapshot
//! followed by every change, and their stream ends after the terminal update.

use crate::jobs::{save_job, FrameManifest, JobConfig, JobProgress, JobStatus, RenderJob, StatusPatch};
use crate::protocol::WorkerEvent;
use crate::session::SessionStore;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

/// Reason recorded on jobs found unfinished at startup.
pub const INTERRUPTED_REASON: &str = "interrupted by service restart";

/// Error type for queue operations
#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        expected: &'static str,
    },

    #[error("job {job_id} has {received} of {expected} frames")]
    FrameCountMismatch {
        job_id: String,
        expected: u64,
        received: u64,
    },

    #[error("job {0} has no total frame count")]
    TotalFramesUnset(String),
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub uploading: usize,
    pub queued: usize,
    pub encoding: usize,
    pub complete: usize,
    pub failed: usize,
    pub total: usize,
}

/// Live updates for one job. Dropping it unsubscribes.
#[derive(Debug)]
pub struct JobSubscription {
    rx: mpsc::UnboundedReceiver<JobProgress>,
}

impl JobSubscription {
    /// Next update, or None once the job has reached a terminal status.
    pub async fn recv(&mut self) -> Option<JobProgress> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = JobProgress> + Send + 'static {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        })
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, RenderJob>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<JobProgress>>>,
}

impl QueueState {
    fn job_mut(&mut self, job_id: &str) -> Result<&mut RenderJob, QueueError> {
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))
    }

    /// Send a snapshot to every live subscriber; drop them after a terminal one.
    fn publish(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        let snapshot = job.to_progress();
        let terminal = job.is_terminal();

        if terminal {
            if let Some(subs) = self.subscribers.remove(job_id) {
                for tx in subs {
                    let _ = tx.send(snapshot.clone());
                }
            }
        } else if let Some(subs) = self.subscribers.get_mut(job_id) {
            subs.retain(|tx| tx.send(snapshot.clone()).is_ok());
        }
    }
}

/// Snapshot of a job record taken under the state lock, written after it
/// is released.
struct RecordWrite {
    dir: PathBuf,
    job: RenderJob,
    revision: u64,
}

/// Owner of all render jobs
pub struct JobQueue {
    state: RwLock<QueueState>,
    store: Option<SessionStore>,
    revision: AtomicU64,
    /// Newest revision on disk per job; older snapshots never overwrite it.
    written: Arc<Mutex<HashMap<String, u64>>>,
}

impl JobQueue {
    /// Queue that persists job records into session directories.
    pub fn new(store: SessionStore) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            store: Some(store),
            revision: AtomicU64::new(0),
            written: Arc::default(),
        }
    }

    /// Queue that keeps jobs in memory only.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            store: None,
            revision: AtomicU64::new(0),
            written: Arc::default(),
        }
    }

    /// Snapshot a record for writing. Must be called with the state lock
    /// held so revisions follow the order of changes.
    fn record(&self, job: &RenderJob) -> Option<RecordWrite> {
        let store = self.store.as_ref()?;
        Some(RecordWrite {
            dir: store.dir(&job.session_id),
            job: job.clone(),
            revision: self.revision.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    /// Write snapshots to disk on the blocking pool.
    async fn persist(&self, writes: Vec<RecordWrite>) {
        if writes.is_empty() {
            return;
        }
        let written = self.written.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut written = written.lock().unwrap_or_else(PoisonError::into_inner);
            for write in writes {
                let job_id = &write.job.job_id;
                if written.get(job_id).is_some_and(|r| *r >= write.revision) {
                    continue;
                }
                // A removed session stays removed
                if !write.dir.is_dir() {
                    continue;
                }
                match save_job(&write.job, &write.dir) {
                    Ok(()) => {
                        written.insert(job_id.clone(), write.revision);
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "failed to persist job record")
                    }
                }
            }
        })
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "job record writer failed");
        }
    }

    /// Create a pending job for a session.
    pub async fn create_job(&self, session_id: &str, config: JobConfig) -> RenderJob {
        let job = RenderJob::new(session_id, config);

        let write = {
            let mut state = self.state.write().await;
            state.jobs.insert(job.job_id.clone(), job.clone());
            self.record(&job)
        };
        self.persist(write.into_iter().collect()).await;

        tracing::debug!(job_id = %job.job_id, session_id, "job created");
        job
    }

    /// Record how many frames the job will have.
    pub async fn set_total_frames(&self, job_id: &str, total: u64) -> Result<JobProgress, QueueError> {
        let mut state = self.state.write().await;
        let job = state.job_mut(job_id)?;

        if !matches!(job.status, JobStatus::Pending | JobStatus::Uploading) {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                expected: "pending or uploading",
            });
        }

        job.frame_manifest.total_frames = Some(total);
        job.touch();
        let snapshot = job.to_progress();
        state.publish(job_id);
        Ok(snapshot)
    }

    /// Count newly stored frames. The first registration moves the job to
    /// `uploading`; counts only ever add up.
    ///
    /// Records are written on status changes only, so later chunks touch
    /// memory alone.
    pub async fn register_frames(
        &self,
        job_id: &str,
        count: u64,
        checksums: BTreeMap<u64, String>,
    ) -> Result<JobProgress, QueueError> {
        let mut state = self.state.write().await;
        let job = state.job_mut(job_id)?;

        if !matches!(job.status, JobStatus::Pending | JobStatus::Uploading) {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                expected: "pending or uploading",
            });
        }

        let first = job.status == JobStatus::Pending;
        job.status = JobStatus::Uploading;
        let manifest: &mut FrameManifest = &mut job.frame_manifest;
        manifest.received_frames += count;
        manifest.checksums.extend(checksums);
        job.touch();

        let snapshot = job.to_progress();
        let write = if first { self.record(job) } else { None };
        state.publish(job_id);
        drop(state);

        self.persist(write.into_iter().collect()).await;
        Ok(snapshot)
    }

    /// Move an uploaded job to `queued`.
    ///
    /// Fails unless the job is uploading and has received at least as many
    /// frames as it expects.
    pub async fn queue_job(&self, job_id: &str) -> Result<RenderJob, QueueError> {
        let mut state = self.state.write().await;
        let job = state.job_mut(job_id)?;

        if job.status != JobStatus::Uploading {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                expected: "uploading",
            });
        }

        let total = job
            .frame_manifest
            .total_frames
            .ok_or_else(|| QueueError::TotalFramesUnset(job_id.to_string()))?;
        let received = job.frame_manifest.received_frames;
        if total == 0 || received < total {
            return Err(QueueError::FrameCountMismatch {
                job_id: job_id.to_string(),
                expected: total,
                received,
            });
        }

        job.apply(JobStatus::Queued, StatusPatch::default());
        let queued = job.clone();
        let write = self.record(&queued);
        state.publish(job_id);
        drop(state);

        self.persist(write.into_iter().collect()).await;
        tracing::info!(job_id, total_frames = total, "job queued");
        Ok(queued)
    }

    pub async fn get_job(&self, job_id: &str) -> Option<RenderJob> {
        self.state.read().await.jobs.get(job_id).cloned()
    }

    /// Most recently created job for a session.
    pub async fn find_by_session(&self, session_id: &str) -> Option<RenderJob> {
        self.state
            .read()
            .await
            .jobs
            .values()
            .filter(|job| job.session_id == session_id)
            .max_by_key(|job| job.created_at)
            .cloned()
    }

    pub async fn list_jobs(&self) -> Vec<RenderJob> {
        self.state.read().await.jobs.values().cloned().collect()
    }

    /// Apply a status change. Returns Ok(false) when the change is not a
    /// legal transition (for example progress after a cancel).
    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        patch: StatusPatch,
    ) -> Result<bool, QueueError> {
        let mut state = self.state.write().await;
        let job = state.job_mut(job_id)?;

        let previous = job.status;
        if !job.apply(status, patch) {
            tracing::debug!(job_id, from = %previous, to = %status, "ignoring status update");
            return Ok(false);
        }

        let mut write = None;
        if previous != job.status {
            if job.status == JobStatus::Failed {
                tracing::warn!(job_id, error = ?job.last_error, "job failed");
            } else {
                tracing::info!(job_id, status = %job.status, "job status changed");
            }
            write = self.record(job);
        }

        state.publish(job_id);
        drop(state);

        self.persist(write.into_iter().collect()).await;
        Ok(true)
    }

    /// Fold a worker report into the job it concerns.
    pub async fn apply_worker_event(&self, event: &WorkerEvent) -> Result<bool, QueueError> {
        let job_id = event.job_id();
        match event {
            WorkerEvent::Started { .. } => {
                self.update_job_status(job_id, JobStatus::Encoding, StatusPatch::default())
                    .await
            }
            WorkerEvent::Progress {
                progress,
                current_frame,
                encoding_speed,
                ..
            } => {
                self.update_job_status(
                    job_id,
                    JobStatus::Encoding,
                    StatusPatch {
                        progress: Some(*progress),
                        current_frame: Some(*current_frame),
                        encoding_speed: *encoding_speed,
                        ..StatusPatch::default()
                    },
                )
                .await
            }
            WorkerEvent::Complete {
                output_path,
                output_size,
                ..
            } => {
                self.update_job_status(
                    job_id,
                    JobStatus::Complete,
                    StatusPatch {
                        output_path: Some(output_path.clone()),
                        output_size: Some(*output_size),
                        ..StatusPatch::default()
                    },
                )
                .await
            }
            WorkerEvent::Error { error, .. } => {
                self.update_job_status(job_id, JobStatus::Failed, StatusPatch::error(error.clone()))
                    .await
            }
            WorkerEvent::Heartbeat { .. } | WorkerEvent::MemoryWarning { .. } => Ok(false),
        }
    }

    /// Subscribe to a job's updates.
    ///
    /// The current snapshot is delivered first. A job that is already
    /// terminal yields just that snapshot.
    pub async fn subscribe(&self, job_id: &str) -> Result<JobSubscription, QueueError> {
        let mut state = self.state.write().await;
        let job = state
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job.to_progress());

        if !job.is_terminal() {
            state
                .subscribers
                .entry(job_id.to_string())
                .or_default()
                .push(tx);
        }

        Ok(JobSubscription { rx })
    }

    pub async fn get_stats(&self) -> QueueStats {
        let state = self.state.read().await;
        let mut stats = QueueStats {
            total: state.jobs.len(),
            ..QueueStats::default()
        };

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Uploading => stats.uploading += 1,
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Encoding => stats.encoding += 1,
                JobStatus::Complete => stats.complete += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        stats
    }

    /// Forget a job. Open subscriptions end.
    pub async fn remove_job(&self, job_id: &str) -> Option<RenderJob> {
        let mut state = self.state.write().await;
        state.subscribers.remove(job_id);
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        state.jobs.remove(job_id)
    }

    /// Adopt job records found on disk.
    ///
    /// Jobs that were still in flight when the previous process stopped can
    /// never finish, so they are failed. Returns how many were failed.
    pub async fn recover(&self, jobs: Vec<RenderJob>) -> usize {
        let mut state = self.state.write().await;
        let mut interrupted = 0;
        let mut writes = Vec::new();

        for mut job in jobs {
            if !job.is_terminal() && job.fail(INTERRUPTED_REASON) {
                interrupted += 1;
                writes.extend(self.record(&job));
            }
            state.jobs.insert(job.job_id.clone(), job);
        }
        drop(state);

        self.persist(writes).await;
        interrupted
    }
}
