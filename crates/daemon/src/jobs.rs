//! Render job model.
//!
//! A `RenderJob` is the state machine and frame manifest for one export.
//! Jobs are persisted as `job.json` inside their session directory so a
//! restarted service can report what happened to them.

use crate::encode::EncoderId;
use crate::session::job_file_path;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Status of a render job.
///
/// Statuses only move forward, except that `Failed` is reachable from any
/// non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no frames yet.
    Pending,
    /// Frames are arriving.
    Uploading,
    /// Validated and waiting for a worker.
    Queued,
    /// A worker is encoding.
    Encoding,
    /// Output is ready for download.
    Complete,
    /// Encoding failed, was cancelled or abandoned.
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Uploading => write!(f, "uploading"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Encoding => write!(f, "encoding"),
            JobStatus::Complete => write!(f, "complete"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    /// Check if the status is terminal (complete or failed).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Uploading => 1,
            JobStatus::Queued => 2,
            JobStatus::Encoding => 3,
            JobStatus::Complete | JobStatus::Failed => 4,
        }
    }

    /// Whether a job in this status may move to `next`.
    ///
    /// Staying in the same non-terminal status is allowed so progress can be
    /// patched without a transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == JobStatus::Failed || next.rank() >= self.rank()
    }
}

/// Encode settings fixed when the job is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub fps: u32,
    pub encoder: EncoderId,
    pub quality: u8,
}

/// What has been uploaded so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameManifest {
    /// Expected frame count, known once the client says so.
    pub total_frames: Option<u64>,
    /// Frames stored; only ever grows.
    pub received_frames: u64,
    /// Hex SHA-256 per frame index, for frames uploaded with checksums.
    #[serde(default)]
    pub checksums: BTreeMap<u64, String>,
}

/// Partial update applied together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub progress: Option<u8>,
    pub current_frame: Option<u64>,
    pub encoding_speed: Option<f32>,
    pub output_path: Option<PathBuf>,
    pub output_size: Option<u64>,
    pub error: Option<String>,
}

impl StatusPatch {
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// One export request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    pub job_id: String,
    pub session_id: String,
    pub status: JobStatus,
    pub config: JobConfig,
    pub frame_manifest: FrameManifest,
    pub current_frame: u64,
    /// 0-100, never decreases.
    pub progress: u8,
    pub encoding_speed: Option<f32>,
    pub output_path: Option<PathBuf>,
    pub output_size: Option<u64>,
    pub last_error: Option<String>,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) of the last change.
    pub updated_at: i64,
}

impl RenderJob {
    /// Creates a pending job with a fresh id.
    pub fn new(session_id: &str, config: JobConfig) -> Self {
        let now = current_timestamp_ms();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            status: JobStatus::Pending,
            config,
            frame_manifest: FrameManifest::default(),
            current_frame: 0,
            progress: 0,
            encoding_speed: None,
            output_path: None,
            output_size: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change and patch. Returns false, leaving the job
    /// untouched, when the transition is not allowed.
    pub fn apply(&mut self, status: JobStatus, patch: StatusPatch) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }

        self.status = status;

        if let Some(p) = patch.progress {
            self.progress = self.progress.max(p.min(100));
        }
        if let Some(frame) = patch.current_frame {
            self.current_frame = self.current_frame.max(frame);
        }
        if patch.encoding_speed.is_some() {
            self.encoding_speed = patch.encoding_speed;
        }
        if patch.output_path.is_some() {
            self.output_path = patch.output_path;
        }
        if patch.output_size.is_some() {
            self.output_size = patch.output_size;
        }
        if patch.error.is_some() {
            self.last_error = patch.error;
        }

        if status == JobStatus::Complete {
            self.progress = 100;
            if let Some(total) = self.frame_manifest.total_frames {
                self.current_frame = total;
            }
        }

        self.touch();
        true
    }

    /// Mark the job as failed with a reason.
    pub fn fail(&mut self, reason: &str) -> bool {
        self.apply(JobStatus::Failed, StatusPatch::error(reason))
    }

    /// Snapshot for status polling and event streams.
    pub fn to_progress(&self) -> JobProgress {
        JobProgress {
            job_id: self.job_id.clone(),
            session_id: self.session_id.clone(),
            status: self.status,
            progress: self.progress,
            current_frame: self.current_frame,
            total_frames: self.frame_manifest.total_frames,
            received_frames: self.frame_manifest.received_frames,
            encoding_speed: self.encoding_speed,
            output_size: self.output_size,
            error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Client-facing view of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: String,
    pub session_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub current_frame: u64,
    pub total_frames: Option<u64>,
    pub received_frames: u64,
    pub encoding_speed: Option<f32>,
    pub output_size: Option<u64>,
    pub error: Option<String>,
    pub updated_at: i64,
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Saves a job as `job.json` in its session directory.
///
/// Writes to a temporary file first so a crash never leaves a torn record.
pub fn save_job(job: &RenderJob, session_dir: &Path) -> Result<(), io::Error> {
    fs::create_dir_all(session_dir)?;

    let file_path = job_file_path(session_dir);
    let tmp_path = file_path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(job)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    fs::write(&tmp_path, json)?;
    fs::rename(tmp_path, file_path)
}

/// Loads every `job.json` found one level below the sessions root.
///
/// Skips records that fail to parse and logs warnings.
pub fn load_jobs(sessions_root: &Path) -> Result<Vec<RenderJob>, io::Error> {
    if !sessions_root.exists() {
        return Ok(Vec::new());
    }

    let mut jobs = Vec::new();

    for entry in fs::read_dir(sessions_root)? {
        let entry = entry?;
        let path = job_file_path(&entry.path());
        if !path.is_file() {
            continue;
        }

        match load_job_from_file(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load job record");
            }
        }
    }

    Ok(jobs)
}

/// Loads a single job from a JSON file.
fn load_job_from_file(path: &Path) -> Result<RenderJob, io::Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
