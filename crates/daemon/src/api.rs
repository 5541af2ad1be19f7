//! HTTP API for export sessions
//!
//! Routes, all under `/export`:
//! - `POST init` creates a session and its pending job
//! - `POST chunk` stores a batch of frames
//! - `POST finalize` validates the upload and queues the job
//! - `GET status/:job_id` and `GET events/:job_id` (SSE) report progress
//! - `GET download/:job_id` streams the finished video, then drops the session
//! - `POST cancel/:job_id` stops a job and frees its session
//! - `GET stats` reports queue, pool, encoder and host figures

use crate::config::Config;
use crate::concurrency::ConcurrencyPlan;
use crate::encode::{run_encode, EncodeParams, EncoderId, EncoderSelection};
use crate::encode::strategy::MAX_QUALITY;
use crate::jobs::{JobConfig, JobProgress, JobStatus, RenderJob, StatusPatch};
use crate::metrics::{collect_system_metrics, SystemMetrics};
use crate::pool::{CancelOutcome, PoolStats, SubmitOutcome, WorkerPool};
use crate::protocol::EncodeJob;
use crate::queue::{JobQueue, QueueError, QueueStats};
use crate::session::{
    audio_extension, audio_path, find_audio, frame_path, new_session_id, output_path,
    parse_frame_index, sanitize_session_id, sha256_hex, SessionError, SessionStore,
};
use crate::validate::{quick_validate, validate_sequence, validate_sizes, verify_output_quality};
use axum::body::Body;
use axum::extract::multipart::{Field, MultipartError};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// Reason recorded on jobs cancelled through the API.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Reason recorded when a synchronous finalize loses its client.
pub const CLIENT_GONE_REASON: &str = "client disconnected during synchronous encode";

const MAX_FPS: u32 = 240;

/// Request failures, each with a stable machine-readable code
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("invalid frame file name: {0}")]
    InvalidFrameName(String),

    #[error("{name} exceeds the {limit} byte limit")]
    FrameTooLarge { name: String, limit: u64 },

    #[error("chunk holds more than {limit} frames")]
    TooManyFrames { limit: usize },

    #[error("checksum mismatch for frame {0}")]
    ChecksumMismatch(u64),

    #[error("frame sequence failed validation")]
    InvalidFrames {
        missing_frames: Vec<u64>,
        undersized_frames: Vec<u64>,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error("fps {requested} does not match session fps {configured}")]
    FpsMismatch { requested: u32, configured: u32 },

    #[error("encoder {0} is not available on this host")]
    EncoderUnavailable(EncoderId),

    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    #[error("job {job_id} is {status}, not complete")]
    NotComplete { job_id: String, status: JobStatus },

    #[error("worker pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::JobNotFound(_) => "job_not_found",
            ApiError::InvalidSessionId(_) => "invalid_session_id",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidFrameName(_) => "invalid_frame_name",
            ApiError::FrameTooLarge { .. } => "frame_too_large",
            ApiError::TooManyFrames { .. } => "too_many_frames",
            ApiError::ChecksumMismatch(_) => "checksum_mismatch",
            ApiError::InvalidFrames { missing_frames, .. } if !missing_frames.is_empty() => {
                "missing_frames"
            }
            ApiError::InvalidFrames { .. } => "undersized_frames",
            ApiError::InvalidState(_) => "invalid_state",
            ApiError::FpsMismatch { .. } => "fps_mismatch",
            ApiError::EncoderUnavailable(_) => "encoder_unavailable",
            ApiError::AlreadyTerminal { .. } => "already_terminal",
            ApiError::NotComplete { .. } => "not_complete",
            ApiError::PoolUnavailable(_) => "pool_unavailable",
            ApiError::EncodeFailed(_) => "encode_failed",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::SessionNotFound(_) | ApiError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PoolUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::EncodeFailed(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let mut body = json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        if let ApiError::InvalidFrames {
            missing_frames,
            undersized_frames,
        } = &self
        {
            body["missingFrames"] = json!(missing_frames);
            body["undersizedFrames"] = json!(undersized_frames);
        }

        (status, Json(body)).into_response()
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::JobNotFound(id) => ApiError::JobNotFound(id),
            QueueError::TotalFramesUnset(_) => ApiError::InvalidRequest(e.to_string()),
            QueueError::InvalidState { .. } | QueueError::FrameCountMismatch { .. } => {
                ApiError::InvalidState(e.to_string())
            }
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidId(id) => ApiError::InvalidSessionId(id),
            SessionError::InvalidFrameName(name) => ApiError::InvalidFrameName(name),
            SessionError::NotFound(dir) => ApiError::SessionNotFound(dir.display().to_string()),
            SessionError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::InvalidRequest(format!("malformed multipart body: {}", e))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::InvalidRequest(e.body_text())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub pool: WorkerPool,
    pub store: SessionStore,
    pub config: Arc<Config>,
    pub encoders: Arc<EncoderSelection>,
    pub plan: ConcurrencyPlan,
    pub inline: InlineEncodes,
}

/// Jobs being encoded inside a synchronous finalize request
#[derive(Debug, Clone, Default)]
pub struct InlineEncodes {
    jobs: Arc<Mutex<HashSet<String>>>,
}

impl InlineEncodes {
    /// Track `job_id` until the returned guard is dropped.
    pub(crate) fn begin(&self, job_id: &str) -> InlineEncode {
        self.lock().insert(job_id.to_string());
        InlineEncode {
            registry: self.clone(),
            job_id: job_id.to_string(),
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.lock().contains(job_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct InlineEncode {
    registry: InlineEncodes,
    job_id: String,
}

impl Drop for InlineEncode {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.job_id);
    }
}

impl AppState {
    /// `-threads` for an encode, software backends only.
    fn threads_for(&self, encoder: EncoderId) -> Option<u32> {
        (!encoder.is_hardware()).then_some(self.plan.threads_per_worker)
    }

    fn encode_job(&self, job: &RenderJob, session_dir: &FsPath, total_frames: u64) -> EncodeJob {
        EncodeJob {
            job_id: job.job_id.clone(),
            session_id: job.session_id.clone(),
            session_dir: session_dir.to_path_buf(),
            fps: job.config.fps,
            encoder: job.config.encoder,
            quality: job.config.quality,
            total_frames,
            audio_path: find_audio(session_dir),
            output_path: output_path(session_dir),
            threads: self.threads_for(job.config.encoder),
        }
    }

    /// Resolve a client session id to its job and directory.
    async fn session_job(&self, raw: &str) -> Result<(RenderJob, PathBuf), ApiError> {
        let session_id = sanitize_session_id(raw)?;
        let job = self
            .queue
            .find_by_session(&session_id)
            .await
            .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;
        let dir = self.store.existing(&session_id)?;
        Ok((job, dir))
    }

    async fn job(&self, job_id: &str) -> Result<RenderJob, ApiError> {
        self.queue
            .get_job(job_id)
            .await
            .ok_or_else(|| ApiError::JobNotFound(job_id.to_string()))
    }
}

/// Creates the axum Router with every export route
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/export/init", post(init_session))
        .route("/export/chunk", post(upload_chunk))
        .route("/export/finalize", post(finalize))
        .route("/export/status/:job_id", get(job_status))
        .route("/export/events/:job_id", get(job_events))
        .route("/export/download/:job_id", get(download))
        .route("/export/cancel/:job_id", post(cancel))
        .route("/export/stats", get(stats))
        // Frame and audio sizes are enforced per field
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub session_id: String,
    pub job_id: String,
}

/// Handler for POST /export/init
async fn init_session(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<InitResponse>, ApiError> {
    let session_id = new_session_id();
    let dir = state.store.create(&session_id)?;

    let config = match read_init_form(&state, &dir, &mut multipart).await {
        Ok(config) => config,
        Err(e) => {
            state.store.discard(&session_id).await;
            return Err(e);
        }
    };

    let job = state.queue.create_job(&session_id, config).await;
    tracing::info!(
        session_id = %session_id,
        job_id = %job.job_id,
        encoder = %config.encoder,
        fps = config.fps,
        quality = config.quality,
        "export session created"
    );

    Ok(Json(InitResponse {
        session_id,
        job_id: job.job_id,
    }))
}

async fn read_init_form(
    state: &AppState,
    dir: &FsPath,
    multipart: &mut Multipart,
) -> Result<JobConfig, ApiError> {
    let defaults = &state.config.encoder;
    let mut config = JobConfig {
        fps: defaults.default_fps,
        encoder: state.encoders.selected,
        quality: defaults.default_quality.min(MAX_QUALITY),
    };
    let mut has_audio = false;

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "audio" => {
                let ext = audio_extension(field.file_name());
                let mut file = tokio::fs::File::create(audio_path(dir, ext)).await?;
                while let Some(chunk) = field.chunk().await? {
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                has_audio = true;
            }
            "fps" => config.fps = parse_fps(&field.text().await?)?,
            "quality" => config.quality = parse_quality(&field.text().await?)?,
            "encoder" => config.encoder = parse_encoder(&state.encoders, &field.text().await?)?,
            _ => tracing::debug!(field = %name, "ignoring unknown init field"),
        }
    }

    if !has_audio {
        return Err(ApiError::InvalidRequest("audio file is required".to_string()));
    }
    Ok(config)
}

fn parse_fps(raw: &str) -> Result<u32, ApiError> {
    match raw.trim().parse::<u32>() {
        Ok(fps) if (1..=MAX_FPS).contains(&fps) => Ok(fps),
        _ => Err(ApiError::InvalidRequest(format!(
            "fps must be an integer between 1 and {}",
            MAX_FPS
        ))),
    }
}

fn parse_quality(raw: &str) -> Result<u8, ApiError> {
    match raw.trim().parse::<u8>() {
        Ok(q) if q <= MAX_QUALITY => Ok(q),
        _ => Err(ApiError::InvalidRequest(format!(
            "quality must be an integer between 0 and {}",
            MAX_QUALITY
        ))),
    }
}

/// "auto" picks the detected encoder; anything else must be available here.
fn parse_encoder(selection: &EncoderSelection, raw: &str) -> Result<EncoderId, ApiError> {
    if raw.trim().eq_ignore_ascii_case("auto") {
        return Ok(selection.selected);
    }
    let id = raw
        .parse::<EncoderId>()
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    if !selection.is_available(id) {
        return Err(ApiError::EncoderUnavailable(id));
    }
    Ok(id)
}

/// Per-frame checksums: an array in file order, or an object keyed by index.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChecksumField {
    InOrder(Vec<String>),
    ByIndex(BTreeMap<String, String>),
}

#[derive(Default)]
struct ChunkForm {
    session_id: Option<String>,
    frames: Vec<(u64, Bytes)>,
    checksums: Option<ChecksumField>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub count: u64,
    pub received_frames: u64,
}

/// Handler for POST /export/chunk
async fn upload_chunk(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChunkResponse>, ApiError> {
    let form = read_chunk_form(&state, &mut multipart).await?;

    let raw_id = form
        .session_id
        .ok_or_else(|| ApiError::InvalidRequest("sessionId is required".to_string()))?;
    let (job, dir) = state.session_job(&raw_id).await?;

    if !matches!(job.status, JobStatus::Pending | JobStatus::Uploading) {
        return Err(ApiError::InvalidState(format!(
            "job {} is {}, frames can no longer be added",
            job.job_id, job.status
        )));
    }
    if form.frames.is_empty() {
        return Err(ApiError::InvalidRequest("chunk contains no frames".to_string()));
    }

    let checksums = verify_checksums(&form.frames, form.checksums)?;

    let mut added = 0u64;
    for (index, data) in &form.frames {
        if store_frame(&frame_path(&dir, *index), data).await? {
            added += 1;
        }
    }

    let count = form.frames.len() as u64;
    let progress = state
        .queue
        .register_frames(&job.job_id, added, checksums)
        .await?;
    tracing::debug!(
        job_id = %job.job_id,
        count,
        added,
        received = progress.received_frames,
        "frames stored"
    );

    Ok(Json(ChunkResponse {
        count,
        received_frames: progress.received_frames,
    }))
}

/// Write one frame. Returns false when the frame was already on disk and
/// has been replaced, so retried uploads are not counted twice.
async fn store_frame(path: &FsPath, data: &[u8]) -> std::io::Result<bool> {
    let created = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await;

    match created {
        Ok(mut file) => {
            file.write_all(data).await?;
            file.flush().await?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            tokio::fs::write(path, data).await?;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

async fn read_chunk_form(
    state: &AppState,
    multipart: &mut Multipart,
) -> Result<ChunkForm, ApiError> {
    let limits = &state.config.sessions;
    let mut form = ChunkForm::default();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();

        if let Some(file_name) = field.file_name().map(str::to_string) {
            let index = parse_frame_index(&file_name)
                .ok_or_else(|| ApiError::InvalidFrameName(file_name.clone()))?;
            if form.frames.len() >= limits.max_frames_per_chunk {
                return Err(ApiError::TooManyFrames {
                    limit: limits.max_frames_per_chunk,
                });
            }
            let data = read_limited(&mut field, &file_name, limits.max_frame_bytes).await?;
            form.frames.push((index, data));
            continue;
        }

        match name.as_str() {
            "sessionId" => form.session_id = Some(field.text().await?),
            "checksums" => {
                let text = field.text().await?;
                let parsed = serde_json::from_str(&text).map_err(|e| {
                    ApiError::InvalidRequest(format!("checksums is not valid JSON: {}", e))
                })?;
                form.checksums = Some(parsed);
            }
            _ => tracing::debug!(field = %name, "ignoring unknown chunk field"),
        }
    }

    Ok(form)
}

async fn read_limited(field: &mut Field<'_>, name: &str, limit: u64) -> Result<Bytes, ApiError> {
    let mut data = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        if (data.len() + chunk.len()) as u64 > limit {
            return Err(ApiError::FrameTooLarge {
                name: name.to_string(),
                limit,
            });
        }
        data.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(data))
}

/// Match supplied hashes against the frame bytes. Returns the accepted
/// hashes keyed by frame index.
fn verify_checksums(
    frames: &[(u64, Bytes)],
    supplied: Option<ChecksumField>,
) -> Result<BTreeMap<u64, String>, ApiError> {
    let expected: BTreeMap<u64, String> = match supplied {
        None => return Ok(BTreeMap::new()),
        Some(ChecksumField::InOrder(list)) => {
            if list.len() != frames.len() {
                return Err(ApiError::InvalidRequest(format!(
                    "{} checksums for {} frames",
                    list.len(),
                    frames.len()
                )));
            }
            frames.iter().map(|(i, _)| *i).zip(list).collect()
        }
        Some(ChecksumField::ByIndex(map)) => map
            .into_iter()
            .map(|(key, hash)| match key.trim().parse::<u64>() {
                Ok(index) => Ok((index, hash)),
                Err(_) => Err(ApiError::InvalidRequest(format!(
                    "checksum key '{}' is not a frame index",
                    key
                ))),
            })
            .collect::<Result<_, _>>()?,
    };

    let mut accepted = BTreeMap::new();
    for (index, data) in frames {
        let Some(want) = expected.get(index) else {
            continue;
        };
        let actual = sha256_hex(data);
        if !want.trim().eq_ignore_ascii_case(&actual) {
            return Err(ApiError::ChecksumMismatch(*index));
        }
        accepted.insert(*index, actual);
    }
    Ok(accepted)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeRequest {
    session_id: String,
    fps: Option<u32>,
    total_frames: u64,
    /// Encode in the request and stream the video back.
    #[serde(default)]
    sync: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub job_id: String,
    pub status: JobStatus,
    /// Place in the pool's wait list, when no worker was free.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_position: Option<usize>,
}

/// Handler for POST /export/finalize
async fn finalize(
    State(state): State<AppState>,
    body: Result<Json<FinalizeRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body?;
    let (job, dir) = state.session_job(&req.session_id).await?;

    let max_total = state.config.sessions.max_total_frames;
    if req.total_frames == 0 || req.total_frames > max_total {
        return Err(ApiError::InvalidRequest(format!(
            "totalFrames must be between 1 and {}",
            max_total
        )));
    }
    if let Some(requested) = req.fps {
        if requested != job.config.fps {
            return Err(ApiError::FpsMismatch {
                requested,
                configured: job.config.fps,
            });
        }
    }
    if !matches!(job.status, JobStatus::Pending | JobStatus::Uploading) {
        return Err(ApiError::InvalidState(format!(
            "job {} is {}, it cannot be finalized",
            job.job_id, job.status
        )));
    }

    state
        .queue
        .set_total_frames(&job.job_id, req.total_frames)
        .await?;

    let min_bytes = state.config.sessions.min_frame_bytes;
    let total = req.total_frames;
    let scan_dir = dir.clone();
    let (sequence, sizes) = tokio::task::spawn_blocking(move || {
        let sequence = validate_sequence(&scan_dir, total)?;
        let sizes = validate_sizes(&scan_dir, total, min_bytes)?;
        Ok::<_, crate::validate::ValidationError>((sequence, sizes))
    })
    .await?
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    if !sequence.valid || !sizes.valid {
        tracing::info!(
            job_id = %job.job_id,
            missing = ?sequence.missing_frames,
            undersized = ?sizes.undersized_frames,
            "frame validation failed"
        );
        return Err(ApiError::InvalidFrames {
            missing_frames: sequence.missing_frames,
            undersized_frames: sizes.undersized_frames,
        });
    }

    let queued = state.queue.queue_job(&job.job_id).await?;
    let encode_job = state.encode_job(&queued, &dir, total);

    if req.sync {
        return encode_in_request(&state, queued, encode_job).await;
    }

    let outcome = match state.pool.submit_job(encode_job).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let reason = e.to_string();
            let _ = state
                .queue
                .update_job_status(&queued.job_id, JobStatus::Failed, StatusPatch::error(&reason))
                .await;
            return Err(ApiError::PoolUnavailable(reason));
        }
    };

    let pending_position = match outcome {
        SubmitOutcome::Assigned { worker_id } => {
            tracing::info!(job_id = %queued.job_id, worker_id, "job assigned");
            None
        }
        SubmitOutcome::Pending { position } => {
            tracing::info!(job_id = %queued.job_id, position, "job waiting for a worker");
            Some(position)
        }
    };

    Ok(Json(FinalizeResponse {
        job_id: queued.job_id,
        status: JobStatus::Queued,
        pending_position,
    })
    .into_response())
}

/// Blocking finalize: encode here, verify, and stream the result back.
///
/// The encode runs in its own task, which always leaves the job terminal.
/// Dropping this future (the client went away) stops the encode.
async fn encode_in_request(
    state: &AppState,
    job: RenderJob,
    encode_job: EncodeJob,
) -> Result<Response, ApiError> {
    let params: EncodeParams = encode_job.encode_params(&state.config.encoder.ffmpeg_path);
    let tracked = state.inline.begin(&job.job_id);
    state
        .queue
        .update_job_status(&job.job_id, JobStatus::Encoding, StatusPatch::default())
        .await?;
    tracing::info!(job_id = %job.job_id, encoder = %params.encoder, "synchronous encode started");

    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();
    let task = tokio::spawn(run_inline_encode(
        state.clone(),
        job.job_id.clone(),
        params.clone(),
        encode_job.total_frames,
        cancel,
        tracked,
    ));

    match task.await {
        Ok(Ok(())) => stream_output(state.clone(), job, params.output_path).await,
        Ok(Err(e)) => Err(e),
        Err(e) => {
            // The task died before settling the job
            let reason = format!("synchronous encode aborted: {}", e);
            Err(fail_inline(state, &job.job_id, reason).await)
        }
    }
}

async fn run_inline_encode(
    state: AppState,
    job_id: String,
    params: EncodeParams,
    total_frames: u64,
    cancel: CancellationToken,
    _tracked: InlineEncode,
) -> Result<(), ApiError> {
    let size = tokio::select! {
        result = run_encode(&params) => match result {
            Ok(size) => size,
            Err(e) => return Err(fail_inline(&state, &job_id, e.to_string()).await),
        },
        // Dropping the encode future kills ffmpeg
        _ = cancel.cancelled() => {
            tracing::warn!(job_id = %job_id, "client left, stopping synchronous encode");
            return Err(fail_inline(&state, &job_id, CLIENT_GONE_REASON.to_string()).await);
        }
    };

    let ffprobe = state.config.encoder.ffprobe_path.clone();
    let out = params.output_path.clone();
    let checked = tokio::task::spawn_blocking(move || {
        (quick_validate(&out), verify_output_quality(&ffprobe, &out, Some(total_frames)))
    })
    .await;
    let (usable, report) = match checked {
        Ok(checked) => checked,
        Err(e) => return Err(fail_inline(&state, &job_id, e.to_string()).await),
    };

    if !usable {
        let reason = format!("{} is not a playable video", params.output_path.display());
        return Err(fail_inline(&state, &job_id, reason).await);
    }
    if !report.passed {
        tracing::warn!(job_id = %job_id, diagnostics = ?report.diagnostics, "output verification reported problems");
    }

    let patch = StatusPatch {
        output_path: Some(params.output_path.clone()),
        output_size: Some(size),
        ..StatusPatch::default()
    };
    state
        .queue
        .update_job_status(&job_id, JobStatus::Complete, patch)
        .await?;
    Ok(())
}

async fn fail_inline(state: &AppState, job_id: &str, reason: String) -> ApiError {
    let _ = state
        .queue
        .update_job_status(job_id, JobStatus::Failed, StatusPatch::error(&reason))
        .await;
    ApiError::EncodeFailed(reason)
}

/// Handler for GET /export/status/:job_id
async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, ApiError> {
    Ok(Json(state.job(&job_id).await?.to_progress()))
}

/// Handler for GET /export/events/:job_id
///
/// Each update is an event named after the job status; the stream ends
/// after the terminal one.
async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let subscription = state.queue.subscribe(&job_id).await?;
    let keep_alive = Duration::from_secs(state.config.server.keep_alive_secs.max(1));

    let events = subscription.into_stream().map(|progress| {
        Event::default()
            .event(progress.status.to_string())
            .json_data(&progress)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(keep_alive)))
}

/// Handler for GET /export/download/:job_id
async fn download(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state.job(&job_id).await?;
    if job.status != JobStatus::Complete {
        return Err(ApiError::NotComplete {
            job_id,
            status: job.status,
        });
    }

    let path = match &job.output_path {
        Some(path) => path.clone(),
        None => output_path(&state.store.dir(&job.session_id)),
    };
    stream_output(state, job, path).await
}

/// Stream a finished video. Once the whole file has been sent the session
/// directory and the job record are dropped.
async fn stream_output(state: AppState, job: RenderJob, path: PathBuf) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("cannot open {}: {}", path.display(), e)))?;
    let len = file.metadata().await?.len();

    let failed = Arc::new(AtomicBool::new(false));
    let seen = failed.clone();
    let job_id = job.job_id.clone();
    let session_id = job.session_id.clone();

    let release = futures::stream::once(async move {
        if failed.load(Ordering::SeqCst) {
            return;
        }
        state.store.discard(&session_id).await;
        state.queue.remove_job(&job_id).await;
        tracing::info!(job_id = %job_id, "download complete, session released");
    })
    .filter_map(|()| async { None::<std::io::Result<Bytes>> });

    let body = ReaderStream::new(file)
        .inspect(move |chunk| {
            if chunk.is_err() {
                seen.store(true, Ordering::SeqCst);
            }
        })
        .chain(release);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, len)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.mp4\"", job.job_id),
        )
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::Internal(format!("response build failed: {}", e)))
}

/// Handler for POST /export/cancel/:job_id
async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobProgress>, ApiError> {
    let job = state.job(&job_id).await?;
    if job.is_terminal() {
        return Err(ApiError::AlreadyTerminal {
            job_id,
            status: job.status,
        });
    }

    // Fail first so the worker's own error report for this job is ignored
    let applied = state
        .queue
        .update_job_status(&job_id, JobStatus::Failed, StatusPatch::error(CANCELLED_BY_USER))
        .await?;
    if !applied {
        // Finished between the lookup and the cancel
        let job = state.job(&job_id).await?;
        return Err(ApiError::AlreadyTerminal {
            job_id,
            status: job.status,
        });
    }

    match state.pool.cancel_job(&job_id).await {
        CancelOutcome::RemovedFromPending => tracing::info!(job_id = %job_id, "removed from wait list"),
        CancelOutcome::SignalledWorker { worker_id } => {
            tracing::info!(job_id = %job_id, worker_id, "worker told to stop")
        }
        CancelOutcome::NotFound => {}
    }

    state.store.discard(&job.session_id).await;
    Ok(Json(state.job(&job_id).await?.to_progress()))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub pool: PoolStats,
    pub encoder: EncoderSelection,
    pub system: SystemMetrics,
}

/// Handler for GET /export/stats
async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let system = tokio::task::spawn_blocking(collect_system_metrics).await?;
    Ok(Json(StatsResponse {
        queue: state.queue.get_stats().await,
        pool: state.pool.get_stats().await,
        encoder: (*state.encoders).clone(),
        system,
    }))
}
