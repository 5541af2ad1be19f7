//! Worker process main loop.
//!
//! A worker reads `MainMessage` lines, runs at most one ffmpeg encode at a
//! time, and writes `WorkerMessage` lines: progress parsed from ffmpeg's
//! stats output, periodic heartbeats, memory warnings and the final result.

use crate::config::Config;
use crate::encode::{
    build_ffmpeg_command, check_output, exit_error, parse_progress_line, EncodeParams,
    ProgressTracker, ProgressUpdate, StatsLineCodec, StderrTail,
};
use crate::metrics::{mb_to_bytes, MemorySampler};
use crate::protocol::{decode_line, encode_line, EncodeJob, MainMessage, WorkerEvent, WorkerMessage};
use crate::validate::quick_validate;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

/// Reported when the pool cancels the running job.
pub const CANCELLED_REASON: &str = "Encoding cancelled";

/// Reported when the worker is told to stop mid-encode.
pub const SHUTDOWN_REASON: &str = "Worker shutting down";

/// Error type for the worker loop
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("IPC channel error: {0}")]
    Channel(#[from] LinesCodecError),

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Worker tuning
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub ffmpeg_path: String,
    pub heartbeat_interval: Duration,
    pub memory_check_interval: Duration,
    /// Resident bytes above which MEMORY_WARNING is sent.
    pub memory_warning_bytes: u64,
    /// Resident bytes above which the encode is killed.
    pub memory_limit_bytes: u64,
}

impl WorkerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            ffmpeg_path: cfg.encoder.ffmpeg_path.clone(),
            heartbeat_interval: Duration::from_millis(cfg.pool.heartbeat_interval_ms.max(1)),
            memory_check_interval: Duration::from_millis(cfg.pool.memory_check_interval_ms.max(1)),
            memory_warning_bytes: mb_to_bytes(cfg.pool.memory_warning_mb),
            memory_limit_bytes: mb_to_bytes(cfg.pool.memory_limit_mb),
        }
    }
}

/// How an encode ended
#[derive(Debug, Clone, PartialEq)]
enum EncodeOutcome {
    Completed { output_size: u64 },
    Failed(String),
    Killed,
}

#[derive(Debug)]
enum EncodeEvent {
    Spawned(Option<u32>),
    Progress(ProgressUpdate),
    Finished(EncodeOutcome),
}

struct ActiveJob {
    job: EncodeJob,
    encoder_pid: Option<u32>,
    kill: CancellationToken,
    /// Set once the encode is being stopped; no progress is reported after.
    stop_reason: Option<String>,
    events: mpsc::UnboundedReceiver<EncodeEvent>,
}

impl ActiveJob {
    fn stop(&mut self, reason: &str) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason.to_string());
            self.kill.cancel();
        }
    }
}

/// Run ffmpeg for one job, reporting through `tx`.
async fn drive_encode(
    params: EncodeParams,
    total_frames: u64,
    kill: CancellationToken,
    tx: mpsc::UnboundedSender<EncodeEvent>,
) {
    let spawned = tokio::process::Command::from(build_ffmpeg_command(&params))
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let reason = format!("failed to start ffmpeg: {}", e);
            let _ = tx.send(EncodeEvent::Finished(EncodeOutcome::Failed(reason)));
            return;
        }
    };
    let _ = tx.send(EncodeEvent::Spawned(child.id()));

    let mut tracker = ProgressTracker::new(total_frames);
    let mut tail = StderrTail::default();

    if let Some(stderr) = child.stderr.take() {
        let mut lines = FramedRead::new(stderr, StatsLineCodec);
        loop {
            tokio::select! {
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        if let Some(update) = parse_progress_line(&line).and_then(|s| tracker.observe(s)) {
                            let _ = tx.send(EncodeEvent::Progress(update));
                        } else {
                            tail.push(&line);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "ffmpeg stderr unreadable");
                        break;
                    }
                    None => break,
                },
                _ = kill.cancelled() => break,
            }
        }
    }

    if kill.is_cancelled() {
        let _ = child.start_kill();
        let _ = child.wait().await;
        let _ = tx.send(EncodeEvent::Finished(EncodeOutcome::Killed));
        return;
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            let _ = tx.send(EncodeEvent::Finished(EncodeOutcome::Killed));
            return;
        }
    };

    let outcome = match status {
        Ok(status) if status.success() => match check_output(&params.output_path) {
            Ok(size) if quick_validate(&params.output_path) => {
                EncodeOutcome::Completed { output_size: size }
            }
            Ok(_) => EncodeOutcome::Failed(format!(
                "output {} is not a valid MP4 file",
                params.output_path.display()
            )),
            Err(e) => EncodeOutcome::Failed(e.to_string()),
        },
        Ok(status) => EncodeOutcome::Failed(exit_error(status, &tail).to_string()),
        Err(e) => EncodeOutcome::Failed(format!("failed to wait for ffmpeg: {}", e)),
    };
    let _ = tx.send(EncodeEvent::Finished(outcome));
}

async fn next_encode_event(active: &mut Option<ActiveJob>) -> Option<EncodeEvent> {
    match active {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}

struct Outbox<W> {
    worker_id: usize,
    sink: FramedWrite<W, LinesCodec>,
}

impl<W: AsyncWrite + Unpin> Outbox<W> {
    async fn emit(&mut self, event: WorkerEvent) -> Result<(), WorkerError> {
        let line = encode_line(&WorkerMessage::new(self.worker_id, event))?;
        self.sink.send(line).await?;
        Ok(())
    }
}

/// Run the worker loop until `SHUTDOWN` or end of input.
pub async fn run_worker<R, W>(
    worker_id: usize,
    settings: WorkerSettings,
    reader: R,
    writer: W,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut commands = FramedRead::new(reader, LinesCodec::new_with_max_length(1024 * 1024));
    let mut out = Outbox {
        worker_id,
        sink: FramedWrite::new(writer, LinesCodec::new()),
    };

    let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut memory_check = tokio::time::interval(settings.memory_check_interval);
    memory_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut sampler = MemorySampler::new();
    let own_pid = std::process::id();
    let mut active: Option<ActiveJob> = None;
    let mut stopping = false;

    tracing::info!(worker_id, "worker ready");

    loop {
        tokio::select! {
            line = commands.next(), if !stopping => {
                let msg = match line {
                    Some(Ok(line)) => match decode_line::<MainMessage>(&line) {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::warn!(worker_id, error = %e, "ignoring malformed command");
                            continue;
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(worker_id, error = %e, "command channel broken");
                        MainMessage::Shutdown
                    }
                    // Parent went away
                    None => MainMessage::Shutdown,
                };

                match msg {
                    MainMessage::StartJob { job } => {
                        if active.is_some() {
                            out.emit(WorkerEvent::Error {
                                job_id: job.job_id,
                                error: "worker already has a job".to_string(),
                            })
                            .await?;
                            continue;
                        }

                        tracing::info!(worker_id, job_id = %job.job_id, encoder = %job.encoder, "encode starting");
                        let (tx, rx) = mpsc::unbounded_channel();
                        let kill = CancellationToken::new();
                        tokio::spawn(drive_encode(
                            job.encode_params(&settings.ffmpeg_path),
                            job.total_frames,
                            kill.clone(),
                            tx,
                        ));

                        out.emit(WorkerEvent::Started { job_id: job.job_id.clone() }).await?;
                        heartbeat.reset();
                        active = Some(ActiveJob {
                            job,
                            encoder_pid: None,
                            kill,
                            stop_reason: None,
                            events: rx,
                        });
                    }
                    MainMessage::CancelJob => {
                        if let Some(job) = active.as_mut() {
                            tracing::info!(worker_id, job_id = %job.job.job_id, "cancelling encode");
                            job.stop(CANCELLED_REASON);
                        }
                    }
                    MainMessage::Shutdown => {
                        stopping = true;
                        match active.as_mut() {
                            Some(job) => job.stop(SHUTDOWN_REASON),
                            None => break,
                        }
                    }
                }
            }

            event = next_encode_event(&mut active) => {
                let Some(job) = active.as_mut() else {
                    continue;
                };
                let job_id = job.job.job_id.clone();

                let outcome = match event {
                    Some(EncodeEvent::Spawned(pid)) => {
                        job.encoder_pid = pid;
                        continue;
                    }
                    Some(EncodeEvent::Progress(update)) => {
                        if job.stop_reason.is_none() {
                            out.emit(WorkerEvent::Progress {
                                job_id,
                                progress: update.progress,
                                current_frame: update.current_frame,
                                total_frames: job.job.total_frames,
                                encoding_speed: update.speed,
                            })
                            .await?;
                        }
                        continue;
                    }
                    Some(EncodeEvent::Finished(outcome)) => outcome,
                    None => EncodeOutcome::Failed("encoder task ended unexpectedly".to_string()),
                };

                let stop_reason = job.stop_reason.clone();
                let output_path = job.job.output_path.clone();
                active = None;

                let event = match (stop_reason, outcome) {
                    (Some(reason), _) | (None, EncodeOutcome::Failed(reason)) => {
                        tracing::warn!(worker_id, job_id = %job_id, error = %reason, "encode failed");
                        WorkerEvent::Error { job_id, error: reason }
                    }
                    (None, EncodeOutcome::Killed) => WorkerEvent::Error {
                        job_id,
                        error: "ffmpeg was killed".to_string(),
                    },
                    (None, EncodeOutcome::Completed { output_size }) => {
                        tracing::info!(worker_id, job_id = %job_id, output_size, "encode complete");
                        WorkerEvent::Complete {
                            job_id,
                            output_path,
                            output_size,
                        }
                    }
                };
                out.emit(event).await?;

                if stopping {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if let Some(job) = &active {
                    out.emit(WorkerEvent::Heartbeat { job_id: job.job.job_id.clone() }).await?;
                }
            }

            _ = memory_check.tick() => {
                let Some(job) = active.as_mut() else {
                    continue;
                };
                if job.stop_reason.is_some() {
                    continue;
                }

                let mut pids = vec![own_pid];
                pids.extend(job.encoder_pid);
                let rss = sampler.sample(&pids);

                if rss > settings.memory_limit_bytes {
                    let reason = format!(
                        "memory limit exceeded: {} MB used, limit {} MB",
                        rss / (1024 * 1024),
                        settings.memory_limit_bytes / (1024 * 1024)
                    );
                    tracing::error!(worker_id, job_id = %job.job.job_id, rss, "killing encode over memory limit");
                    job.stop(&reason);
                } else if rss > settings.memory_warning_bytes {
                    out.emit(WorkerEvent::MemoryWarning {
                        job_id: job.job.job_id.clone(),
                        memory_usage: rss,
                    })
                    .await?;
                }
            }
        }
    }

    tracing::info!(worker_id, "worker exiting");
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::encode::EncoderId;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    const FAST_FFMPEG: &str = r#"#!/bin/sh
for last; do :; done
i=1
while [ $i -le 10 ]; do
  printf 'frame=%5d fps=30 q=23.0 size=1kB time=00:00:00.33 bitrate=1kbits/s speed=1.5x\r' $i >&2
  i=$((i+1))
done
printf '\000\000\000\030ftypisom' > "$last"
head -c 2048 /dev/zero >> "$last"
exit 0
"#;

    const FAILING_FFMPEG: &str = r#"#!/bin/sh
echo "frame_%06d.png: No such file or directory" >&2
exit 1
"#;

    const SLOW_FFMPEG: &str = r#"#!/bin/sh
printf 'frame=    1 fps=1 q=23.0 size=1kB time=00:00:00.03 bitrate=1kbits/s speed=0.1x\r' >&2
exec sleep 30
"#;

    const EMPTY_OUTPUT_FFMPEG: &str = r#"#!/bin/sh
for last; do :; done
: > "$last"
exit 0
"#;

    fn write_script(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn settings(ffmpeg_path: String) -> WorkerSettings {
        WorkerSettings {
            ffmpeg_path,
            heartbeat_interval: Duration::from_secs(60),
            memory_check_interval: Duration::from_secs(60),
            memory_warning_bytes: u64::MAX,
            memory_limit_bytes: u64::MAX,
        }
    }

    fn make_job(dir: &Path, total_frames: u64) -> EncodeJob {
        EncodeJob {
            job_id: "job-1".to_string(),
            session_id: "s".to_string(),
            session_dir: dir.to_path_buf(),
            fps: 30,
            encoder: EncoderId::Libx264,
            quality: 23,
            total_frames,
            audio_path: None,
            output_path: dir.join("output.mp4"),
            threads: Some(1),
        }
    }

    struct PoolSide {
        lines: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
        sink: FramedWrite<WriteHalf<DuplexStream>, LinesCodec>,
        worker: JoinHandle<Result<(), WorkerError>>,
    }

    impl PoolSide {
        fn start(settings: WorkerSettings) -> Self {
            let (pool_end, worker_end) = tokio::io::duplex(64 * 1024);
            let (worker_read, worker_write) = tokio::io::split(worker_end);
            let (pool_read, pool_write) = tokio::io::split(pool_end);

            let worker = tokio::spawn(run_worker(7, settings, worker_read, worker_write));
            Self {
                lines: FramedRead::new(pool_read, LinesCodec::new()),
                sink: FramedWrite::new(pool_write, LinesCodec::new()),
                worker,
            }
        }

        async fn send(&mut self, msg: MainMessage) {
            self.sink.send(encode_line(&msg).unwrap()).await.unwrap();
        }

        async fn recv(&mut self) -> WorkerMessage {
            let line = tokio::time::timeout(Duration::from_secs(10), self.lines.next())
                .await
                .expect("worker message within timeout")
                .expect("worker output open")
                .unwrap();
            decode_line(&line).unwrap()
        }

        /// Read until COMPLETE or ERROR, returning everything seen.
        async fn recv_until_done(&mut self) -> Vec<WorkerEvent> {
            let mut seen = Vec::new();
            loop {
                let msg = self.recv().await;
                assert_eq!(msg.worker_id, 7);
                let done = msg.event.ends_job();
                seen.push(msg.event);
                if done {
                    return seen;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_successful_encode_reports_progress_and_complete() {
        let temp = TempDir::new().unwrap();
        let mut pool = PoolSide::start(settings(write_script(temp.path(), FAST_FFMPEG)));

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 10) }).await;
        let events = pool.recv_until_done().await;

        assert_eq!(events[0], WorkerEvent::Started { job_id: "job-1".to_string() });

        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                WorkerEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0] < w[1]), "strictly increasing: {:?}", progress);
        assert!(progress.iter().all(|p| *p <= 99));

        match events.last().unwrap() {
            WorkerEvent::Complete { output_path, output_size, .. } => {
                assert_eq!(output_path, &temp.path().join("output.mp4"));
                assert!(*output_size > 2048);
            }
            other => panic!("expected COMPLETE, got {:?}", other),
        }

        pool.send(MainMessage::Shutdown).await;
        pool.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_encode_reports_stderr() {
        let temp = TempDir::new().unwrap();
        let mut pool = PoolSide::start(settings(write_script(temp.path(), FAILING_FFMPEG)));

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 10) }).await;
        let events = pool.recv_until_done().await;

        match events.last().unwrap() {
            WorkerEvent::Error { error, .. } => {
                assert!(error.contains("code 1"), "{}", error);
                assert!(error.contains("No such file"), "{}", error);
            }
            other => panic!("expected ERROR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_output_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut pool = PoolSide::start(settings(write_script(temp.path(), EMPTY_OUTPUT_FFMPEG)));

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 10) }).await;
        let events = pool.recv_until_done().await;
        assert!(matches!(events.last(), Some(WorkerEvent::Error { error, .. }) if error.contains("empty")));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut pool = PoolSide::start(settings("/nonexistent/ffmpeg-framecast".to_string()));

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 10) }).await;
        let events = pool.recv_until_done().await;
        assert!(matches!(events.last(), Some(WorkerEvent::Error { error, .. }) if error.contains("failed to start")));
    }

    #[tokio::test]
    async fn test_cancel_kills_encode() {
        let temp = TempDir::new().unwrap();
        let mut pool = PoolSide::start(settings(write_script(temp.path(), SLOW_FFMPEG)));

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 100) }).await;
        assert!(matches!(pool.recv().await.event, WorkerEvent::Started { .. }));
        assert!(matches!(pool.recv().await.event, WorkerEvent::Progress { progress: 1, .. }));

        pool.send(MainMessage::CancelJob).await;
        let events = pool.recv_until_done().await;
        assert_eq!(
            events.last(),
            Some(&WorkerEvent::Error {
                job_id: "job-1".to_string(),
                error: CANCELLED_REASON.to_string()
            })
        );
        assert!(events.iter().all(|e| !matches!(e, WorkerEvent::Progress { .. })));

        // The worker is idle again and accepts the next job
        pool.send(MainMessage::CancelJob).await;
        pool.send(MainMessage::Shutdown).await;
        pool.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_mid_encode_reports_and_exits() {
        let temp = TempDir::new().unwrap();
        let mut pool = PoolSide::start(settings(write_script(temp.path(), SLOW_FFMPEG)));

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 100) }).await;
        assert!(matches!(pool.recv().await.event, WorkerEvent::Started { .. }));

        pool.send(MainMessage::Shutdown).await;
        let events = pool.recv_until_done().await;
        assert!(matches!(events.last(), Some(WorkerEvent::Error { error, .. }) if error == SHUTDOWN_REASON));
        pool.worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeats_while_encoding() {
        let temp = TempDir::new().unwrap();
        let mut cfg = settings(write_script(temp.path(), SLOW_FFMPEG));
        cfg.heartbeat_interval = Duration::from_millis(20);
        let mut pool = PoolSide::start(cfg);

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 100) }).await;
        let mut heartbeats = 0;
        while heartbeats < 2 {
            if let WorkerEvent::Heartbeat { job_id } = pool.recv().await.event {
                assert_eq!(job_id, "job-1");
                heartbeats += 1;
            }
        }
        pool.send(MainMessage::CancelJob).await;
        pool.recv_until_done().await;
    }

    #[tokio::test]
    async fn test_memory_warning_then_limit() {
        let temp = TempDir::new().unwrap();
        let mut cfg = settings(write_script(temp.path(), SLOW_FFMPEG));
        cfg.memory_check_interval = Duration::from_millis(20);
        cfg.memory_warning_bytes = 1;
        let mut pool = PoolSide::start(cfg);

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 100) }).await;
        loop {
            if let WorkerEvent::MemoryWarning { memory_usage, .. } = pool.recv().await.event {
                assert!(memory_usage > 1);
                break;
            }
        }
        pool.send(MainMessage::CancelJob).await;
        pool.recv_until_done().await;

        let mut cfg = settings(write_script(temp.path(), SLOW_FFMPEG));
        cfg.memory_check_interval = Duration::from_millis(20);
        cfg.memory_limit_bytes = 1;
        let mut pool = PoolSide::start(cfg);

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 100) }).await;
        let events = pool.recv_until_done().await;
        assert!(matches!(events.last(), Some(WorkerEvent::Error { error, .. }) if error.contains("memory limit")));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut pool = PoolSide::start(settings(write_script(temp.path(), SLOW_FFMPEG)));

        pool.send(MainMessage::StartJob { job: make_job(temp.path(), 100) }).await;
        assert!(matches!(pool.recv().await.event, WorkerEvent::Started { .. }));

        let mut other = make_job(temp.path(), 5);
        other.job_id = "job-2".to_string();
        pool.send(MainMessage::StartJob { job: other }).await;

        loop {
            if let WorkerEvent::Error { job_id, error } = pool.recv().await.event {
                assert_eq!(job_id, "job-2");
                assert!(error.contains("already"));
                break;
            }
        }
        pool.send(MainMessage::Shutdown).await;
        pool.recv_until_done().await;
    }

    #[tokio::test]
    async fn test_input_eof_stops_worker() {
        let temp = TempDir::new().unwrap();
        let pool = PoolSide::start(settings(write_script(temp.path(), SLOW_FFMPEG)));
        let PoolSide { sink, worker, lines } = pool;
        drop(sink);
        drop(lines);
        let _ = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("worker exits on EOF");
    }

    #[test]
    fn test_settings_from_config() {
        let cfg = Config::default();
        let settings = WorkerSettings::from_config(&cfg);
        assert_eq!(settings.ffmpeg_path, "ffmpeg");
        assert_eq!(settings.memory_limit_bytes, 4096 * 1024 * 1024);
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(5000));
    }
}
