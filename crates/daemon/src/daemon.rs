//! Daemon startup and main loop for framecast
//!
//! Wires the session store, job queue, worker pool and HTTP API together,
//! recovers job records left by a previous run, and keeps the background
//! janitor and heartbeat watchdog running alongside the server.

use crate::api::{create_router, AppState, InlineEncodes};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError, SessionsConfig};
use crate::encode::{detect, EncoderSelection, FfmpegProbe};
use crate::jobs::{current_timestamp_ms, load_jobs, JobStatus, StatusPatch};
use crate::pool::{PoolError, PoolSettings, ProcessLauncher, WorkerLauncher, WorkerPool};
use crate::queue::JobQueue;
use crate::session::{SessionError, SessionStore};
use crate::startup::{run_startup_checks, StartupError};
use std::collections::HashSet;
use std::future::{Future, IntoFuture};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Failure recorded for encodes nothing is driving any more
pub const STRANDED_REASON: &str = "encode lost: no worker or request holds it";

/// How long open connections may linger once the pool has stopped
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Session store error: {0}")]
    Session(#[from] SessionError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server error
    #[error("Server error: {0}")]
    Server(String),
}

/// What one janitor pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Uploads idle past the abandon threshold, now failed and deleted
    pub abandoned: usize,
    /// Finished jobs past retention, forgotten
    pub expired: usize,
    /// Session directories no job refers to
    pub orphans: usize,
    /// Queued or encoding jobs that neither a worker nor a request holds
    pub stranded: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.abandoned == 0 && self.expired == 0 && self.orphans == 0 && self.stranded == 0
    }
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Arc<Config>,
    /// Derived pool sizing
    pub concurrency_plan: ConcurrencyPlan,
    /// Encoders found on this host
    pub encoders: Arc<EncoderSelection>,
    pub queue: Arc<JobQueue>,
    pub pool: WorkerPool,
    pub store: SessionStore,
    /// Jobs currently encoded inside a finalize request
    pub inline: InlineEncodes,
}

impl Daemon {
    /// Initialize the daemon
    ///
    /// 1. Run startup checks (ffmpeg, ffprobe, sessions root)
    /// 2. Probe hardware encoders
    /// 3. Recover job records from the sessions root
    ///
    /// Workers are launched as `<this executable> worker`, passing
    /// `config_path` along when one was given.
    pub async fn new(config: Config, config_path: Option<PathBuf>) -> Result<Self, DaemonError> {
        let checks = config.clone();
        let report = tokio::task::spawn_blocking(move || run_startup_checks(&checks))
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))??;
        tracing::info!(
            ffmpeg_major = ?report.ffmpeg_major,
            ffprobe = report.ffprobe_available,
            "startup checks passed"
        );

        Self::new_without_checks(config, config_path).await
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Encoder probing still happens; it falls back to software on failure.
    pub async fn new_without_checks(
        config: Config,
        config_path: Option<PathBuf>,
    ) -> Result<Self, DaemonError> {
        let launcher = Arc::new(ProcessLauncher::current_exe(config_path)?);
        let encoders = detect_encoders(&config).await;
        Self::with_launcher(config, launcher, encoders).await
    }

    /// Initialize the daemon around a given worker launcher and encoder set
    pub async fn with_launcher(
        config: Config,
        launcher: Arc<dyn WorkerLauncher>,
        encoders: EncoderSelection,
    ) -> Result<Self, DaemonError> {
        let store = SessionStore::new(&config.sessions.root_dir);
        store.ensure_root()?;

        let queue = Arc::new(JobQueue::new(store.clone()));
        let root = store.root().to_path_buf();
        let recovered = tokio::task::spawn_blocking(move || load_jobs(&root))
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))??;
        if !recovered.is_empty() {
            let total = recovered.len();
            let interrupted = queue.recover(recovered).await;
            tracing::info!(total, interrupted, "recovered job records");
        }

        let concurrency_plan = derive_plan(&config.pool);
        let settings = PoolSettings::from_config(&config.pool, &concurrency_plan);
        tracing::info!(
            cores = concurrency_plan.total_cores,
            max_workers = concurrency_plan.max_workers,
            threads_per_worker = concurrency_plan.threads_per_worker,
            encoder = %encoders.selected,
            "daemon configured"
        );
        let pool = WorkerPool::new(settings, launcher, queue.clone());

        Ok(Self {
            config: Arc::new(config),
            concurrency_plan,
            encoders: Arc::new(encoders),
            queue,
            pool,
            store,
            inline: InlineEncodes::default(),
        })
    }

    /// State shared by the HTTP handlers
    pub fn app_state(&self) -> AppState {
        AppState {
            queue: self.queue.clone(),
            pool: self.pool.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            encoders: self.encoders.clone(),
            plan: self.concurrency_plan.clone(),
            inline: self.inline.clone(),
        }
    }

    /// Janitor over this daemon's queue, store and encoders
    pub fn janitor(&self) -> Janitor {
        Janitor {
            queue: self.queue.clone(),
            store: self.store.clone(),
            pool: self.pool.clone(),
            inline: self.inline.clone(),
            settings: self.config.sessions.clone(),
        }
    }

    /// Start the session janitor
    ///
    /// Periodically fails abandoned uploads and stranded encodes, and
    /// forgets expired jobs.
    pub fn start_janitor(&self) -> JoinHandle<()> {
        let janitor = self.janitor();
        let period = Duration::from_secs(janitor.settings.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = janitor.sweep(current_timestamp_ms()).await;
                if !report.is_empty() {
                    tracing::info!(
                        abandoned = report.abandoned,
                        expired = report.expired,
                        orphans = report.orphans,
                        stranded = report.stranded,
                        "session sweep"
                    );
                }
            }
        })
    }

    /// Start the heartbeat watchdog
    ///
    /// Kills busy workers that stopped reporting.
    pub fn start_watchdog(&self) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let period = (pool.settings().heartbeat_timeout / 2).max(Duration::from_millis(100));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                pool.check_heartbeats().await;
            }
        })
    }

    /// Run the daemon with all background tasks until Ctrl-C or SIGTERM
    pub async fn run_with_server(self) -> Result<(), DaemonError> {
        let addr = format!("{}:{}", self.config.server.bind, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Server(format!("Failed to bind {}: {}", addr, e)))?;

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve the API on `listener` until `shutdown` resolves
    ///
    /// On shutdown the pool is stopped first, which ends every open event
    /// stream for in-flight jobs, then the server drains.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pool.initialize().await?;
        let janitor = self.start_janitor();
        let watchdog = self.start_watchdog();

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "framecast listening");
        }

        let pool = self.pool.clone();
        let (stopped_tx, stopped_rx) = oneshot::channel::<()>();
        let signal = async move {
            shutdown.await;
            tracing::info!("shutdown requested");
            pool.shutdown().await;
            let _ = stopped_tx.send(());
        };

        let app = create_router(self.app_state());
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .into_future();
        tokio::pin!(server);

        let result = tokio::select! {
            result = &mut server => result.map_err(|e| DaemonError::Server(e.to_string())),
            _ = async {
                if stopped_rx.await.is_ok() {
                    tokio::time::sleep(DRAIN_TIMEOUT).await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {
                tracing::warn!("connections still open after shutdown, closing");
                Ok(())
            }
        };

        janitor.abort();
        watchdog.abort();
        tracing::info!("framecast stopped");
        result
    }
}

/// Probe ffmpeg for hardware encoders and apply the configured preference
pub async fn detect_encoders(config: &Config) -> EncoderSelection {
    let probe = FfmpegProbe::new(config.encoder.ffmpeg_path.clone());
    let preferred = config.encoder.preferred.clone();

    match tokio::task::spawn_blocking(move || detect(&probe).with_preference(&preferred)).await {
        Ok(selection) => selection,
        Err(e) => {
            tracing::warn!(error = %e, "encoder probe task failed, using software");
            EncoderSelection::software_only()
        }
    }
}

/// Background cleanup of sessions and job records
#[derive(Clone)]
pub struct Janitor {
    queue: Arc<JobQueue>,
    store: SessionStore,
    pool: WorkerPool,
    inline: InlineEncodes,
    settings: SessionsConfig,
}

impl Janitor {
    /// One janitor pass at time `now_ms`
    ///
    /// - pending/uploading jobs idle longer than `abandon_after_secs` are
    ///   failed and their session deleted
    /// - queued/encoding jobs idle that long which no worker and no
    ///   finalize request holds are failed and their session deleted
    /// - terminal jobs older than `retention_secs` are forgotten and their
    ///   session deleted
    /// - session directories with no job, older than `abandon_after_secs`,
    ///   are deleted
    pub async fn sweep(&self, now_ms: i64) -> SweepReport {
        let settings = &self.settings;
        let abandon_ms = secs_to_ms(settings.abandon_after_secs);
        let retention_ms = secs_to_ms(settings.retention_secs);
        let mut report = SweepReport::default();
        let mut live_sessions = HashSet::new();

        for job in self.queue.list_jobs().await {
            let idle = now_ms.saturating_sub(job.updated_at);

            if matches!(job.status, JobStatus::Pending | JobStatus::Uploading) && idle > abandon_ms {
                let reason = format!(
                    "abandoned after {}s without upload activity",
                    settings.abandon_after_secs
                );
                if self.fail(&job.job_id, &job.session_id, reason).await {
                    tracing::info!(job_id = %job.job_id, session_id = %job.session_id, "upload abandoned");
                    report.abandoned += 1;
                }
                continue;
            }

            if matches!(job.status, JobStatus::Queued | JobStatus::Encoding)
                && idle > abandon_ms
                && !self.inline.contains(&job.job_id)
                && !self.pool.holds_job(&job.job_id).await
            {
                if self
                    .fail(&job.job_id, &job.session_id, STRANDED_REASON.to_string())
                    .await
                {
                    tracing::warn!(job_id = %job.job_id, status = %job.status, "encode stranded");
                    report.stranded += 1;
                }
                continue;
            }

            if job.is_terminal() && idle > retention_ms {
                self.queue.remove_job(&job.job_id).await;
                self.store.discard(&job.session_id).await;
                report.expired += 1;
                continue;
            }

            live_sessions.insert(job.session_id);
        }

        let root = self.store.root().to_path_buf();
        let orphans = tokio::task::spawn_blocking(move || {
            stale_orphans(&root, &live_sessions, now_ms, abandon_ms)
        })
        .await
        .unwrap_or_default();

        for session_id in orphans {
            self.store.discard(&session_id).await;
            report.orphans += 1;
        }

        report
    }

    /// Fail a job and drop its session. False when the job already finished.
    async fn fail(&self, job_id: &str, session_id: &str, reason: String) -> bool {
        match self
            .queue
            .update_job_status(job_id, JobStatus::Failed, StatusPatch::error(reason))
            .await
        {
            Ok(true) => {
                self.store.discard(session_id).await;
                true
            }
            _ => false,
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Session directories not in `live` whose last change is older than `max_age_ms`
fn stale_orphans(
    root: &std::path::Path,
    live: &HashSet<String>,
    now_ms: i64,
    max_age_ms: i64,
) -> Vec<String> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_string();
            if live.contains(&name) {
                return None;
            }
            let modified = e.metadata().ok()?.modified().ok()?;
            let modified_ms = modified.duration_since(UNIX_EPOCH).ok()?.as_millis() as i64;
            (now_ms.saturating_sub(modified_ms) > max_age_ms).then_some(name)
        })
        .collect()
}

/// Wait for Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
