//! framecast
//!
//! Render-job service: accepts uploaded frame sequences and a soundtrack,
//! encodes them into a video in isolated worker processes, and reports
//! progress over HTTP and server-sent events.

pub mod api;
pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod jobs;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod startup;
pub mod validate;
pub mod worker;

pub use framecast_config as config;
pub use framecast_config::Config;
pub use api::{create_router, ApiError, AppState};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{detect_encoders, Daemon, DaemonError, Janitor, SweepReport, STRANDED_REASON};
pub use encode::{
    args_for, build_ffmpeg_command, detect, run_encode, CapabilityProbe, EncodeError,
    EncodeParams, EncoderId, EncoderSelection, FfmpegProbe,
};
pub use jobs::{JobConfig, JobProgress, JobStatus, RenderJob, StatusPatch};
pub use metrics::{collect_system_metrics, SystemMetrics};
pub use pool::{PoolError, PoolSettings, PoolStats, ProcessLauncher, WorkerLauncher, WorkerPool};
pub use protocol::{EncodeJob, MainMessage, WorkerEvent, WorkerMessage};
pub use queue::{JobQueue, JobSubscription, QueueError, QueueStats};
pub use session::{SessionError, SessionStore};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError};
pub use validate::{
    quick_validate, validate_sequence, validate_sizes, verify_output_quality, ValidationError,
};
pub use worker::{run_worker, WorkerError, WorkerSettings};
