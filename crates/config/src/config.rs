//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the API binds to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port the API listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interval between SSE keep-alive comments
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_keep_alive_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Upload session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionsConfig {
    /// Directory holding one sub-directory per session
    #[serde(default = "default_sessions_root")]
    pub root_dir: PathBuf,
    /// Frames smaller than this are treated as truncated writes
    #[serde(default = "default_min_frame_bytes")]
    pub min_frame_bytes: u64,
    /// Largest single frame accepted by a chunk upload
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u64,
    /// Largest number of frames accepted in one chunk
    #[serde(default = "default_max_frames_per_chunk")]
    pub max_frames_per_chunk: usize,
    /// Largest `totalFrames` a finalize may declare
    #[serde(default = "default_max_total_frames")]
    pub max_total_frames: u64,
    /// Sessions idle in pending/uploading longer than this are abandoned
    #[serde(default = "default_abandon_after_secs")]
    pub abandon_after_secs: u64,
    /// Terminal jobs are forgotten after this long
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// How often the janitor sweeps sessions
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_sessions_root() -> PathBuf {
    env::temp_dir().join("framecast-sessions")
}

fn default_min_frame_bytes() -> u64 {
    100
}

fn default_max_frame_bytes() -> u64 {
    25 * 1024 * 1024
}

fn default_max_frames_per_chunk() -> usize {
    500
}

fn default_max_total_frames() -> u64 {
    1_000_000
}

fn default_abandon_after_secs() -> u64 {
    3600
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            root_dir: default_sessions_root(),
            min_frame_bytes: default_min_frame_bytes(),
            max_frame_bytes: default_max_frame_bytes(),
            max_frames_per_chunk: default_max_frames_per_chunk(),
            max_total_frames: default_max_total_frames(),
            abandon_after_secs: default_abandon_after_secs(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Maximum worker processes (0 = auto-derive)
    #[serde(default)]
    pub max_workers: u32,
    /// Delay before a crashed worker is replaced
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// How long shutdown waits for workers to exit on their own
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Interval between worker heartbeats while a job runs
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A busy worker silent for longer than this is killed
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Interval between worker memory samples
    #[serde(default = "default_memory_check_interval_ms")]
    pub memory_check_interval_ms: u64,
    /// Resident memory above which a worker reports a warning
    #[serde(default = "default_memory_warning_mb")]
    pub memory_warning_mb: u64,
    /// Resident memory above which a worker aborts its encode
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
}

fn default_restart_delay_ms() -> u64 {
    2000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_timeout_ms() -> u64 {
    30000
}

fn default_memory_check_interval_ms() -> u64 {
    10000
}

fn default_memory_warning_mb() -> u64 {
    1536
}

fn default_memory_limit_mb() -> u64 {
    4096
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            restart_delay_ms: default_restart_delay_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            memory_check_interval_ms: default_memory_check_interval_ms(),
            memory_warning_mb: default_memory_warning_mb(),
            memory_limit_mb: default_memory_limit_mb(),
        }
    }
}

/// Encoding tool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// ffmpeg executable
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// ffprobe executable, used by the output quality check
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// "auto" or an encoder id (nvenc, qsv, amf, libx264)
    #[serde(default = "default_preferred")]
    pub preferred: String,
    /// Quality used when a session does not pick one (lower is better)
    #[serde(default = "default_quality")]
    pub default_quality: u8,
    /// Framerate used when a session does not pick one
    #[serde(default = "default_fps")]
    pub default_fps: u32,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_preferred() -> String {
    "auto".to_string()
}

fn default_quality() -> u8 {
    23
}

fn default_fps() -> u32 {
    30
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            preferred: default_preferred(),
            default_quality: default_quality(),
            default_fps: default_fps(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FRAMECAST_BIND -> server.bind
    /// - FRAMECAST_PORT -> server.port
    /// - FRAMECAST_SESSIONS_DIR -> sessions.root_dir
    /// - FRAMECAST_MAX_WORKERS -> pool.max_workers
    /// - FRAMECAST_FFMPEG -> encoder.ffmpeg_path
    /// - FRAMECAST_FFPROBE -> encoder.ffprobe_path
    /// - FRAMECAST_ENCODER -> encoder.preferred
    /// - FRAMECAST_LOG_LEVEL -> logging.level
    /// - FRAMECAST_LOG_FORMAT -> logging.format
    ///
    /// Values that fail to parse leave the existing setting untouched.
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = non_empty_var("FRAMECAST_BIND") {
            self.server.bind = val;
        }

        if let Some(val) = non_empty_var("FRAMECAST_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Some(val) = non_empty_var("FRAMECAST_SESSIONS_DIR") {
            self.sessions.root_dir = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("FRAMECAST_MAX_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.pool.max_workers = workers;
            }
        }

        if let Some(val) = non_empty_var("FRAMECAST_FFMPEG") {
            self.encoder.ffmpeg_path = val;
        }

        if let Some(val) = non_empty_var("FRAMECAST_FFPROBE") {
            self.encoder.ffprobe_path = val;
        }

        if let Some(val) = non_empty_var("FRAMECAST_ENCODER") {
            self.encoder.preferred = val.to_lowercase();
        }

        if let Some(val) = non_empty_var("FRAMECAST_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Some(val) = non_empty_var("FRAMECAST_LOG_FORMAT") {
            match val.to_lowercase().as_str() {
                "json" => self.logging.format = "json".to_string(),
                "pretty" => self.logging.format = "pretty".to_string(),
                _ => {} // Unknown format, keep existing
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from an optional file
    ///
    /// Without a path the defaults are used; environment overrides apply either way.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "FRAMECAST_BIND",
        "FRAMECAST_PORT",
        "FRAMECAST_SESSIONS_DIR",
        "FRAMECAST_MAX_WORKERS",
        "FRAMECAST_FFMPEG",
        "FRAMECAST_FFPROBE",
        "FRAMECAST_ENCODER",
        "FRAMECAST_LOG_LEVEL",
        "FRAMECAST_LOG_FORMAT",
    ];

    fn clear_env_vars() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            port in 1u16..u16::MAX,
            max_workers in 0u32..16,
            restart_delay_ms in 0u64..60_000,
            quality in 0u8..52,
            fps in 1u32..240,
            min_frame_bytes in 0u64..10_000,
        ) {
            let toml_str = format!(
                r#"
[server]
port = {}

[sessions]
min_frame_bytes = {}

[pool]
max_workers = {}
restart_delay_ms = {}

[encoder]
default_quality = {}
default_fps = {}
"#,
                port, min_frame_bytes, max_workers, restart_delay_ms, quality, fps
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.server.port, port);
            prop_assert_eq!(config.sessions.min_frame_bytes, min_frame_bytes);
            prop_assert_eq!(config.pool.max_workers, max_workers);
            prop_assert_eq!(config.pool.restart_delay_ms, restart_delay_ms);
            prop_assert_eq!(config.encoder.default_quality, quality);
            prop_assert_eq!(config.encoder.default_fps, fps);
            // Untouched fields keep their defaults
            prop_assert_eq!(config.pool.shutdown_grace_ms, 5000);
            prop_assert_eq!(&config.logging.level, "info");
        }

        #[test]
        fn prop_env_overrides_max_workers(
            initial in 0u32..8,
            override_workers in 0u32..16,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[pool]\nmax_workers = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("FRAMECAST_MAX_WORKERS", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.pool.max_workers, override_workers);
        }

        #[test]
        fn prop_env_overrides_port(
            initial in 1u16..u16::MAX,
            override_port in 1u16..u16::MAX,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[server]\nport = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("FRAMECAST_PORT", override_port.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.server.port, override_port);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 7878);
        assert_eq!(config.pool.max_workers, 0);
        assert_eq!(config.pool.restart_delay_ms, 2000);
        assert_eq!(config.sessions.min_frame_bytes, 100);
        assert_eq!(config.sessions.max_total_frames, 1_000_000);
        assert_eq!(config.encoder.preferred, "auto");
        assert_eq!(config.encoder.default_quality, 23);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("FRAMECAST_PORT", "not-a-port");
        env::set_var("FRAMECAST_LOG_FORMAT", "xml");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.server.port, 7878);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_env_overrides_paths_and_encoder() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("FRAMECAST_SESSIONS_DIR", "/srv/framecast");
        env::set_var("FRAMECAST_FFMPEG", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("FRAMECAST_ENCODER", "NVENC");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.sessions.root_dir, PathBuf::from("/srv/framecast"));
        assert_eq!(config.encoder.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.encoder.preferred, "nvenc");
    }

    #[test]
    fn test_load_optional_without_path_uses_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_optional(None).expect("defaults always load");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = Config::load("/nonexistent/framecast/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
