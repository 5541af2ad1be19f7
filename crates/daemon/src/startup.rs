//! Startup checks
//!
//! Preflight checks run before the server accepts requests:
//! - ffmpeg runs and reports a version
//! - ffprobe is present (only needed for synchronous finalize)
//! - the sessions root exists and is writable

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Sessions directory unusable: {0}")]
    SessionsRoot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the checks found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupReport {
    /// Major ffmpeg version, when it could be parsed
    pub ffmpeg_major: Option<u32>,
    pub ffprobe_available: bool,
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n7.0-... ..."
///
/// Git snapshot builds ("N-113684-g...") carry no release number and yield None.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that ffmpeg runs, by invoking `ffmpeg -version`
///
/// Returns the parsed major version. An unparseable version is only logged;
/// distribution and snapshot builds format it in many ways.
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegUnavailable(format!(
                "{} -version failed; is ffmpeg installed and in PATH? Error: {}",
                ffmpeg_path, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version exited with {}",
            ffmpeg_path, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output);
    match major {
        Some(major) => tracing::info!(ffmpeg = ffmpeg_path, major, "ffmpeg found"),
        None => tracing::warn!(
            ffmpeg = ffmpeg_path,
            first_line = version_output.lines().next().unwrap_or("(empty)"),
            "could not parse ffmpeg version"
        ),
    }

    Ok(major)
}

/// Check whether ffprobe runs. Missing ffprobe only disables output probing.
pub fn check_ffprobe_available(ffprobe_path: &str) -> bool {
    let ok = Command::new(ffprobe_path)
        .arg("-version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);

    if !ok {
        tracing::warn!(ffprobe = ffprobe_path, "ffprobe unavailable; synchronous finalize cannot verify output");
    }
    ok
}

/// Make sure the sessions root exists and accepts writes
pub fn check_sessions_root(root: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(root).map_err(|e| {
        StartupError::SessionsRoot(format!("cannot create {}: {}", root.display(), e))
    })?;

    let probe = root.join(".framecast-write-test");
    std::fs::write(&probe, b"ok").map_err(|e| {
        StartupError::SessionsRoot(format!("cannot write to {}: {}", root.display(), e))
    })?;
    std::fs::remove_file(&probe)?;

    Ok(())
}

/// Run all startup checks in order
///
/// 1. Sessions root
/// 2. ffmpeg (fatal)
/// 3. ffprobe (warning only)
pub fn run_startup_checks(cfg: &Config) -> Result<StartupReport, StartupError> {
    check_sessions_root(&cfg.sessions.root_dir)?;
    let ffmpeg_major = check_ffmpeg_available(&cfg.encoder.ffmpeg_path)?;
    let ffprobe_available = check_ffprobe_available(&cfg.encoder.ffprobe_path);

    Ok(StartupReport {
        ffmpeg_major,
        ffprobe_available,
    })
}
