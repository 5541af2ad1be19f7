//! Encoder strategy
//!
//! Picks a video encoding backend by probing ffmpeg's encoder list and maps the
//! abstract `quality` value (lower is better, CRF-like 0-51 scale) onto the
//! rate-control flags of each backend. Both the worker process and the
//! synchronous finalize path build their encoder arguments from here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use std::str::FromStr;
use thiserror::Error;

/// Highest quality value ffmpeg's constant-quality modes accept.
pub const MAX_QUALITY: u8 = 51;

/// Error type for capability probing.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The encoding tool could not be started.
    #[error("failed to run encoder listing: {0}")]
    Spawn(#[from] std::io::Error),

    /// The encoding tool ran but reported failure.
    #[error("encoder listing exited with status {0}")]
    Failed(String),
}

/// Error returned when an encoder name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown encoder '{0}'")]
pub struct UnknownEncoder(pub String);

/// A video encoding backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderId {
    /// NVIDIA NVENC.
    Nvenc,
    /// Intel Quick Sync Video.
    Qsv,
    /// AMD Advanced Media Framework.
    Amf,
    /// Software x264, always available.
    Libx264,
}

impl EncoderId {
    /// Detection order: first available wins.
    pub const PREFERENCE: [EncoderId; 4] = [
        EncoderId::Nvenc,
        EncoderId::Qsv,
        EncoderId::Amf,
        EncoderId::Libx264,
    ];

    /// The ffmpeg codec name for this backend.
    pub fn codec_name(&self) -> &'static str {
        match self {
            EncoderId::Nvenc => "h264_nvenc",
            EncoderId::Qsv => "h264_qsv",
            EncoderId::Amf => "h264_amf",
            EncoderId::Libx264 => "libx264",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, EncoderId::Libx264)
    }
}

impl fmt::Display for EncoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderId::Nvenc => write!(f, "nvenc"),
            EncoderId::Qsv => write!(f, "qsv"),
            EncoderId::Amf => write!(f, "amf"),
            EncoderId::Libx264 => write!(f, "libx264"),
        }
    }
}

impl FromStr for EncoderId {
    type Err = UnknownEncoder;

    /// Accepts the short id (`nvenc`) or the ffmpeg codec name (`h264_nvenc`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        EncoderId::PREFERENCE
            .iter()
            .find(|id| id.to_string() == lower || id.codec_name() == lower)
            .copied()
            .ok_or_else(|| UnknownEncoder(s.to_string()))
    }
}

/// Source of ffmpeg's encoder listing.
///
/// Split out so detection can be exercised without real hardware.
pub trait CapabilityProbe: Send + Sync {
    /// Returns the raw text of `ffmpeg -encoders`.
    fn list_encoders(&self) -> Result<String, ProbeError>;
}

/// Probes the host by running `<ffmpeg> -hide_banner -encoders`.
#[derive(Debug, Clone)]
pub struct FfmpegProbe {
    ffmpeg_path: String,
}

impl FfmpegProbe {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl CapabilityProbe for FfmpegProbe {
    fn list_encoders(&self) -> Result<String, ProbeError> {
        let output = Command::new(&self.ffmpeg_path)
            .args(["-hide_banner", "-encoders"])
            .output()?;

        if !output.status.success() {
            return Err(ProbeError::Failed(output.status.to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Outcome of encoder detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSelection {
    /// Backend jobs use unless they ask for another available one.
    pub selected: EncoderId,
    /// Every usable backend, in preference order. Always ends with libx264.
    pub available: Vec<EncoderId>,
}

impl EncoderSelection {
    /// Selection used when probing is impossible.
    pub fn software_only() -> Self {
        Self {
            selected: EncoderId::Libx264,
            available: vec![EncoderId::Libx264],
        }
    }

    pub fn is_available(&self, encoder: EncoderId) -> bool {
        self.available.contains(&encoder)
    }

    /// Resolves a configured preference ("auto" or an encoder id).
    ///
    /// Unknown or unavailable preferences fall back to the detected encoder.
    pub fn with_preference(mut self, preferred: &str) -> Self {
        if preferred.trim().eq_ignore_ascii_case("auto") {
            return self;
        }

        match preferred.parse::<EncoderId>() {
            Ok(id) if self.is_available(id) => self.selected = id,
            Ok(id) => tracing::warn!(
                encoder = %id,
                fallback = %self.selected,
                "preferred encoder not available on this host"
            ),
            Err(e) => tracing::warn!(error = %e, fallback = %self.selected, "ignoring encoder preference"),
        }
        self
    }
}

/// Extracts the known backends present in an `ffmpeg -encoders` listing.
///
/// Listing lines look like ` V....D h264_nvenc   NVIDIA NVENC H.264 encoder`;
/// a backend counts as present when its codec name appears as a whole token.
/// The software encoder is always included last.
pub fn parse_available_encoders(listing: &str) -> Vec<EncoderId> {
    let mut available: Vec<EncoderId> = EncoderId::PREFERENCE
        .iter()
        .filter(|id| id.is_hardware())
        .filter(|id| {
            listing
                .lines()
                .any(|line| line.split_whitespace().any(|token| token == id.codec_name()))
        })
        .copied()
        .collect();

    available.push(EncoderId::Libx264);
    available
}

/// Detects the best encoder on this host.
///
/// Detection failure is never fatal: the software encoder is returned instead.
pub fn detect(probe: &dyn CapabilityProbe) -> EncoderSelection {
    match probe.list_encoders() {
        Ok(listing) => {
            let available = parse_available_encoders(&listing);
            let selected = available[0];
            tracing::info!(
                encoder = %selected,
                available = ?available,
                "encoder detection finished"
            );
            EncoderSelection {
                selected,
                available,
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "encoder detection failed, using software encoder");
            EncoderSelection::software_only()
        }
    }
}

/// Backend-specific codec and rate-control arguments.
///
/// Each backend runs in its constant-quality mode so the same `quality`
/// gives comparable output whichever path is taken.
pub fn args_for(encoder: EncoderId, quality: u8) -> Vec<String> {
    let q_owned = backend_quality(encoder, quality).to_string();
    let q = q_owned.as_str();

    let args: Vec<&str> = match encoder {
        EncoderId::Nvenc => vec![
            "-c:v", "h264_nvenc", "-preset", "p5", "-rc", "vbr", "-cq", q, "-b:v", "0",
        ],
        EncoderId::Qsv => vec!["-c:v", "h264_qsv", "-preset", "medium", "-global_quality", q],
        EncoderId::Amf => vec![
            "-c:v", "h264_amf", "-quality", "quality", "-rc", "cqp", "-qp_i", q, "-qp_p", q,
            "-qp_b", q,
        ],
        EncoderId::Libx264 => vec!["-c:v", "libx264", "-preset", "medium", "-crf", q],
    };

    args.into_iter().map(String::from).collect()
}

/// `quality` clamped to the range `encoder` accepts. Hardware rate control
/// treats 0 as "pick for me" rather than best, so it starts at 1.
pub fn backend_quality(encoder: EncoderId, quality: u8) -> u8 {
    let min = if encoder.is_hardware() { 1 } else { 0 };
    quality.clamp(min, MAX_QUALITY)
}
