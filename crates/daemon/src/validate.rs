//! Frame sequence validation and output verification.
//!
//! Before a job is queued its session directory must hold every frame in
//! `[0, total)` and each frame must be above a minimum size. After an encode
//! the output is checked cheaply (`quick_validate`) or with ffprobe
//! (`verify_output_quality`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use walkdir::WalkDir;

use crate::session::parse_frame_index;

/// Most bad frame indices reported back to a client.
pub const MAX_REPORTED_FRAMES: usize = 10;

/// Smallest output considered a real video.
pub const MIN_OUTPUT_BYTES: u64 = 1024;

/// Error type for validation operations.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error while reading the session directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a sequence completeness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceReport {
    pub valid: bool,
    /// First missing indices, ascending, at most `MAX_REPORTED_FRAMES`.
    pub missing_frames: Vec<u64>,
}

/// Outcome of a per-frame size check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SizeReport {
    pub valid: bool,
    /// First undersized indices, ascending, at most `MAX_REPORTED_FRAMES`.
    pub undersized_frames: Vec<u64>,
}

/// Frame files present in a session directory, index -> size in bytes.
pub fn scan_frames(session_dir: &Path) -> Result<BTreeMap<u64, u64>, ValidationError> {
    let mut frames = BTreeMap::new();

    for entry in WalkDir::new(session_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            ValidationError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(index) = entry.file_name().to_str().and_then(parse_frame_index) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        frames.insert(index, size);
    }

    Ok(frames)
}

/// Check that every frame index in `[0, expected)` exists.
pub fn validate_sequence(
    session_dir: &Path,
    expected: u64,
) -> Result<SequenceReport, ValidationError> {
    let frames = scan_frames(session_dir)?;
    Ok(sequence_report(&frames, expected))
}

fn sequence_report(frames: &BTreeMap<u64, u64>, expected: u64) -> SequenceReport {
    let mut missing = Vec::new();

    // Present frames bound the walk: it ends after at most
    // `frames.len() + MAX_REPORTED_FRAMES` indices.
    for index in 0..expected {
        if !frames.contains_key(&index) {
            missing.push(index);
            if missing.len() == MAX_REPORTED_FRAMES {
                break;
            }
        }
    }

    SequenceReport {
        valid: missing.is_empty(),
        missing_frames: missing,
    }
}

/// Flag frames in `[0, expected)` smaller than `min_bytes`.
///
/// Stray frames past the end of the sequence are never read by the encoder
/// and are ignored.
pub fn validate_sizes(
    session_dir: &Path,
    expected: u64,
    min_bytes: u64,
) -> Result<SizeReport, ValidationError> {
    let frames = scan_frames(session_dir)?;

    let undersized: Vec<u64> = frames
        .range(..expected)
        .filter(|(_, size)| **size < min_bytes)
        .map(|(index, _)| *index)
        .take(MAX_REPORTED_FRAMES)
        .collect();

    Ok(SizeReport {
        valid: undersized.is_empty(),
        undersized_frames: undersized,
    })
}

/// Cheap post-encode check: file exists, is non-trivial and looks like MP4.
pub fn quick_validate(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() || metadata.len() < MIN_OUTPUT_BYTES {
        return false;
    }

    let mut header = [0u8; 8];
    match std::fs::File::open(path).and_then(|mut f| f.read_exact(&mut header)) {
        Ok(()) => &header[4..8] == b"ftyp",
        Err(_) => false,
    }
}

/// Summary of the encoded output as reported by ffprobe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProbe {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<String>,
    pub duration_secs: f64,
    pub frame_count: Option<u64>,
    pub has_audio: bool,
}

/// Result of full output verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    pub diagnostics: Vec<String>,
    pub probe: Option<OutputProbe>,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub pix_fmt: Option<String>,
        pub nb_frames: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parses ffprobe JSON output into an `OutputProbe`.
///
/// Fails when the output has no video stream.
pub fn parse_output_probe(json_str: &str) -> Result<OutputProbe, ValidationError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ValidationError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let has_audio = streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let video = streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ValidationError::ParseError("no video stream in output".to_string()))?;

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(OutputProbe {
        codec_name: video.codec_name.unwrap_or_default(),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        pix_fmt: video.pix_fmt,
        duration_secs,
        frame_count: video.nb_frames.and_then(|n| n.parse().ok()),
        has_audio,
    })
}

/// Judge a probed output against what the job asked for.
pub fn assess_output(probe: &OutputProbe, expected_frames: Option<u64>) -> Vec<String> {
    let mut problems = Vec::new();

    if probe.codec_name != "h264" {
        problems.push(format!("unexpected video codec {}", probe.codec_name));
    }
    if probe.width == 0 || probe.height == 0 {
        problems.push("video stream has no dimensions".to_string());
    }
    if let Some(pix_fmt) = &probe.pix_fmt {
        if pix_fmt != "yuv420p" {
            problems.push(format!("unexpected pixel format {}", pix_fmt));
        }
    }
    if probe.duration_secs <= 0.0 {
        problems.push("output has zero duration".to_string());
    }
    if let (Some(expected), Some(actual)) = (expected_frames, probe.frame_count) {
        // -shortest may trim the tail when the soundtrack is shorter
        if actual > expected {
            problems.push(format!(
                "output has {} frames, expected at most {}",
                actual, expected
            ));
        }
    }

    problems
}

/// Full post-encode verification using ffprobe.
pub fn verify_output_quality(
    ffprobe_path: &str,
    output_path: &Path,
    expected_frames: Option<u64>,
) -> QualityReport {
    if !quick_validate(output_path) {
        return QualityReport {
            passed: false,
            diagnostics: vec![format!(
                "{} is missing, too small or not an MP4 container",
                output_path.display()
            )],
            probe: None,
        };
    }

    match probe_output(ffprobe_path, output_path) {
        Ok(probe) => {
            let diagnostics = assess_output(&probe, expected_frames);
            QualityReport {
                passed: diagnostics.is_empty(),
                diagnostics,
                probe: Some(probe),
            }
        }
        Err(e) => QualityReport {
            passed: false,
            diagnostics: vec![e.to_string()],
            probe: None,
        },
    }
}

/// Runs `ffprobe -v error -print_format json -show_streams -show_format <path>`.
pub fn probe_output(ffprobe_path: &str, path: &Path) -> Result<OutputProbe, ValidationError> {
    let output = Command::new(ffprobe_path)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ValidationError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_output_probe(&stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::frame_path;
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn write_frames(dir: &Path, indices: &[u64], size: usize) {
        for i in indices {
            std::fs::write(frame_path(dir, *i), vec![7u8; size]).unwrap();
        }
    }

    fn fake_mp4(size: usize) -> Vec<u8> {
        let mut data = vec![0u8; size];
        data[..8].copy_from_slice(b"\x00\x00\x00\x18ftyp");
        data
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // The sequence is invalid exactly when some index below N is absent,
        // and the reported indices are the smallest absent ones.
        #[test]
        fn prop_sequence_valid_iff_complete(
            present in prop::collection::btree_set(0u64..60, 0..60),
            expected in 0u64..60,
        ) {
            let frames: BTreeMap<u64, u64> = present.iter().map(|i| (*i, 200)).collect();
            let report = sequence_report(&frames, expected);

            let absent: Vec<u64> = (0..expected).filter(|i| !present.contains(i)).collect();
            prop_assert_eq!(report.valid, absent.is_empty());
            let expected_report: Vec<u64> = absent.into_iter().take(MAX_REPORTED_FRAMES).collect();
            prop_assert_eq!(report.missing_frames, expected_report);
        }
    }

    #[test]
    fn test_validate_sequence_reports_gap() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), &[0, 1, 3, 4], 200);

        let report = validate_sequence(temp.path(), 5).unwrap();
        assert!(!report.valid);
        assert_eq!(report.missing_frames, vec![2]);
    }

    #[test]
    fn test_validate_sequence_tail_missing() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), &(0..8).collect::<Vec<_>>(), 200);

        let report = validate_sequence(temp.path(), 10).unwrap();
        assert_eq!(report.missing_frames, vec![8, 9]);
    }

    #[test]
    fn test_validate_sequence_caps_report() {
        let temp = TempDir::new().unwrap();
        let report = validate_sequence(temp.path(), 50).unwrap();
        assert!(!report.valid);
        assert_eq!(report.missing_frames, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_validate_sequence_ignores_other_files() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), &[0, 1], 200);
        std::fs::write(temp.path().join("audio.mp3"), b"x").unwrap();
        std::fs::write(temp.path().join("job.json"), b"{}").unwrap();
        std::fs::create_dir(temp.path().join("frame_000002.png")).unwrap();

        let report = validate_sequence(temp.path(), 3).unwrap();
        assert_eq!(report.missing_frames, vec![2]);
    }

    #[test]
    fn test_validate_sequence_huge_expected_returns_quickly() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), &[0, 1, 2], 200);

        let report = validate_sequence(temp.path(), u64::MAX / 2).unwrap();
        assert!(!report.valid);
        assert_eq!(report.missing_frames, (3..13).collect::<Vec<_>>());

        let report = validate_sequence(temp.path(), u64::MAX).unwrap();
        assert_eq!(report.missing_frames.len(), MAX_REPORTED_FRAMES);
    }

    #[test]
    fn test_validate_sizes() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), &[0, 2], 200);
        write_frames(temp.path(), &[1, 3], 20);

        let report = validate_sizes(temp.path(), 4, 100).unwrap();
        assert!(!report.valid);
        assert_eq!(report.undersized_frames, vec![1, 3]);

        let report = validate_sizes(temp.path(), 4, 10).unwrap();
        assert!(report.valid);
        assert!(report.undersized_frames.is_empty());
    }

    #[test]
    fn test_validate_sizes_ignores_frames_past_end() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), &[0, 1], 200);
        write_frames(temp.path(), &[2, 7], 20);

        let report = validate_sizes(temp.path(), 2, 100).unwrap();
        assert!(report.valid);

        let report = validate_sizes(temp.path(), 3, 100).unwrap();
        assert_eq!(report.undersized_frames, vec![2]);
    }

    #[test]
    fn test_scan_frames_sizes() {
        let temp = TempDir::new().unwrap();
        write_frames(temp.path(), &[4], 123);
        let frames = scan_frames(temp.path()).unwrap();
        assert_eq!(frames.keys().copied().collect::<BTreeSet<_>>(), BTreeSet::from([4]));
        assert_eq!(frames[&4], 123);
    }

    #[test]
    fn test_quick_validate() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output.mp4");

        assert!(!quick_validate(&path));

        std::fs::write(&path, fake_mp4(64)).unwrap();
        assert!(!quick_validate(&path), "too small");

        std::fs::write(&path, vec![1u8; 4096]).unwrap();
        assert!(!quick_validate(&path), "no ftyp box");

        std::fs::write(&path, fake_mp4(4096)).unwrap();
        assert!(quick_validate(&path));
    }

    #[test]
    fn test_verify_output_quality_rejects_missing_file() {
        let report = verify_output_quality("ffprobe", Path::new("/nonexistent/out.mp4"), None);
        assert!(!report.passed);
        assert!(report.probe.is_none());
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[test]
    fn test_parse_output_probe() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080,
                 "pix_fmt": "yuv420p", "nb_frames": "300"},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"duration": "10.000000"}
        }"#;

        let probe = parse_output_probe(json).unwrap();
        assert_eq!(probe.codec_name, "h264");
        assert_eq!((probe.width, probe.height), (1920, 1080));
        assert_eq!(probe.frame_count, Some(300));
        assert!(probe.has_audio);
        assert!((probe.duration_secs - 10.0).abs() < 0.001);
        assert!(assess_output(&probe, Some(300)).is_empty());
    }

    #[test]
    fn test_parse_output_probe_without_video() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {}}"#;
        assert!(matches!(
            parse_output_probe(json),
            Err(ValidationError::ParseError(_))
        ));
        assert!(parse_output_probe("not json").is_err());
    }

    #[test]
    fn test_assess_output_flags_problems() {
        let probe = OutputProbe {
            codec_name: "hevc".to_string(),
            width: 0,
            height: 0,
            pix_fmt: Some("yuv444p".to_string()),
            duration_secs: 0.0,
            frame_count: Some(20),
            has_audio: false,
        };
        let problems = assess_output(&probe, Some(10));
        assert_eq!(problems.len(), 5);
    }
}
