//! ffmpeg command construction and output parsing
//!
//! Builds the image-sequence encode command, splits ffmpeg's stats stream into
//! lines, and turns `frame=` counters into monotonically increasing progress.

use crate::encode::strategy::{args_for, EncoderId};
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tokio_util::codec::{Decoder, FramedRead};

/// printf-style pattern of frame files inside a session directory.
pub const FRAME_PATTERN: &str = "frame_%06d.png";

/// Name of the encoded file inside a session directory.
pub const OUTPUT_FILE_NAME: &str = "output.mp4";

/// Stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// ffmpeg could not be started
    #[error("failed to start ffmpeg: {0}")]
    Spawn(std::io::Error),

    /// ffmpeg exited with non-zero status
    #[error("ffmpeg exited with code {code}: {detail}")]
    Failed { code: i32, detail: String },

    /// ffmpeg was terminated by a signal
    #[error("ffmpeg was terminated by signal")]
    Terminated,

    /// ffmpeg reported success but wrote nothing
    #[error("output file missing: {0}")]
    OutputMissing(PathBuf),

    /// ffmpeg reported success but the output is empty
    #[error("output file is empty: {0}")]
    OutputEmpty(PathBuf),

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parameters for one image-sequence encode
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// ffmpeg executable
    pub ffmpeg_path: String,
    /// Directory holding the numbered frames
    pub session_dir: PathBuf,
    /// Input framerate
    pub fps: u32,
    /// Backend chosen for this job
    pub encoder: EncoderId,
    /// Abstract quality, lower is better
    pub quality: u8,
    /// Optional soundtrack
    pub audio_path: Option<PathBuf>,
    /// Where the encoded file is written
    pub output_path: PathBuf,
    /// Thread cap for the software encoder
    pub threads: Option<u32>,
}

/// Build the ffmpeg command for an image-sequence encode
///
/// Pixel format and color flags are fixed regardless of backend so hardware
/// and software paths produce visually identical output.
pub fn build_ffmpeg_command(params: &EncodeParams) -> Command {
    let mut cmd = Command::new(&params.ffmpeg_path);

    cmd.args(["-hide_banner", "-nostdin", "-y", "-loglevel", "error", "-stats"]);

    // Frame sequence input
    cmd.arg("-framerate").arg(params.fps.to_string());
    cmd.arg("-start_number").arg("0");
    cmd.arg("-i").arg(params.session_dir.join(FRAME_PATTERN));

    if let Some(audio) = &params.audio_path {
        cmd.arg("-i").arg(audio);
    }

    cmd.args(args_for(params.encoder, params.quality));

    if !params.encoder.is_hardware() {
        if let Some(threads) = params.threads {
            cmd.arg("-threads").arg(threads.to_string());
        }
    }

    cmd.args([
        "-pix_fmt",
        "yuv420p",
        "-colorspace",
        "bt709",
        "-color_primaries",
        "bt709",
        "-color_trc",
        "bt709",
        "-color_range",
        "tv",
    ]);

    if params.audio_path.is_some() {
        cmd.args(["-c:a", "aac", "-b:a", "192k", "-shortest"]);
    }

    cmd.args(["-movflags", "+faststart"]);
    cmd.arg(&params.output_path);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    cmd
}

/// Splits ffmpeg's stderr on `\r` as well as `\n`.
///
/// ffmpeg redraws its stats line with carriage returns, so a plain line
/// reader would only see progress once the encode finished.
#[derive(Debug, Default)]
pub struct StatsLineCodec;

impl Decoder for StatsLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\r' || *b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(pos);
            src.advance(1);
            if !line.is_empty() {
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

/// One reading from ffmpeg's stats line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    /// Frames written so far
    pub frame: u64,
    /// Encode speed relative to realtime, if reported
    pub speed: Option<f32>,
}

/// Extract the frame counter and speed from a stats line
///
/// Tolerates ffmpeg's column padding (`frame=  120`) and `speed=N/A`.
/// Returns None for lines without a frame counter.
pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    let frame = value_after(line, "frame=")?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse::<u64>()
        .ok()?;

    let speed = value_after(line, "speed=").and_then(|rest| {
        rest.chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect::<String>()
            .parse::<f32>()
            .ok()
    });

    Some(ProgressSample { frame, speed })
}

fn value_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    Some(line[start..].trim_start())
}

/// Progress worth reporting
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    /// Rounded percentage, 0-99
    pub progress: u8,
    pub current_frame: u64,
    pub speed: Option<f32>,
}

/// Converts frame counters into percentages, reporting only increases.
///
/// Percentages stop at 99; 100 is reserved for a verified, complete output.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_frames: u64,
    last_percent: Option<u8>,
}

impl ProgressTracker {
    pub fn new(total_frames: u64) -> Self {
        Self {
            total_frames,
            last_percent: None,
        }
    }

    /// Returns an update when the rounded percentage strictly increased.
    pub fn observe(&mut self, sample: ProgressSample) -> Option<ProgressUpdate> {
        if self.total_frames == 0 {
            return None;
        }

        let ratio = sample.frame.min(self.total_frames) as f64 / self.total_frames as f64;
        let percent = ((ratio * 100.0).round() as u8).min(99);

        if self.last_percent.is_some_and(|last| percent <= last) {
            return None;
        }
        self.last_percent = Some(percent);

        Some(ProgressUpdate {
            progress: percent,
            current_frame: sample.frame.min(self.total_frames),
            speed: sample.speed,
        })
    }
}

/// Last few stderr lines, for error messages
#[derive(Debug, Default)]
pub struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    pub fn push(&mut self, line: &str) {
        // Stats lines carry no diagnostic value once the encode failed
        if line.contains("frame=") {
            return;
        }
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.trim().to_string());
    }

    pub fn summary(&self) -> String {
        if self.lines.is_empty() {
            "no diagnostic output".to_string()
        } else {
            self.lines.iter().cloned().collect::<Vec<_>>().join("; ")
        }
    }
}

/// Map a non-success exit status to an error
pub fn exit_error(status: std::process::ExitStatus, tail: &StderrTail) -> EncodeError {
    match status.code() {
        Some(code) => EncodeError::Failed {
            code,
            detail: tail.summary(),
        },
        None => EncodeError::Terminated,
    }
}

/// Check that ffmpeg actually produced output; returns its size
pub fn check_output(path: &Path) -> Result<u64, EncodeError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EncodeError::OutputMissing(path.to_path_buf()))
        }
        Err(e) => return Err(EncodeError::Io(e)),
    };

    if metadata.len() == 0 {
        return Err(EncodeError::OutputEmpty(path.to_path_buf()));
    }

    Ok(metadata.len())
}

/// Run an encode to completion without progress reporting
///
/// Used by the synchronous finalize path. Returns the output size.
pub async fn run_encode(params: &EncodeParams) -> Result<u64, EncodeError> {
    let mut child = tokio::process::Command::from(build_ffmpeg_command(params))
        .kill_on_drop(true)
        .spawn()
        .map_err(EncodeError::Spawn)?;

    let mut tail = StderrTail::default();
    if let Some(stderr) = child.stderr.take() {
        let mut lines = FramedRead::new(stderr, StatsLineCodec);
        while let Some(line) = lines.next().await {
            tail.push(&line?);
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(exit_error(status, &tail));
    }

    check_output(&params.output_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn make_params(encoder: EncoderId, audio: bool) -> EncodeParams {
        EncodeParams {
            ffmpeg_path: "ffmpeg".to_string(),
            session_dir: PathBuf::from("/tmp/sessions/abc"),
            fps: 30,
            encoder,
            quality: 23,
            audio_path: audio.then(|| PathBuf::from("/tmp/sessions/abc/audio.mp3")),
            output_path: PathBuf::from("/tmp/sessions/abc/output.mp4"),
            threads: Some(4),
        }
    }

    fn encoder_strategy() -> impl Strategy<Value = EncoderId> {
        prop_oneof![
            Just(EncoderId::Nvenc),
            Just(EncoderId::Qsv),
            Just(EncoderId::Amf),
            Just(EncoderId::Libx264),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // The color pipeline is identical whichever backend encodes.
        #[test]
        fn prop_command_fixes_pixel_format_for_every_backend(
            encoder in encoder_strategy(),
            fps in 1u32..120,
            with_audio in proptest::bool::ANY,
        ) {
            let mut params = make_params(encoder, with_audio);
            params.fps = fps;
            let args = get_command_args(&build_ffmpeg_command(&params));

            prop_assert!(has_flag_with_value(&args, "-framerate", &fps.to_string()));
            prop_assert!(has_flag_with_value(&args, "-pix_fmt", "yuv420p"));
            prop_assert!(has_flag_with_value(&args, "-colorspace", "bt709"));
            prop_assert!(has_flag_with_value(&args, "-color_primaries", "bt709"));
            prop_assert!(has_flag_with_value(&args, "-color_trc", "bt709"));
            prop_assert!(has_flag_with_value(&args, "-c:v", encoder.codec_name()));
            prop_assert_eq!(args.last().map(String::as_str), Some("/tmp/sessions/abc/output.mp4"));
            prop_assert_eq!(args.iter().any(|a| a == "-shortest"), with_audio);
        }

        // Reported percentages strictly increase and never reach 100.
        #[test]
        fn prop_tracker_is_strictly_increasing(
            total in 1u64..10_000,
            frames in prop::collection::vec(0u64..12_000, 1..200),
        ) {
            let mut tracker = ProgressTracker::new(total);
            let mut last: Option<u8> = None;
            for frame in frames {
                if let Some(update) = tracker.observe(ProgressSample { frame, speed: None }) {
                    prop_assert!(update.progress <= 99);
                    if let Some(prev) = last {
                        prop_assert!(update.progress > prev);
                    }
                    last = Some(update.progress);
                }
            }
        }
    }

    #[test]
    fn test_command_inputs() {
        let cmd = build_ffmpeg_command(&make_params(EncoderId::Libx264, true));
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), "ffmpeg");
        assert!(has_flag_with_value(
            &args,
            "-i",
            "/tmp/sessions/abc/frame_%06d.png"
        ));
        assert!(has_flag_with_value(
            &args,
            "-i",
            "/tmp/sessions/abc/audio.mp3"
        ));
        assert!(has_flag_with_value(&args, "-start_number", "0"));
        assert!(has_flag_with_value(&args, "-crf", "23"));
        assert!(has_flag_with_value(&args, "-threads", "4"));
    }

    #[test]
    fn test_hardware_command_has_no_thread_cap() {
        let args = get_command_args(&build_ffmpeg_command(&make_params(EncoderId::Nvenc, false)));
        assert!(!args.iter().any(|a| a == "-threads"));
        assert!(!args.iter().any(|a| a == "-c:a"));
    }

    #[test]
    fn test_parse_progress_line() {
        let line = "frame=  120 fps= 60 q=23.0 size=     512kB time=00:00:04.00 bitrate=1048.6kbits/s speed=1.95x";
        assert_eq!(
            parse_progress_line(line),
            Some(ProgressSample {
                frame: 120,
                speed: Some(1.95)
            })
        );
    }

    #[test]
    fn test_parse_progress_line_speed_unavailable() {
        let line = "frame=    0 fps=0.0 q=0.0 size=       0kB time=N/A bitrate=N/A speed=N/A";
        assert_eq!(
            parse_progress_line(line),
            Some(ProgressSample {
                frame: 0,
                speed: None
            })
        );
    }

    #[test]
    fn test_parse_progress_line_ignores_other_output() {
        assert_eq!(parse_progress_line("Input #0, image2, from 'frame_%06d.png':"), None);
        assert_eq!(parse_progress_line("frame=abc"), None);
        assert_eq!(parse_progress_line(""), None);
    }

    #[test]
    fn test_tracker_reports_each_percentage_once() {
        let mut tracker = ProgressTracker::new(200);
        let sample = |frame| ProgressSample { frame, speed: Some(1.0) };

        assert_eq!(tracker.observe(sample(2)).map(|u| u.progress), Some(1));
        assert_eq!(tracker.observe(sample(2)), None);
        assert_eq!(tracker.observe(sample(3)).map(|u| u.progress), Some(2));
        assert_eq!(tracker.observe(sample(4)).map(|u| u.progress), None);
    }

    #[test]
    fn test_tracker_caps_at_99_and_ignores_regressions() {
        let mut tracker = ProgressTracker::new(10);
        let sample = |frame| ProgressSample { frame, speed: None };

        assert_eq!(tracker.observe(sample(5)).map(|u| u.progress), Some(50));
        assert_eq!(tracker.observe(sample(4)), None);
        let last = tracker.observe(sample(10)).expect("increase is reported");
        assert_eq!(last.progress, 99);
        assert_eq!(last.current_frame, 10);
        assert_eq!(tracker.observe(sample(10)), None);
    }

    #[test]
    fn test_tracker_without_total_reports_nothing() {
        let mut tracker = ProgressTracker::new(0);
        assert_eq!(tracker.observe(ProgressSample { frame: 10, speed: None }), None);
    }

    #[test]
    fn test_stats_codec_splits_carriage_returns() {
        let mut codec = StatsLineCodec;
        let mut buf = BytesMut::from(&b"frame=1 speed=1x\rframe=2 speed=1x\r\nError opening\npartial"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("frame=1 speed=1x"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("frame=2 speed=1x"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("Error opening"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("partial"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let mut tail = StderrTail::default();
        assert_eq!(tail.summary(), "no diagnostic output");

        for i in 0..20 {
            tail.push(&format!("line {}", i));
        }
        tail.push("frame=10 speed=1x");

        let summary = tail.summary();
        assert!(summary.starts_with("line 12"));
        assert!(summary.ends_with("line 19"));
        assert!(!summary.contains("frame="));
    }

    #[test]
    fn test_check_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("output.mp4");

        assert!(matches!(check_output(&path), Err(EncodeError::OutputMissing(_))));

        std::fs::write(&path, b"").unwrap();
        assert!(matches!(check_output(&path), Err(EncodeError::OutputEmpty(_))));

        std::fs::write(&path, b"0123456789").unwrap();
        assert_eq!(check_output(&path).unwrap(), 10);
    }

    #[tokio::test]
    async fn test_run_encode_missing_binary() {
        let mut params = make_params(EncoderId::Libx264, false);
        params.ffmpeg_path = "/nonexistent/bin/ffmpeg-framecast".to_string();

        let result = run_encode(&params).await;
        assert!(matches!(result, Err(EncodeError::Spawn(_))));
    }
}
