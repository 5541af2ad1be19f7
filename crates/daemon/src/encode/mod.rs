//! Encoding: backend selection and ffmpeg invocation

pub mod ffmpeg;
pub mod strategy;

pub use ffmpeg::{
    build_ffmpeg_command, check_output, exit_error, parse_progress_line, run_encode, EncodeError,
    EncodeParams, ProgressSample, ProgressTracker, ProgressUpdate, StatsLineCodec, StderrTail,
    FRAME_PATTERN, OUTPUT_FILE_NAME,
};
pub use strategy::{
    args_for, detect, CapabilityProbe, EncoderId, EncoderSelection, FfmpegProbe, ProbeError,
};
