//! Messages exchanged between the pool and worker processes.
//!
//! Each message is one JSON object per line. Pool to worker on the worker's
//! stdin, worker to pool on its stdout.

use crate::encode::{EncodeParams, EncoderId};
use crate::jobs::current_timestamp_ms;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything a worker needs to encode one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodeJob {
    pub job_id: String,
    pub session_id: String,
    pub session_dir: PathBuf,
    pub fps: u32,
    pub encoder: EncoderId,
    pub quality: u8,
    pub total_frames: u64,
    pub audio_path: Option<PathBuf>,
    pub output_path: PathBuf,
    /// Thread cap for software encodes.
    pub threads: Option<u32>,
}

impl EncodeJob {
    pub fn encode_params(&self, ffmpeg_path: &str) -> EncodeParams {
        EncodeParams {
            ffmpeg_path: ffmpeg_path.to_string(),
            session_dir: self.session_dir.clone(),
            fps: self.fps,
            encoder: self.encoder,
            quality: self.quality,
            audio_path: self.audio_path.clone(),
            output_path: self.output_path.clone(),
            threads: self.threads,
        }
    }
}

/// Pool to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MainMessage {
    StartJob { job: EncodeJob },
    CancelJob,
    Shutdown,
}

/// What a worker reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerEvent {
    #[serde(rename_all = "camelCase")]
    Started { job_id: String },

    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: String,
        progress: u8,
        current_frame: u64,
        total_frames: u64,
        encoding_speed: Option<f32>,
    },

    #[serde(rename_all = "camelCase")]
    Heartbeat { job_id: String },

    /// Resident memory of the worker and its encoder, in bytes.
    #[serde(rename_all = "camelCase")]
    MemoryWarning { job_id: String, memory_usage: u64 },

    #[serde(rename_all = "camelCase")]
    Complete {
        job_id: String,
        output_path: PathBuf,
        output_size: u64,
    },

    #[serde(rename_all = "camelCase")]
    Error { job_id: String, error: String },
}

impl WorkerEvent {
    pub fn job_id(&self) -> &str {
        match self {
            WorkerEvent::Started { job_id }
            | WorkerEvent::Progress { job_id, .. }
            | WorkerEvent::Heartbeat { job_id }
            | WorkerEvent::MemoryWarning { job_id, .. }
            | WorkerEvent::Complete { job_id, .. }
            | WorkerEvent::Error { job_id, .. } => job_id,
        }
    }

    /// COMPLETE and ERROR end the worker's current job.
    pub fn ends_job(&self) -> bool {
        matches!(
            self,
            WorkerEvent::Complete { .. } | WorkerEvent::Error { .. }
        )
    }
}

/// Worker to pool, stamped with sender and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMessage {
    pub worker_id: usize,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: WorkerEvent,
}

impl WorkerMessage {
    pub fn new(worker_id: usize, event: WorkerEvent) -> Self {
        Self {
            worker_id,
            timestamp: current_timestamp_ms(),
            event,
        }
    }
}

/// Serialize a message as one line, without the trailing newline.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}

/// Parse one line into a message.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_job() -> EncodeJob {
        EncodeJob {
            job_id: "j1".to_string(),
            session_id: "s1".to_string(),
            session_dir: PathBuf::from("/tmp/s1"),
            fps: 24,
            encoder: EncoderId::Nvenc,
            quality: 20,
            total_frames: 48,
            audio_path: Some(PathBuf::from("/tmp/s1/audio.wav")),
            output_path: PathBuf::from("/tmp/s1/output.mp4"),
            threads: None,
        }
    }

    #[test]
    fn test_worker_message_wire_shape() {
        let msg = WorkerMessage {
            worker_id: 1,
            timestamp: 1_700_000_000_000,
            event: WorkerEvent::Progress {
                job_id: "j1".to_string(),
                progress: 42,
                current_frame: 42,
                total_frames: 100,
                encoding_speed: Some(1.5),
            },
        };

        let value: serde_json::Value = serde_json::from_str(&encode_line(&msg).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "workerId": 1,
                "timestamp": 1_700_000_000_000i64,
                "type": "PROGRESS",
                "jobId": "j1",
                "progress": 42,
                "currentFrame": 42,
                "totalFrames": 100,
                "encodingSpeed": 1.5
            })
        );
    }

    #[test]
    fn test_memory_warning_tag() {
        let line = r#"{"workerId":2,"timestamp":5,"type":"MEMORY_WARNING","jobId":"j","memoryUsage":1024}"#;
        let msg: WorkerMessage = decode_line(line).unwrap();
        assert_eq!(msg.worker_id, 2);
        assert_eq!(
            msg.event,
            WorkerEvent::MemoryWarning {
                job_id: "j".to_string(),
                memory_usage: 1024
            }
        );
    }

    #[test]
    fn test_worker_events_parse_back() {
        let events = vec![
            WorkerEvent::Started { job_id: "a".into() },
            WorkerEvent::Heartbeat { job_id: "a".into() },
            WorkerEvent::Complete {
                job_id: "a".into(),
                output_path: PathBuf::from("/x/output.mp4"),
                output_size: 99,
            },
            WorkerEvent::Error {
                job_id: "a".into(),
                error: "boom".into(),
            },
        ];

        for event in events {
            let msg = WorkerMessage::new(3, event.clone());
            let parsed: WorkerMessage = decode_line(&encode_line(&msg).unwrap()).unwrap();
            assert_eq!(parsed.event, event);
            assert_eq!(parsed.event.job_id(), "a");
        }
    }

    #[test]
    fn test_main_message_wire_shape() {
        assert_eq!(
            encode_line(&MainMessage::CancelJob).unwrap(),
            r#"{"type":"CANCEL_JOB"}"#
        );
        assert_eq!(
            encode_line(&MainMessage::Shutdown).unwrap(),
            r#"{"type":"SHUTDOWN"}"#
        );

        let start = MainMessage::StartJob { job: make_job() };
        let value: serde_json::Value = serde_json::to_value(&start).unwrap();
        assert_eq!(value["type"], "START_JOB");
        assert_eq!(value["job"]["totalFrames"], 48);
        assert_eq!(value["job"]["encoder"], "nvenc");
        assert_eq!(decode_line::<MainMessage>(&value.to_string()).unwrap(), start);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(decode_line::<MainMessage>(r#"{"type":"REBOOT"}"#).is_err());
        assert!(decode_line::<WorkerMessage>("garbage").is_err());
    }

    #[test]
    fn test_ends_job() {
        assert!(WorkerEvent::Error { job_id: "a".into(), error: "e".into() }.ends_job());
        assert!(!WorkerEvent::Heartbeat { job_id: "a".into() }.ends_job());
    }

    #[test]
    fn test_encode_params_from_job() {
        let params = make_job().encode_params("/usr/bin/ffmpeg");
        assert_eq!(params.ffmpeg_path, "/usr/bin/ffmpeg");
        assert_eq!(params.fps, 24);
        assert_eq!(params.encoder, EncoderId::Nvenc);
        assert_eq!(params.output_path, PathBuf::from("/tmp/s1/output.mp4"));
    }
}
