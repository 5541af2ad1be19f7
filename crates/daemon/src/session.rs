//! Session directories
//!
//! Each export owns one directory under the sessions root, keyed by a
//! sanitized session id. Frames, the soundtrack, the encoded output and the
//! persisted job record all live there.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::encode::OUTPUT_FILE_NAME;

/// Longest session id accepted from clients.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Name of the persisted job record inside a session directory.
pub const JOB_FILE_NAME: &str = "job.json";

/// Base name of the uploaded soundtrack.
const AUDIO_STEM: &str = "audio";

/// Extension used when the upload carries none we recognise.
const DEFAULT_AUDIO_EXT: &str = "wav";

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "aac", "m4a", "ogg", "opus", "flac"];

/// Error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session id: {0:?}")]
    InvalidId(String),

    #[error("invalid frame file name: {0:?}")]
    InvalidFrameName(String),

    #[error("session directory not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Generate a fresh session id
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Validate a client-supplied session id
///
/// Only ASCII letters, digits, `-` and `_` are allowed, so an id can never
/// escape the sessions root.
pub fn sanitize_session_id(raw: &str) -> Result<String, SessionError> {
    let id = raw.trim();
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(id.to_string())
    } else {
        Err(SessionError::InvalidId(raw.to_string()))
    }
}

/// On-disk name of frame `index`
pub fn frame_file_name(index: u64) -> String {
    format!("frame_{:06}.png", index)
}

/// Extract the frame index from an uploaded file name
///
/// The index is the last run of digits before the `.png` extension, so
/// `frame_000012.png`, `12.png` and `shot-12.png` all name frame 12.
pub fn parse_frame_index(name: &str) -> Option<u64> {
    if name.contains('/') || name.contains('\\') {
        return None;
    }

    let (stem, ext) = name.rsplit_once('.')?;
    if !ext.eq_ignore_ascii_case("png") {
        return None;
    }

    let digits_end = stem.rfind(|c: char| c.is_ascii_digit())? + 1;
    let digits_start = stem[..digits_end]
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);

    stem[digits_start..digits_end].parse().ok()
}

/// Pick the stored extension for an uploaded soundtrack
pub fn audio_extension(file_name: Option<&str>) -> &'static str {
    file_name
        .and_then(|name| name.rsplit_once('.'))
        .and_then(|(_, ext)| {
            AUDIO_EXTENSIONS
                .iter()
                .find(|known| known.eq_ignore_ascii_case(ext))
                .copied()
        })
        .unwrap_or(DEFAULT_AUDIO_EXT)
}

/// Hex-encoded SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Layout of session directories under one root
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the sessions root if needed
    pub fn ensure_root(&self) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Directory for a session; the id must already be sanitized
    pub fn dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    /// Create a session directory
    pub fn create(&self, session_id: &str) -> Result<PathBuf, SessionError> {
        let id = sanitize_session_id(session_id)?;
        let dir = self.dir(&id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Directory of an existing session
    pub fn existing(&self, session_id: &str) -> Result<PathBuf, SessionError> {
        let id = sanitize_session_id(session_id)?;
        let dir = self.dir(&id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(SessionError::NotFound(dir))
        }
    }

    /// Delete a session directory and everything in it
    ///
    /// Removing an already-missing directory is not an error.
    pub fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let id = sanitize_session_id(session_id)?;
        match std::fs::remove_dir_all(self.dir(&id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a session directory off the async runtime, logging failures.
    pub async fn discard(&self, session_id: &str) {
        let store = self.clone();
        let id = session_id.to_string();
        match tokio::task::spawn_blocking(move || store.remove(&id)).await {
            Ok(Ok(())) => tracing::debug!(session_id, "session directory removed"),
            Ok(Err(e)) => {
                tracing::warn!(session_id, error = %e, "failed to remove session directory")
            }
            Err(e) => tracing::warn!(session_id, error = %e, "session cleanup task failed"),
        }
    }
}

/// Path of frame `index` inside a session directory
pub fn frame_path(session_dir: &Path, index: u64) -> PathBuf {
    session_dir.join(frame_file_name(index))
}

/// Path of the soundtrack with the given extension
pub fn audio_path(session_dir: &Path, ext: &str) -> PathBuf {
    session_dir.join(format!("{}.{}", AUDIO_STEM, ext))
}

/// Locate the stored soundtrack, whatever its extension
pub fn find_audio(session_dir: &Path) -> Option<PathBuf> {
    AUDIO_EXTENSIONS
        .iter()
        .map(|ext| audio_path(session_dir, ext))
        .find(|p| p.is_file())
}

/// Path of the encoded output
pub fn output_path(session_dir: &Path) -> PathBuf {
    session_dir.join(OUTPUT_FILE_NAME)
}

/// Path of the persisted job record
pub fn job_file_path(session_dir: &Path) -> PathBuf {
    session_dir.join(JOB_FILE_NAME)
}
