//! Error types and handling
//!
//! Common error types used across the recorder.

use serde::{Deserialize, Serialize};
use std::process::ExitStatus;
use thiserror::Error;

/// Recorder-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Capture failed for camera {camera_id} ({status}): {detail}")]
    CaptureFailed {
        camera_id: String,
        status: String,
        detail: String,
    },

    #[error("Camera not active: {0}")]
    CameraNotActive(String),

    #[error("Recording sink error: {0}")]
    Sink(String),
}

impl RecorderError {
    /// Build a `CaptureFailed` from a finished process
    pub fn capture_failed(camera_id: &str, status: ExitStatus, stderr: &[u8]) -> Self {
        RecorderError::CaptureFailed {
            camera_id: camera_id.to_string(),
            status: status.to_string(),
            detail: stderr_tail(stderr),
        }
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            RecorderError::Io(_) => "IO_ERROR",
            RecorderError::Serialization(_) => "SERIALIZATION_ERROR",
            RecorderError::Config(_) => "CONFIG_ERROR",
            RecorderError::Process(_) => "PROCESS_ERROR",
            RecorderError::CaptureFailed { .. } => "CAPTURE_FAILED",
            RecorderError::CameraNotActive(_) => "CAMERA_NOT_ACTIVE",
            RecorderError::Sink(_) => "SINK_ERROR",
        }
    }
}

/// Error response handed to external collaborators
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<RecorderError> for ErrorResponse {
    fn from(error: RecorderError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Last non-empty line of a tool's stderr, which is where ffmpeg puts the reason
pub fn stderr_tail(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no diagnostic output")
        .to_string()
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;
