use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors produced by rollcap-core.
#[derive(Debug, Error)]
pub enum RollcapError {
    /// Encoder / device level failure. Fatal to the session.
    #[error("capture failure: {0}")]
    CaptureFailure(String),

    #[error("segment {index} I/O failure: {message}")]
    SegmentIo { index: u64, message: String },

    #[error("merge of segment {index} failed: {message}")]
    MergeFailure { index: u64, message: String },

    #[error("trim failure: {0}")]
    TrimFailure(String),

    #[error("retention invariant violated: {0}")]
    RetentionInvariantViolation(String),

    #[error("no active recording")]
    NoActiveRecording,

    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid audio chunk: {0}")]
    InvalidChunk(String),

    #[error("unexpected interruption signal: {0}")]
    UnexpectedSignal(String),

    #[error("stop timed out after {timeout_ms} ms waiting for the final merge")]
    StopTimedOut { timeout_ms: u64 },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification reported to the host in `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    CaptureFailure,
    SegmentIoFailure,
    MergeFailure,
    TrimFailure,
    RetentionInvariantViolation,
    NoActiveRecording,
    InvalidInput,
    Timeout,
    Storage,
    Internal,
}

impl RollcapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CaptureFailure(_) => ErrorKind::CaptureFailure,
            Self::SegmentIo { .. } => ErrorKind::SegmentIoFailure,
            Self::MergeFailure { .. } => ErrorKind::MergeFailure,
            Self::TrimFailure(_) => ErrorKind::TrimFailure,
            Self::RetentionInvariantViolation(_) => ErrorKind::RetentionInvariantViolation,
            Self::NoActiveRecording => ErrorKind::NoActiveRecording,
            Self::AlreadyRecording
            | Self::InvalidConfig(_)
            | Self::InvalidChunk(_)
            | Self::UnexpectedSignal(_) => {
                ErrorKind::InvalidInput
            }
            Self::StopTimedOut { .. } => ErrorKind::Timeout,
            Self::ContainerNotFound(_) | Self::Wav(_) | Self::Io(_) => ErrorKind::Storage,
            Self::Json(_) | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the error forces the session into its terminal error state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CaptureFailure(_))
    }
}

pub type Result<T> = std::result::Result<T, RollcapError>;
