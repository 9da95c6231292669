//! Errors surfaced by the recording service

use thiserror::Error;

use crate::session::Session;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordingError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to join: {0}")]
    JoinFailure(String),

    #[error("Failed to get streams: {0}")]
    StreamAcquisitionFailure(String),

    #[error("Recorder failed to start: {0}")]
    EncodeStartFailure(String),

    #[error("Recorder failed to stop: {0}")]
    EncodeStopFailure(String),

    #[error("Failed to stop meeting: {0}")]
    AutomationCleanupFailure(String),

    #[error("Failed to capture snapshot: {0}")]
    SnapshotFailure(String),
}

impl RecordingError {
    /// Stable code for API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            RecordingError::NotFound(_) => "NOT_FOUND",
            RecordingError::InvalidInput(_) => "INVALID_INPUT",
            RecordingError::JoinFailure(_) => "JOIN_FAILURE",
            RecordingError::StreamAcquisitionFailure(_) => "STREAM_ACQUISITION_FAILURE",
            RecordingError::EncodeStartFailure(_) => "ENCODE_START_FAILURE",
            RecordingError::EncodeStopFailure(_) => "ENCODE_STOP_FAILURE",
            RecordingError::AutomationCleanupFailure(_) => "AUTOMATION_CLEANUP_FAILURE",
            RecordingError::SnapshotFailure(_) => "SNAPSHOT_FAILURE",
        }
    }
}

/// A failed stop, carrying the session as it was left
#[derive(Error, Debug)]
#[error("{error}")]
pub struct StopError {
    #[source]
    pub error: RecordingError,
    /// `None` only when the session does not exist
    pub session: Option<Session>,
}

impl From<RecordingError> for StopError {
    fn from(error: RecordingError) -> Self {
        Self {
            error,
            session: None,
        }
    }
}

pub type RecordingResult<T> = Result<T, RecordingError>;
