//! Media recording
//!
//! Turns the browser's video and audio byte streams into files on disk by
//! feeding them to encoder subprocesses.

mod bridge;
mod ffmpeg;
mod process;

pub use bridge::{stream_bridge, BridgeReader, BridgeWriter};
pub use ffmpeg::FfmpegRecorder;
pub use process::{spawn_logged, wait_or_kill};

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

/// Files produced by a finished recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedRecording {
    pub video_path: PathBuf,
    /// Present when the audio encoder was running
    pub audio_path: Option<PathBuf>,
}

/// A stop that did not finish cleanly
///
/// Internal bookkeeping has still been released; `video_path` is set when a
/// recording existed, since the file may be partially usable.
#[derive(Debug, Error)]
#[error("{source:#}")]
pub struct StopFailure {
    pub video_path: Option<PathBuf>,
    #[source]
    pub source: anyhow::Error,
}

impl StopFailure {
    pub fn new(video_path: Option<PathBuf>, source: anyhow::Error) -> Self {
        Self { video_path, source }
    }
}

/// Encodes a session's media streams into a file
#[async_trait]
pub trait MediaRecorder: Send + Sync {
    /// Start encoding `video` (and `audio`, when present) for `session_id`
    async fn start(
        &self,
        session_id: &str,
        video: BridgeReader,
        audio: Option<BridgeReader>,
    ) -> anyhow::Result<()>;

    /// Finalize the session's output and release its encoder processes
    async fn stop(&self, session_id: &str) -> Result<StoppedRecording, StopFailure>;
}
