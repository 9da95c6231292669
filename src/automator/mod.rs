//! Browser automation
//!
//! Drives a browser into a meeting and exposes what it sees and hears as byte
//! streams for the recorder.

mod audio;
mod chrome;
mod devtools;

pub use chrome::ChromeAutomator;

use anyhow::Result;
use async_trait::async_trait;

use crate::recorder::BridgeReader;
use crate::session::Session;

/// Media produced by a joined meeting
#[derive(Debug)]
pub struct MeetingStreams {
    /// Whole PNG images at a fixed cadence
    pub video: BridgeReader,
    /// Raw s16le PCM, when live audio capture is available
    pub audio: Option<BridgeReader>,
}

/// Events raised by per-session watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingEvent {
    /// The meeting ended or the bot was removed
    Ended { session_id: String },
}

/// Joins meetings and exposes their media
#[async_trait]
pub trait BrowserAutomator: Send + Sync {
    /// Join the session's meeting, returning once the bot is in (or has given up)
    async fn join_meeting(&self, session: &Session) -> Result<()>;

    /// Start capturing the joined meeting
    async fn get_meeting_streams(&self, session_id: &str) -> Result<MeetingStreams>;

    /// Leave the meeting and release browser resources
    ///
    /// Safe to call for sessions that never finished joining.
    async fn stop_meeting(&self, session_id: &str) -> Result<()>;

    /// A single PNG of the meeting page, independent of the recording
    async fn get_snapshot(&self, session_id: &str) -> Result<Vec<u8>>;
}
