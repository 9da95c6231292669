//! Meeting sessions and their lifecycle
//!
//! A session is one attempt to join and record a single meeting. Sessions are
//! owned by the [`SessionRegistry`]; everything else works on snapshots.

mod registry;

pub use registry::{SessionRegistry, Transition};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a session
///
/// The normal path is `Initializing -> Joining -> Recording -> Stopping -> Stopped`.
/// `Error` can be entered from any non-terminal status and is never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Joining,
    Recording,
    Stopping,
    Stopped,
    Error,
}

impl SessionStatus {
    /// Whether the session can no longer change status
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Error)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self.is_terminal() {
            return false;
        }

        matches!(
            (self, next),
            (Initializing, Joining)
                | (Joining, Recording)
                | (Recording, Stopping)
                | (Stopping, Stopped)
                | (_, Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Joining => "joining",
            SessionStatus::Recording => "recording",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a meeting session
///
/// The registry hands out clones; mutating a snapshot has no effect on the
/// registry's copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique session ID
    #[serde(rename = "sessionId")]
    pub id: String,

    pub meeting_url: String,

    /// Display name used when joining
    pub participant_name: String,

    pub status: SessionStatus,

    /// Set when the session enters `Recording`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// Set when the session enters `Stopped`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Output file reported by the recorder
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,

    /// Human readable duration (`HH:MM:SS.mmm`), recomputed on every read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Duration in milliseconds, recomputed on every read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,

    /// Only set when `status == Error`
    #[serde(rename = "error", skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Session {
    pub(crate) fn new(id: String, meeting_url: String, participant_name: String) -> Self {
        Self {
            id,
            meeting_url,
            participant_name,
            status: SessionStatus::Initializing,
            start_time: None,
            end_time: None,
            file_path: None,
            duration: None,
            duration_ms: None,
            error_message: None,
        }
    }

    /// Elapsed recording time as of `now`
    ///
    /// While recording this runs from `start_time` to `now`; once stopped it
    /// is fixed to `start_time..end_time`. Other statuses have no duration.
    pub fn compute_duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let start = self.start_time?;
        let end = match self.status {
            SessionStatus::Recording => now,
            SessionStatus::Stopped => self.end_time?,
            _ => return None,
        };

        Some((end - start).max(chrono::Duration::zero()))
    }

    /// Refresh `duration` and `duration_ms` from the current timestamps
    pub(crate) fn refresh_duration(&mut self, now: DateTime<Utc>) {
        match self.compute_duration(now) {
            Some(elapsed) => {
                self.duration = Some(format_duration(elapsed));
                self.duration_ms = Some(elapsed.num_milliseconds());
            }
            None => {
                self.duration = None;
                self.duration_ms = None;
            }
        }
    }
}

/// Format a duration as `HH:MM:SS.mmm`
pub fn format_duration(duration: chrono::Duration) -> String {
    let total_ms = duration.num_milliseconds().max(0);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;

    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
}
