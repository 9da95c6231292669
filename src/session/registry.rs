//! Session registry
//!
//! The single owner of every session record. All status, timestamp and error
//! updates go through the named operations here, under one lock.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use super::{Session, SessionStatus};

/// Result of a status transition request
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The transition was applied; holds the updated snapshot
    Applied(Session),
    /// The transition is not legal from the current status; holds the unchanged snapshot
    Rejected(Session),
    /// No session with that ID
    Missing,
}

/// Concurrency-safe map from session ID to session record
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Session writes are single field assignments, so a poisoned lock still
    // guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Session>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Session>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a new session in `Initializing` with a fresh ID
    pub fn create(&self, meeting_url: &str, participant_name: &str) -> Session {
        let mut sessions = self.write();

        // v4 collisions are not a practical concern, but IDs must never be reused
        let mut id = uuid::Uuid::new_v4().to_string();
        while sessions.contains_key(&id) {
            id = uuid::Uuid::new_v4().to_string();
        }

        let session = Session::new(id.clone(), meeting_url.to_string(), participant_name.to_string());
        sessions.insert(id, session.clone());
        debug!("Created session {}", session.id);
        session
    }

    /// Snapshot of a session with its duration recomputed as of now
    pub fn get(&self, id: &str) -> Option<Session> {
        let mut session = self.read().get(id).cloned()?;
        session.refresh_duration(Utc::now());
        Some(session)
    }

    /// Move a session to `next`
    ///
    /// Entering `Recording` stamps `start_time`; entering `Stopped` stamps
    /// `end_time`. Illegal transitions leave the session untouched.
    pub fn transition(&self, id: &str, next: SessionStatus) -> Transition {
        let now = Utc::now();
        let mut sessions = self.write();

        let Some(session) = sessions.get_mut(id) else {
            debug!("Ignoring transition to {} for unknown session {}", next, id);
            return Transition::Missing;
        };

        if !session.status.can_transition_to(next) {
            debug!(
                "Rejected transition {} -> {} for session {}",
                session.status, next, id
            );
            let mut snapshot = session.clone();
            snapshot.refresh_duration(now);
            return Transition::Rejected(snapshot);
        }

        debug!("Session {}: {} -> {}", id, session.status, next);
        session.status = next;
        match next {
            SessionStatus::Recording => session.start_time = Some(now),
            SessionStatus::Stopped => {
                // Keep start <= end even if the clock stepped backwards
                let end = session.start_time.map_or(now, |start| start.max(now));
                session.end_time = Some(end);
            }
            _ => {}
        }

        let mut snapshot = session.clone();
        snapshot.refresh_duration(now);
        Transition::Applied(snapshot)
    }

    /// Put a session into the terminal `Error` status with a message
    ///
    /// No-op for unknown or already terminal sessions. Returns whether the
    /// error was recorded.
    pub fn set_error(&self, id: &str, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut sessions = self.write();

        let Some(session) = sessions.get_mut(id) else {
            debug!("Ignoring error for unknown session {}: {}", id, message);
            return false;
        };

        if !session.status.can_transition_to(SessionStatus::Error) {
            warn!(
                "Session {} is already {}, dropping error: {}",
                id, session.status, message
            );
            return false;
        }

        session.status = SessionStatus::Error;
        session.error_message = Some(message);
        true
    }

    /// Record the output file reported by the recorder
    pub fn set_file_path(&self, id: &str, path: impl Into<String>) {
        if let Some(session) = self.write().get_mut(id) {
            session.file_path = Some(path.into());
        }
    }

    /// IDs of all sessions currently in `status`
    pub fn ids_with_status(&self, status: SessionStatus) -> Vec<String> {
        self.read()
            .values()
            .filter(|session| session.status == status)
            .map(|session| session.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn applied(transition: Transition) -> Session {
        match transition {
            Transition::Applied(session) => session,
            other => panic!("expected applied transition, got {:?}", other),
        }
    }

    #[test]
    fn test_create_assigns_unique_ids() {
        let registry = SessionRegistry::new();
        let a = registry.create("https://example/meet/a", "Alice");
        let b = registry.create("https://example/meet/b", "Bob");

        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, SessionStatus::Initializing);
        assert_eq!(a.start_time, None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_get_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_full_lifecycle_stamps_times() {
        let registry = SessionRegistry::new();
        let id = registry.create("https://example/meet/a", "Alice").id;

        applied(registry.transition(&id, SessionStatus::Joining));
        let recording = applied(registry.transition(&id, SessionStatus::Recording));
        assert!(recording.start_time.is_some());
        assert!(recording.end_time.is_none());

        applied(registry.transition(&id, SessionStatus::Stopping));
        let stopped = applied(registry.transition(&id, SessionStatus::Stopped));

        let start = stopped.start_time.unwrap();
        let end = stopped.end_time.unwrap();
        assert!(start <= end);
        assert!(stopped.duration.is_some());
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let registry = SessionRegistry::new();
        let id = registry.create("https://example/meet/a", "Alice").id;

        match registry.transition(&id, SessionStatus::Stopped) {
            Transition::Rejected(session) => assert_eq!(session.status, SessionStatus::Initializing),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(registry.get(&id).unwrap().status, SessionStatus::Initializing);
    }

    #[test]
    fn test_transition_unknown_session_is_noop() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.transition("nope", SessionStatus::Joining), Transition::Missing);
        assert!(!registry.set_error("nope", "boom"));
        registry.set_file_path("nope", "/tmp/x.mp4");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_error_is_terminal() {
        let registry = SessionRegistry::new();
        let id = registry.create("https://example/meet/a", "Alice").id;
        applied(registry.transition(&id, SessionStatus::Joining));

        assert!(registry.set_error(&id, "launch failed"));
        assert!(matches!(
            registry.transition(&id, SessionStatus::Recording),
            Transition::Rejected(_)
        ));
        assert!(!registry.set_error(&id, "second error"));

        let session = registry.get(&id).unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.error_message.as_deref(), Some("launch failed"));
        assert!(session.start_time.is_none());
    }

    #[test]
    fn test_recording_duration_increases_between_reads() {
        let registry = SessionRegistry::new();
        let id = registry.create("https://example/meet/a", "Alice").id;
        applied(registry.transition(&id, SessionStatus::Joining));
        applied(registry.transition(&id, SessionStatus::Recording));

        let first = registry.get(&id).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let second = registry.get(&id).unwrap();

        assert_eq!(first.start_time, second.start_time);
        assert!(second.duration_ms.unwrap() > first.duration_ms.unwrap());
    }

    #[test]
    fn test_only_one_concurrent_stop_wins() {
        let registry = Arc::new(SessionRegistry::new());
        let id = registry.create("https://example/meet/a", "Alice").id;
        applied(registry.transition(&id, SessionStatus::Joining));
        applied(registry.transition(&id, SessionStatus::Recording));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    matches!(
                        registry.transition(&id, SessionStatus::Stopping),
                        Transition::Applied(_)
                    )
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_ids_with_status() {
        let registry = SessionRegistry::new();
        let a = registry.create("https://example/meet/a", "Alice").id;
        let b = registry.create("https://example/meet/b", "Bob").id;
        applied(registry.transition(&a, SessionStatus::Joining));

        assert_eq!(registry.ids_with_status(SessionStatus::Joining), vec![a]);
        assert_eq!(registry.ids_with_status(SessionStatus::Initializing), vec![b]);
    }
}
