//! Recording orchestration
//!
//! `start_recording` returns as soon as the session exists; joining and
//! starting capture happen on a detached task that reports back only through
//! the registry. `stop_recording` runs the stop sequence inline and returns
//! the outcome to its caller.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::error::{RecordingError, RecordingResult, StopError};
use crate::automator::{BrowserAutomator, MeetingEvent};
use crate::recorder::MediaRecorder;
use crate::session::{Session, SessionRegistry, SessionStatus, Transition};

/// A session's capture-start task, as seen by its stop
enum CaptureGate {
    /// Closed (by dropping the sender) once the task is done
    Pending(watch::Receiver<()>),
    /// The stop gave up waiting; the task stops whatever it started
    Abandoned,
}

pub struct RecordingService {
    registry: SessionRegistry,
    automator: Arc<dyn BrowserAutomator>,
    recorder: Arc<dyn MediaRecorder>,
    capture_gates: Mutex<HashMap<String, CaptureGate>>,
    stop_capture_wait: Duration,
}

impl RecordingService {
    pub fn new(
        automator: Arc<dyn BrowserAutomator>,
        recorder: Arc<dyn MediaRecorder>,
        stop_capture_wait: Duration,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            automator,
            recorder,
            capture_gates: Mutex::new(HashMap::new()),
            stop_capture_wait,
        }
    }

    /// Create a session and start joining its meeting in the background
    ///
    /// Returns the `Initializing` session; progress is observed with
    /// [`RecordingService::get_status`].
    pub fn start_recording(
        self: &Arc<Self>,
        meeting_url: &str,
        participant_name: &str,
    ) -> RecordingResult<Session> {
        let (meeting_url, participant_name) = validate_start(meeting_url, participant_name)?;

        let session = self.registry.create(meeting_url, participant_name);
        info!(
            "Created session {} for {} as {:?}",
            session.id, session.meeting_url, session.participant_name
        );

        let service = Arc::clone(self);
        let snapshot = session.clone();
        tokio::spawn(async move {
            service.run_session(snapshot).await;
        });

        Ok(session)
    }

    /// Stop a recording and release its browser
    ///
    /// Outside `Recording` this is a no-op that returns the session as is.
    /// Recorder failures are recorded on the session and returned alongside it.
    pub async fn stop_recording(&self, session_id: &str) -> Result<Session, StopError> {
        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| RecordingError::NotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Recording {
            debug!(
                "Stop requested for session {} in status {}, nothing to do",
                session_id, session.status
            );
            return Ok(session);
        }

        match self.registry.transition(session_id, SessionStatus::Stopping) {
            Transition::Applied(_) => {}
            // Another caller won the race to stop
            Transition::Rejected(current) => return Ok(current),
            Transition::Missing => {
                return Err(RecordingError::NotFound(session_id.to_string()).into())
            }
        }
        info!("Stopping session {}", session_id);

        let mut failure = None;
        if self.wait_for_capture_start(session_id).await {
            match self.recorder.stop(session_id).await {
                Ok(stopped) => {
                    info!(
                        "Recording for session {} saved to {:?} (audio: {:?})",
                        session_id, stopped.video_path, stopped.audio_path
                    );
                    self.registry
                        .set_file_path(session_id, stopped.video_path.display().to_string());
                }
                Err(e) => {
                    if let Some(path) = &e.video_path {
                        self.registry
                            .set_file_path(session_id, path.display().to_string());
                    }
                    let err = RecordingError::EncodeStopFailure(format!("{:#}", e.source));
                    error!("Session {}: {}", session_id, err);
                    self.registry.set_error(session_id, err.to_string());
                    failure = Some(err);
                }
            }
        }

        if let Err(e) = self.automator.stop_meeting(session_id).await {
            let err = RecordingError::AutomationCleanupFailure(format!("{:#}", e));
            warn!("Session {}: {}", session_id, err);
        }

        if let Transition::Rejected(current) =
            self.registry.transition(session_id, SessionStatus::Stopped)
        {
            debug!("Session {} finished stop in status {}", session_id, current.status);
        }

        let session = self
            .registry
            .get(session_id)
            .ok_or_else(|| RecordingError::NotFound(session_id.to_string()))?;

        match failure {
            Some(error) => Err(StopError {
                error,
                session: Some(session),
            }),
            None => {
                info!(
                    "Session {} stopped after {}",
                    session_id,
                    session.duration.as_deref().unwrap_or("00:00:00.000")
                );
                Ok(session)
            }
        }
    }

    /// Current state of a session, with its duration recomputed
    pub fn get_status(&self, session_id: &str) -> RecordingResult<Session> {
        self.registry
            .get(session_id)
            .ok_or_else(|| RecordingError::NotFound(session_id.to_string()))
    }

    /// A PNG of the meeting page for a known session
    pub async fn get_snapshot(&self, session_id: &str) -> RecordingResult<Vec<u8>> {
        self.get_status(session_id)?;
        self.automator
            .get_snapshot(session_id)
            .await
            .map_err(|e| RecordingError::SnapshotFailure(format!("{:#}", e)))
    }

    /// React to automator events until the channel closes
    pub async fn handle_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MeetingEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                MeetingEvent::Ended { session_id } => {
                    info!("Meeting for session {} ended, stopping recording", session_id);
                    match self.stop_recording(&session_id).await {
                        Ok(session) => debug!("Session {} is now {}", session_id, session.status),
                        Err(e) => warn!("Failed to stop session {} after meeting end: {}", session_id, e),
                    }
                }
            }
        }
        debug!("Meeting event channel closed");
    }

    /// Finalize every active recording and abandon pending joins
    pub async fn shutdown(&self) {
        if self.registry.is_empty() {
            return;
        }
        debug!("Shutting down with {} session(s)", self.registry.len());

        let joining = self.registry.ids_with_status(SessionStatus::Joining);
        for session_id in &joining {
            if let Err(e) = self.automator.stop_meeting(session_id).await {
                warn!("Failed to release browser for session {}: {:#}", session_id, e);
            }
        }

        let recording = self.registry.ids_with_status(SessionStatus::Recording);
        if recording.is_empty() {
            return;
        }

        info!("Stopping {} active recording(s)", recording.len());
        let results = join_all(recording.iter().map(|id| self.stop_recording(id))).await;
        for (session_id, result) in recording.iter().zip(results) {
            if let Err(e) = result {
                error!("Session {} did not stop cleanly: {}", session_id, e);
            }
        }
    }

    /// Join, then hand over to capture. Failures end the session in `Error`.
    async fn run_session(self: Arc<Self>, session: Session) {
        let session_id = session.id.clone();

        if !matches!(
            self.registry.transition(&session_id, SessionStatus::Joining),
            Transition::Applied(_)
        ) {
            warn!("Session {} could not enter joining", session_id);
            return;
        }

        info!("Joining meeting for session {}", session_id);
        if let Err(e) = self.automator.join_meeting(&session).await {
            let err = RecordingError::JoinFailure(format!("{:#}", e));
            error!("Session {}: {}", session_id, err);
            self.registry.set_error(&session_id, err.to_string());
            return;
        }

        // Register the gate before the status flips so a stop always sees it
        let (capture_done, gate) = watch::channel(());
        self.gates()
            .insert(session_id.clone(), CaptureGate::Pending(gate));

        match self.registry.transition(&session_id, SessionStatus::Recording) {
            Transition::Applied(_) => info!("Session {} is recording", session_id),
            Transition::Rejected(current) => {
                warn!(
                    "Session {} is {} after joining, releasing browser",
                    session_id, current.status
                );
                self.gates().remove(&session_id);
                if let Err(e) = self.automator.stop_meeting(&session_id).await {
                    warn!("Failed to release browser for session {}: {:#}", session_id, e);
                }
                return;
            }
            Transition::Missing => {
                self.gates().remove(&session_id);
                return;
            }
        }

        let service = Arc::clone(&self);
        tokio::spawn(async move {
            let started = service.start_capture(&session_id).await;
            if service.close_capture_gate(&session_id, capture_done) && started {
                warn!(
                    "Session {} was stopped while its recorder was starting",
                    session_id
                );
                service.stop_late_recorder(&session_id).await;
            }
        });
    }

    /// Returns whether the recorder was started
    async fn start_capture(&self, session_id: &str) -> bool {
        let streams = match self.automator.get_meeting_streams(session_id).await {
            Ok(streams) => streams,
            Err(e) => {
                let err = RecordingError::StreamAcquisitionFailure(format!("{:#}", e));
                self.abandon_recording(session_id, err).await;
                return false;
            }
        };

        if self.capture_abandoned(session_id) {
            info!("Session {} was stopped before capture started", session_id);
            return false;
        }

        if let Err(e) = self
            .recorder
            .start(session_id, streams.video, streams.audio)
            .await
        {
            let err = RecordingError::EncodeStartFailure(format!("{:#}", e));
            self.abandon_recording(session_id, err).await;
            return false;
        }

        info!("Capture running for session {}", session_id);
        true
    }

    /// Finalize a recorder that came up after its session had been stopped
    async fn stop_late_recorder(&self, session_id: &str) {
        match self.recorder.stop(session_id).await {
            Ok(stopped) => {
                info!(
                    "Late recording for session {} saved to {:?}",
                    session_id, stopped.video_path
                );
                self.registry
                    .set_file_path(session_id, stopped.video_path.display().to_string());
            }
            Err(e) => {
                if let Some(path) = &e.video_path {
                    self.registry
                        .set_file_path(session_id, path.display().to_string());
                }
                let err = RecordingError::EncodeStopFailure(format!("{:#}", e.source));
                error!("Session {}: {}", session_id, err);
            }
        }
    }

    /// Compensate for a capture failure after the session reached `Recording`
    async fn abandon_recording(&self, session_id: &str, err: RecordingError) {
        error!("Session {}: {}", session_id, err);
        if !self.registry.set_error(session_id, err.to_string()) {
            return;
        }
        if let Err(e) = self.automator.stop_meeting(session_id).await {
            warn!("Failed to release browser for session {}: {:#}", session_id, e);
        }
    }

    /// Wait for the session's capture start to finish
    ///
    /// Returns false if it is still running after `stop_capture_wait`. The
    /// gate is then marked abandoned and the capture task stops the recorder
    /// itself if it ever starts one.
    async fn wait_for_capture_start(&self, session_id: &str) -> bool {
        let mut gate = match self.gates().remove(session_id) {
            Some(CaptureGate::Pending(gate)) => gate,
            Some(CaptureGate::Abandoned) | None => return true,
        };

        // Resolves with an error once the sender is dropped
        if tokio::time::timeout(self.stop_capture_wait, gate.changed())
            .await
            .is_ok()
        {
            return true;
        }

        let mut gates = self.gates();
        // The task closes its gate under this lock, so it either finished
        // already or will see the mark
        if gate.has_changed().is_err() {
            return true;
        }
        gates.insert(session_id.to_string(), CaptureGate::Abandoned);
        warn!(
            "Capture for session {} still starting after {:?}, leaving the recorder to it",
            session_id, self.stop_capture_wait
        );
        false
    }

    fn capture_abandoned(&self, session_id: &str) -> bool {
        matches!(self.gates().get(session_id), Some(CaptureGate::Abandoned))
    }

    /// Close a session's capture gate. True if its stop gave up waiting.
    fn close_capture_gate(&self, session_id: &str, capture_done: watch::Sender<()>) -> bool {
        let mut gates = self.gates();
        let abandoned = matches!(gates.remove(session_id), Some(CaptureGate::Abandoned));
        drop(capture_done);
        abandoned
    }

    fn gates(&self) -> std::sync::MutexGuard<'_, HashMap<String, CaptureGate>> {
        self.capture_gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Trimmed inputs for a new session, or why they are unusable
fn validate_start<'a>(
    meeting_url: &'a str,
    participant_name: &'a str,
) -> RecordingResult<(&'a str, &'a str)> {
    let meeting_url = meeting_url.trim();
    if meeting_url.is_empty() {
        return Err(RecordingError::InvalidInput(
            "meetingUrl is required".to_string(),
        ));
    }

    let lower = meeting_url.to_ascii_lowercase();
    let rest = lower
        .strip_prefix("https://")
        .or_else(|| lower.strip_prefix("http://"));
    if rest.map_or(true, str::is_empty) {
        return Err(RecordingError::InvalidInput(format!(
            "meetingUrl must be an http(s) URL: {}",
            meeting_url
        )));
    }

    let participant_name = participant_name.trim();
    if participant_name.is_empty() {
        return Err(RecordingError::InvalidInput(
            "participantName is required".to_string(),
        ));
    }

    Ok((meeting_url, participant_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automator::MeetingStreams;
    use crate::recorder::{stream_bridge, BridgeReader, StopFailure, StoppedRecording};
    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct FakeAutomator {
        join_error: Option<String>,
        join_delay: Duration,
        streams_error: Option<String>,
        snapshot_error: Option<String>,
        joins: AtomicUsize,
        stream_requests: AtomicUsize,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl BrowserAutomator for FakeAutomator {
        async fn join_meeting(&self, _session: &Session) -> Result<()> {
            self.joins.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.join_delay).await;
            match &self.join_error {
                Some(message) => Err(anyhow!("{}", message)),
                None => Ok(()),
            }
        }

        async fn get_meeting_streams(&self, _session_id: &str) -> Result<MeetingStreams> {
            self.stream_requests.fetch_add(1, Ordering::SeqCst);
            if let Some(message) = &self.streams_error {
                bail!("{}", message);
            }
            let (_writer, video) = stream_bridge();
            Ok(MeetingStreams { video, audio: None })
        }

        async fn stop_meeting(&self, _session_id: &str) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_snapshot(&self, _session_id: &str) -> Result<Vec<u8>> {
            if let Some(message) = &self.snapshot_error {
                bail!("{}", message);
            }
            Ok(b"\x89PNG".to_vec())
        }
    }

    #[derive(Default)]
    struct FakeRecorder {
        stop_error: Option<String>,
        start_delay: Duration,
        stop_delay: Duration,
        starts: AtomicUsize,
        stops: AtomicUsize,
        active: Mutex<HashSet<String>>,
    }

    impl FakeRecorder {
        fn active_count(&self) -> usize {
            self.active.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MediaRecorder for FakeRecorder {
        async fn start(
            &self,
            session_id: &str,
            _video: BridgeReader,
            _audio: Option<BridgeReader>,
        ) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if !self.start_delay.is_zero() {
                tokio::time::sleep(self.start_delay).await;
            }
            self.active.lock().unwrap().insert(session_id.to_string());
            Ok(())
        }

        async fn stop(&self, session_id: &str) -> Result<StoppedRecording, StopFailure> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.stop_delay).await;
            if !self.active.lock().unwrap().remove(session_id) {
                return Err(StopFailure::new(
                    None,
                    anyhow!("no active recording for session {}", session_id),
                ));
            }
            let video_path = PathBuf::from(format!("/recordings/meeting-{}-1700000000.mp4", session_id));
            match &self.stop_error {
                Some(message) => Err(StopFailure::new(Some(video_path), anyhow!("{}", message))),
                None => Ok(StoppedRecording {
                    video_path,
                    audio_path: None,
                }),
            }
        }
    }

    fn service(
        automator: FakeAutomator,
        recorder: FakeRecorder,
    ) -> (Arc<RecordingService>, Arc<FakeAutomator>, Arc<FakeRecorder>) {
        service_with_wait(automator, recorder, Duration::from_secs(2))
    }

    fn service_with_wait(
        automator: FakeAutomator,
        recorder: FakeRecorder,
        stop_capture_wait: Duration,
    ) -> (Arc<RecordingService>, Arc<FakeAutomator>, Arc<FakeRecorder>) {
        let automator = Arc::new(automator);
        let recorder = Arc::new(recorder);
        let service = Arc::new(RecordingService::new(
            automator.clone(),
            recorder.clone(),
            stop_capture_wait,
        ));
        (service, automator, recorder)
    }

    async fn wait_for_status(
        service: &RecordingService,
        session_id: &str,
        status: SessionStatus,
    ) -> Session {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let session = service.get_status(session_id).unwrap();
            if session.status == status {
                return session;
            }
            assert!(
                Instant::now() < deadline,
                "session stuck in {} waiting for {}",
                session.status,
                status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn recording_session(service: &Arc<RecordingService>, recorder: &FakeRecorder) -> String {
        let session = service
            .start_recording("https://example/meet/abc", "Alice")
            .unwrap();
        wait_for_status(service, &session.id, SessionStatus::Recording).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.starts.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "recorder never started");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        session.id
    }

    #[tokio::test]
    async fn test_join_failure_ends_in_error() {
        let (service, _, recorder) = service(
            FakeAutomator {
                join_error: Some("launch failed".to_string()),
                ..Default::default()
            },
            FakeRecorder::default(),
        );

        let session = service
            .start_recording("https://example/meet/abc", "Alice")
            .unwrap();
        assert_eq!(session.status, SessionStatus::Initializing);
        assert!(!session.id.is_empty());
        assert!(session.start_time.is_none());

        let failed = wait_for_status(&service, &session.id, SessionStatus::Error).await;
        assert!(failed.error_message.unwrap().contains("launch failed"));
        assert!(failed.start_time.is_none());
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_successful_recording_lifecycle() {
        let (service, automator, recorder) =
            service(FakeAutomator::default(), FakeRecorder::default());
        let id = recording_session(&service, &recorder).await;

        let recording = service.get_status(&id).unwrap();
        assert!(recording.start_time.is_some());
        assert!(recording.end_time.is_none());

        let stopped = service.stop_recording(&id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(!stopped.file_path.clone().unwrap().is_empty());
        assert!(stopped.end_time.unwrap() >= stopped.start_time.unwrap());
        assert!(stopped.error_message.is_none());
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(automator.stops.load(Ordering::SeqCst), 1);
        assert_eq!(automator.joins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_outside_recording_is_noop() {
        let (service, automator, recorder) = service(
            FakeAutomator {
                join_delay: Duration::from_millis(300),
                ..Default::default()
            },
            FakeRecorder::default(),
        );

        let session = service
            .start_recording("https://example/meet/abc", "Alice")
            .unwrap();
        let joining = wait_for_status(&service, &session.id, SessionStatus::Joining).await;

        let returned = service.stop_recording(&session.id).await.unwrap();
        assert_eq!(returned.status, SessionStatus::Joining);
        assert_eq!(returned.start_time, joining.start_time);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 0);
        assert_eq!(automator.stops.load(Ordering::SeqCst), 0);

        // Stop after the fact is still a no-op
        let id = session.id;
        wait_for_status(&service, &id, SessionStatus::Recording).await;
        service.stop_recording(&id).await.unwrap();
        let again = service.stop_recording(&id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Stopped);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(automator.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_stops_run_once() {
        let (service, automator, recorder) = service(
            FakeAutomator::default(),
            FakeRecorder {
                stop_delay: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let id = recording_session(&service, &recorder).await;

        let (first, second) = tokio::join!(service.stop_recording(&id), service.stop_recording(&id));
        let first = first.unwrap();
        let second = second.unwrap();

        let statuses = [first.status, second.status];
        assert!(statuses.contains(&SessionStatus::Stopped));
        assert!(statuses
            .iter()
            .all(|s| matches!(s, SessionStatus::Stopping | SessionStatus::Stopped)));
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(automator.stops.load(Ordering::SeqCst), 1);
        assert_eq!(service.get_status(&id).unwrap().status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_waits_for_pending_capture_start() {
        let (service, automator, recorder) = service(
            FakeAutomator::default(),
            FakeRecorder {
                start_delay: Duration::from_millis(200),
                ..Default::default()
            },
        );

        let session = service
            .start_recording("https://example/meet/abc", "Alice")
            .unwrap();
        wait_for_status(&service, &session.id, SessionStatus::Recording).await;
        assert_eq!(recorder.active_count(), 0);

        let stopped = service.stop_recording(&session.id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(stopped.file_path.is_some());
        assert!(stopped.error_message.is_none());
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.active_count(), 0);
        assert_eq!(automator.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recorder_started_after_stop_gave_up_is_stopped() {
        let (service, automator, recorder) = service_with_wait(
            FakeAutomator::default(),
            FakeRecorder {
                start_delay: Duration::from_millis(400),
                ..Default::default()
            },
            Duration::from_millis(50),
        );

        let session = service
            .start_recording("https://example/meet/abc", "Alice")
            .unwrap();
        wait_for_status(&service, &session.id, SessionStatus::Recording).await;

        let stopped = service.stop_recording(&session.id).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(stopped.error_message.is_none());
        assert_eq!(automator.stops.load(Ordering::SeqCst), 1);

        // The file path lands once the capture task has finalized the recorder
        let deadline = Instant::now() + Duration::from_secs(5);
        let session = loop {
            let current = service.get_status(&session.id).unwrap();
            if current.file_path.is_some() {
                break current;
            }
            assert!(Instant::now() < deadline, "late recorder was never stopped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(session.status, SessionStatus::Stopped);
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.active_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_failure_has_its_own_error() {
        let (service, _, _) = service(
            FakeAutomator {
                snapshot_error: Some("page crashed".to_string()),
                ..Default::default()
            },
            FakeRecorder::default(),
        );
        let session = service
            .start_recording("https://example/meet/abc", "Alice")
            .unwrap();

        let err = service.get_snapshot(&session.id).await.unwrap_err();
        assert!(matches!(err, RecordingError::SnapshotFailure(_)));
        assert!(err.to_string().contains("page crashed"));
    }

    #[tokio::test]
    async fn test_recorder_stop_failure_is_returned_with_session() {
        let (service, automator, recorder) = service(
            FakeAutomator::default(),
            FakeRecorder {
                stop_error: Some("encoder exited with status 1".to_string()),
                ..Default::default()
            },
        );
        let id = recording_session(&service, &recorder).await;

        let err = service.stop_recording(&id).await.unwrap_err();
        assert!(matches!(err.error, RecordingError::EncodeStopFailure(_)));
        let session = err.session.unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session
            .error_message
            .unwrap()
            .contains("encoder exited with status 1"));
        assert!(session.file_path.is_some());
        // Browser is released even though the recorder failed
        assert_eq!(automator.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_compensates() {
        let (service, automator, recorder) = service(
            FakeAutomator {
                streams_error: Some("page not found".to_string()),
                ..Default::default()
            },
            FakeRecorder::default(),
        );

        let session = service
            .start_recording("https://example/meet/abc", "Alice")
            .unwrap();
        let failed = wait_for_status(&service, &session.id, SessionStatus::Error).await;
        assert!(failed.error_message.unwrap().contains("page not found"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while automator.stops.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "browser was never released");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.starts.load(Ordering::SeqCst), 0);

        let returned = service.stop_recording(&session.id).await.unwrap();
        assert_eq!(returned.status, SessionStatus::Error);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_recording_duration_increases() {
        let (service, _, recorder) = service(FakeAutomator::default(), FakeRecorder::default());
        let id = recording_session(&service, &recorder).await;

        let first = service.get_status(&id).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = service.get_status(&id).unwrap();

        assert!(second.duration_ms.unwrap() > first.duration_ms.unwrap());
        assert_eq!(first.start_time, second.start_time);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (service, _, _) = service(FakeAutomator::default(), FakeRecorder::default());

        assert_eq!(
            service.get_status("missing").unwrap_err(),
            RecordingError::NotFound("missing".to_string())
        );
        let err = service.stop_recording("missing").await.unwrap_err();
        assert!(matches!(err.error, RecordingError::NotFound(_)));
        assert!(err.session.is_none());
        assert!(matches!(
            service.get_snapshot("missing").await,
            Err(RecordingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_validates_input() {
        let (service, _, _) = service(FakeAutomator::default(), FakeRecorder::default());

        for (url, name) in [
            ("", "Alice"),
            ("ftp://example/meet", "Alice"),
            ("https://", "Alice"),
            ("https://example/meet/abc", "   "),
        ] {
            assert!(
                matches!(
                    service.start_recording(url, name),
                    Err(RecordingError::InvalidInput(_))
                ),
                "accepted {:?} / {:?}",
                url,
                name
            );
        }

        let session = service
            .start_recording("  HTTPS://example/meet/abc ", " Alice ")
            .unwrap();
        assert_eq!(session.meeting_url, "HTTPS://example/meet/abc");
        assert_eq!(session.participant_name, "Alice");
    }

    #[tokio::test]
    async fn test_meeting_end_event_stops_recording() {
        let (service, automator, recorder) =
            service(FakeAutomator::default(), FakeRecorder::default());
        let id = recording_session(&service, &recorder).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let handler = tokio::spawn(service.clone().handle_events(rx));
        tx.send(MeetingEvent::Ended {
            session_id: id.clone(),
        })
        .unwrap();

        wait_for_status(&service, &id, SessionStatus::Stopped).await;
        drop(tx);
        handler.await.unwrap();
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(automator.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_active_recordings() {
        let (service, _, recorder) = service(FakeAutomator::default(), FakeRecorder::default());
        let first = recording_session(&service, &recorder).await;
        let second = service
            .start_recording("https://example/meet/def", "Bob")
            .unwrap();
        wait_for_status(&service, &second.id, SessionStatus::Recording).await;

        service.shutdown().await;

        assert_eq!(service.get_status(&first).unwrap().status, SessionStatus::Stopped);
        assert_eq!(service.get_status(&second.id).unwrap().status, SessionStatus::Stopped);
        assert_eq!(recorder.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_snapshot_for_known_session() {
        let (service, _, _) = service(FakeAutomator::default(), FakeRecorder::default());
        let session = service
            .start_recording("https://example/meet/abc", "Alice")
            .unwrap();
        let png = service.get_snapshot(&session.id).await.unwrap();
        assert!(png.starts_with(b"\x89PNG"));
    }
}
