//! ffmpeg encoder process manager
//!
//! Each session gets a video encoder fed PNG frames on stdin and, when
//! possible, an audio encoder. Stopping closes the video input and waits for
//! the encoder to finish the file, then asks the audio encoder to finalize
//! with SIGINT, killing it if it does not exit in time.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::BridgeReader;
use super::process::{interrupt_then_kill, spawn_logged, wait_or_kill, StopOutcome};
use super::{MediaRecorder, StopFailure, StoppedRecording};
use crate::config::{Config, EncoderConfig};

/// Upper bound for a forwarding task to notice cancellation and close its pipe
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the encoder command lines
///
/// Separated from process management so the stop protocol can be exercised
/// without ffmpeg installed.
pub trait EncoderCommands: Send + Sync {
    /// Encoder reading a sequence of PNG frames from stdin into `output`
    fn video(&self, output: &Path) -> Command;

    /// Encoder reading raw PCM from stdin into `output`
    fn audio_from_stdin(&self, output: &Path) -> Command;

    /// Encoder capturing the system audio device into `output`
    fn audio_from_device(&self, output: &Path) -> Command;
}

/// ffmpeg command lines for the configured codecs
#[derive(Debug, Clone)]
pub struct FfmpegCommands {
    encoder: EncoderConfig,
    frame_rate: u32,
}

impl FfmpegCommands {
    pub fn new(encoder: EncoderConfig, frame_rate: u32) -> Self {
        Self { encoder, frame_rate }
    }

    fn base(&self) -> Command {
        let mut command = Command::new(&self.encoder.ffmpeg_path);
        command
            .args(["-hide_banner", "-loglevel", "warning", "-y"])
            .stdout(Stdio::null());
        command
    }
}

impl EncoderCommands for FfmpegCommands {
    fn video(&self, output: &Path) -> Command {
        let mut command = self.base();
        command
            .args(["-f", "image2pipe", "-vcodec", "png"])
            .args(["-r", &self.frame_rate.to_string()])
            .args(["-i", "-"])
            .args(["-c:v", &self.encoder.video_codec])
            .args(["-pix_fmt", &self.encoder.pixel_format])
            .args(["-preset", &self.encoder.preset])
            .arg(output);
        command
    }

    fn audio_from_stdin(&self, output: &Path) -> Command {
        let mut command = self.base();
        command
            .args(["-f", "s16le"])
            .args(["-ar", &self.encoder.audio_sample_rate.to_string()])
            .args(["-ac", &self.encoder.audio_channels.to_string()])
            .args(["-i", "-"])
            .arg(output);
        command
    }

    fn audio_from_device(&self, output: &Path) -> Command {
        let mut command = self.base();
        command
            .args(["-f", "pulse", "-i", &self.encoder.fallback_audio_device])
            .args(["-ac", &self.encoder.audio_channels.to_string()])
            .arg(output);
        command
    }
}

/// Encoder state for one recording attempt
struct ActiveRecording {
    video: Child,
    video_pump: JoinHandle<u64>,
    video_path: PathBuf,
    audio: Option<ActiveAudio>,
    /// Tells the forwarding tasks to close encoder inputs
    cancel: CancellationToken,
}

struct ActiveAudio {
    child: Child,
    pump: Option<JoinHandle<u64>>,
    path: PathBuf,
}

/// Encoder process manager backed by ffmpeg subprocesses
pub struct FfmpegRecorder {
    output_dir: PathBuf,
    commands: Box<dyn EncoderCommands>,
    audio_stop_timeout: Duration,
    video_finalize_timeout: Duration,
    active: Mutex<HashMap<String, ActiveRecording>>,
}

impl FfmpegRecorder {
    /// Create a recorder using ffmpeg as configured
    pub fn new(config: &Config) -> Self {
        Self::with_commands(
            config.recording.output_directory.clone(),
            Box::new(FfmpegCommands::new(
                config.encoder.clone(),
                config.recording.frame_rate,
            )),
            config.recording.audio_stop_timeout(),
            config.recording.video_finalize_timeout(),
        )
    }

    pub fn with_commands(
        output_dir: PathBuf,
        commands: Box<dyn EncoderCommands>,
        audio_stop_timeout: Duration,
        video_finalize_timeout: Duration,
    ) -> Self {
        Self {
            output_dir,
            commands,
            audio_stop_timeout,
            video_finalize_timeout,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `session_id` has running encoders
    pub fn is_active(&self, session_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    fn video_path(&self, session_id: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().timestamp();
        self.output_dir
            .join(format!("meeting-{}-{}.mp4", session_id, timestamp))
    }

    fn audio_path(&self, session_id: &str) -> PathBuf {
        self.output_dir
            .join(format!("meeting-{}-audio.wav", session_id))
    }

    /// Spawn the audio encoder; failures only disable audio
    fn start_audio(
        &self,
        session_id: &str,
        audio: Option<BridgeReader>,
        cancel: &CancellationToken,
    ) -> Option<ActiveAudio> {
        let path = self.audio_path(session_id);
        let label = format!("audio encoder {}", session_id);

        let result = match audio {
            Some(reader) => {
                let mut command = self.commands.audio_from_stdin(&path);
                command.stdin(Stdio::piped());
                spawn_logged(command, &label).and_then(|mut child| {
                    let stdin = child
                        .stdin
                        .take()
                        .context("Audio encoder stdin was not captured")?;
                    let pump = tokio::spawn(pump(reader, stdin, cancel.clone(), label.clone()));
                    Ok(ActiveAudio {
                        child,
                        pump: Some(pump),
                        path: path.clone(),
                    })
                })
            }
            None => {
                let mut command = self.commands.audio_from_device(&path);
                command.stdin(Stdio::null());
                spawn_logged(command, &label).map(|child| ActiveAudio {
                    child,
                    pump: None,
                    path: path.clone(),
                })
            }
        };

        match result {
            Ok(audio) => {
                info!("Recording audio for session {} to {:?}", session_id, audio.path);
                Some(audio)
            }
            Err(e) => {
                warn!(
                    "Failed to start audio recording for session {}: {:#}. Continuing with video only.",
                    session_id, e
                );
                None
            }
        }
    }

    async fn finish(&self, session_id: &str, mut recording: ActiveRecording) -> Result<StoppedRecording, StopFailure> {
        let video_label = format!("video encoder {}", session_id);

        // Closing the video input is the end-of-stream signal for the encoder
        recording.cancel.cancel();
        let frames_bytes = drain_pump(recording.video_pump, &video_label).await;
        debug!(
            "Forwarded {} bytes of video for session {}",
            frames_bytes, session_id
        );

        let video_result = match wait_or_kill(
            &mut recording.video,
            self.video_finalize_timeout,
            &video_label,
        )
        .await
        {
            Ok(StopOutcome::Exited(status)) if status.success() => Ok(()),
            Ok(StopOutcome::Exited(status)) => Err(anyhow!("video encoder exited with {}", status)),
            Ok(StopOutcome::Killed(_)) => Err(anyhow!(
                "video encoder did not finish within {:?} and was killed",
                self.video_finalize_timeout
            )),
            Err(e) => Err(e),
        };

        let mut audio_path = None;
        if let Some(mut audio) = recording.audio.take() {
            let audio_label = format!("audio encoder {}", session_id);
            if let Some(pump) = audio.pump.take() {
                drain_pump(pump, &audio_label).await;
            }

            match interrupt_then_kill(&mut audio.child, self.audio_stop_timeout, &audio_label).await {
                Ok(StopOutcome::Exited(status)) => {
                    debug!("Audio encoder for session {} exited with {}", session_id, status);
                    audio_path = Some(audio.path);
                }
                Ok(StopOutcome::Killed(_)) => {
                    warn!(
                        "Audio encoder for session {} was killed; {:?} may be truncated",
                        session_id, audio.path
                    );
                    audio_path = Some(audio.path);
                }
                Err(e) => {
                    error!("Failed to stop audio encoder for session {}: {:#}", session_id, e);
                }
            }
        }

        match video_result {
            Ok(()) => {
                info!("Recording for session {} saved to {:?}", session_id, recording.video_path);
                Ok(StoppedRecording {
                    video_path: recording.video_path,
                    audio_path,
                })
            }
            Err(e) => Err(StopFailure::new(Some(recording.video_path), e)),
        }
    }
}

#[async_trait]
impl MediaRecorder for FfmpegRecorder {
    async fn start(
        &self,
        session_id: &str,
        video: BridgeReader,
        audio: Option<BridgeReader>,
    ) -> Result<()> {
        if self.is_active(session_id) {
            bail!("Recording already active for session {}", session_id);
        }

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create recording directory {:?}", self.output_dir))?;

        let video_path = self.video_path(session_id);
        let video_label = format!("video encoder {}", session_id);

        let mut command = self.commands.video(&video_path);
        command.stdin(Stdio::piped());
        let mut video_child = spawn_logged(command, &video_label)?;
        let video_stdin = video_child
            .stdin
            .take()
            .context("Video encoder stdin was not captured")?;

        let cancel = CancellationToken::new();
        let video_pump = tokio::spawn(pump(video, video_stdin, cancel.clone(), video_label));
        let audio = self.start_audio(session_id, audio, &cancel);

        let recording = ActiveRecording {
            video: video_child,
            video_pump,
            video_path: video_path.clone(),
            audio,
            cancel,
        };

        let rejected = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if active.contains_key(session_id) {
                Some(recording)
            } else {
                active.insert(session_id.to_string(), recording);
                None
            }
        };

        if let Some(recording) = rejected {
            // Lost a race with a concurrent start; tear down what we spawned
            if let Err(e) = self.finish(session_id, recording).await {
                warn!(
                    "Failed to tear down duplicate recording for session {}: {:#}",
                    session_id, e.source
                );
            }
            bail!("Recording already active for session {}", session_id);
        }

        info!("Started recording session {} to {:?}", session_id, video_path);
        Ok(())
    }

    async fn stop(&self, session_id: &str) -> Result<StoppedRecording, StopFailure> {
        // Removing first means a concurrent stop sees "no active recording"
        // instead of waiting on the same process handles.
        let recording = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);

        let Some(recording) = recording else {
            return Err(StopFailure::new(
                None,
                anyhow!("no active recording for session {}", session_id),
            ));
        };

        info!("Stopping recording for session {}", session_id);
        self.finish(session_id, recording).await
    }
}

/// Copy chunks from the bridge into an encoder's stdin until end-of-stream,
/// cancellation, or a write error. Returns the number of bytes forwarded.
async fn pump(
    mut reader: BridgeReader,
    mut stdin: ChildStdin,
    cancel: CancellationToken,
    label: String,
) -> u64 {
    let mut forwarded = 0u64;
    let mut closed = false;

    loop {
        let chunk = if closed {
            reader.read().await
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("{}: input closed by stop request", label);
                    // Unblocks the producer; chunks it already handed over are still read
                    reader.close();
                    closed = true;
                    continue;
                }
                chunk = reader.read() => chunk,
            }
        };

        let Some(chunk) = chunk else {
            debug!("{}: end of stream", label);
            break;
        };

        if let Err(e) = stdin.write_all(&chunk).await {
            warn!("{}: failed to write to encoder: {}", label, e);
            break;
        }
        forwarded += chunk.len() as u64;
    }

    reader.close();
    if let Err(e) = stdin.shutdown().await {
        debug!("{}: error closing encoder input: {}", label, e);
    }

    forwarded
}

/// Wait for a forwarding task, aborting it if it is stuck on a full pipe
async fn drain_pump(mut handle: JoinHandle<u64>, label: &str) -> u64 {
    match tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(forwarded)) => forwarded,
        Ok(Err(e)) => {
            warn!("{}: forwarding task failed: {}", label, e);
            0
        }
        Err(_) => {
            warn!("{}: forwarding task stuck, aborting", label);
            handle.abort();
            0
        }
    }
}
