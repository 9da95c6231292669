//! Configuration management for meeting-recorder

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Recording lifecycle configuration
    #[serde(default)]
    pub recording: RecordingConfig,

    /// ffmpeg encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Headless browser configuration
    #[serde(default)]
    pub browser: BrowserConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP API listens on
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Directory recordings are written to
    #[serde(default = "default_output_directory")]
    pub output_directory: PathBuf,

    /// Frames per second fed to the video encoder
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    /// How long the audio encoder gets to finalize after SIGINT (ms)
    #[serde(default = "default_audio_stop_timeout_ms")]
    pub audio_stop_timeout_ms: u64,

    /// How long the video encoder gets to finish after end-of-input (ms)
    #[serde(default = "default_video_finalize_timeout_ms")]
    pub video_finalize_timeout_ms: u64,

    /// How long a stop request waits for a capture that is still starting (ms)
    #[serde(default = "default_stop_capture_wait_ms")]
    pub stop_capture_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// ffmpeg binary (looked up on PATH when not absolute)
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    #[serde(default = "default_preset")]
    pub preset: String,

    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,

    /// Sample rate of raw PCM coming from the audio producer
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,

    #[serde(default = "default_audio_channels")]
    pub audio_channels: u32,

    /// PulseAudio source recorded directly when the browser provides no audio stream
    #[serde(default = "default_fallback_audio_device")]
    pub fallback_audio_device: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Chrome/Chromium binary
    #[serde(default = "default_chrome_path")]
    pub chrome_path: PathBuf,

    /// Parent directory for per-session browser profiles
    #[serde(default = "default_profile_root")]
    pub profile_root: PathBuf,

    #[serde(default = "default_true")]
    pub headless: bool,

    /// Overall budget for the join flow (s)
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,

    /// Delay between join attempts (ms)
    #[serde(default = "default_join_poll_interval_ms")]
    pub join_poll_interval_ms: u64,

    /// Wait after navigation before the join flow starts (s)
    #[serde(default = "default_navigation_settle_secs")]
    pub navigation_settle_secs: u64,

    /// Wait after clicking join before reporting success (s)
    #[serde(default = "default_post_join_settle_secs")]
    pub post_join_settle_secs: u64,

    /// Interval of the meeting-ended check (s)
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// Interval between captured frames (ms)
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,

    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,

    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,

    /// User agent override
    #[serde(default)]
    pub user_agent: Option<String>,

    /// PulseAudio source captured as the live audio stream (e.g. "meeting_sink.monitor").
    /// When unset the encoder records `encoder.fallback_audio_device` itself.
    #[serde(default)]
    pub audio_capture_device: Option<String>,
}

// Default value functions
fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8081))
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("./recordings")
}

fn default_frame_rate() -> u32 {
    5
}

fn default_audio_stop_timeout_ms() -> u64 {
    2000
}

fn default_video_finalize_timeout_ms() -> u64 {
    30_000
}

fn default_stop_capture_wait_ms() -> u64 {
    5000
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

fn default_audio_sample_rate() -> u32 {
    48_000
}

fn default_audio_channels() -> u32 {
    2
}

fn default_fallback_audio_device() -> String {
    "default".to_string()
}

fn default_chrome_path() -> PathBuf {
    PathBuf::from("/usr/bin/google-chrome")
}

fn default_profile_root() -> PathBuf {
    std::env::temp_dir().join("meeting-recorder-profiles")
}

fn default_true() -> bool {
    true
}

fn default_join_timeout_secs() -> u64 {
    45
}

fn default_join_poll_interval_ms() -> u64 {
    2000
}

fn default_navigation_settle_secs() -> u64 {
    5
}

fn default_post_join_settle_secs() -> u64 {
    10
}

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_capture_interval_ms() -> u64 {
    200 // 5 fps
}

fn default_viewport_width() -> u32 {
    1920
}

fn default_viewport_height() -> u32 {
    1080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_directory: default_output_directory(),
            frame_rate: default_frame_rate(),
            audio_stop_timeout_ms: default_audio_stop_timeout_ms(),
            video_finalize_timeout_ms: default_video_finalize_timeout_ms(),
            stop_capture_wait_ms: default_stop_capture_wait_ms(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            video_codec: default_video_codec(),
            preset: default_preset(),
            pixel_format: default_pixel_format(),
            audio_sample_rate: default_audio_sample_rate(),
            audio_channels: default_audio_channels(),
            fallback_audio_device: default_fallback_audio_device(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: default_chrome_path(),
            profile_root: default_profile_root(),
            headless: true,
            join_timeout_secs: default_join_timeout_secs(),
            join_poll_interval_ms: default_join_poll_interval_ms(),
            navigation_settle_secs: default_navigation_settle_secs(),
            post_join_settle_secs: default_post_join_settle_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            capture_interval_ms: default_capture_interval_ms(),
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            user_agent: None,
            audio_capture_device: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            recording: RecordingConfig::default(),
            encoder: EncoderConfig::default(),
            browser: BrowserConfig::default(),
            config_path: None,
        }
    }
}

impl RecordingConfig {
    pub fn audio_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.audio_stop_timeout_ms)
    }

    pub fn video_finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.video_finalize_timeout_ms)
    }

    pub fn stop_capture_wait(&self) -> Duration {
        Duration::from_millis(self.stop_capture_wait_ms)
    }
}

impl Config {
    /// Load configuration from `path`, or the default location when `None`
    ///
    /// A missing file is created with default values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let mut config = Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            config.config_path = Some(config_path);
            Ok(config)
        } else {
            // Create default config
            let config = Config {
                config_path: Some(config_path),
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "meeting-recorder", "recorder")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}
