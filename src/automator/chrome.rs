//! Chrome automation over the DevTools protocol
//!
//! Each session gets its own Chrome process and profile directory. The page
//! is driven with injected scripts; frames are captured with
//! `Page.captureScreenshot`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audio::spawn_pulse_capture;
use super::devtools::DevToolsClient;
use super::{BrowserAutomator, MeetingEvent, MeetingStreams};
use crate::config::{BrowserConfig, Config};
use crate::recorder::{stream_bridge, wait_or_kill, BridgeWriter};
use crate::session::Session;

const DEVTOOLS_STARTUP_TIMEOUT: Duration = Duration::from_secs(20);
const BROWSER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const DEVTOOLS_BANNER: &str = "DevTools listening on ";

/// Page text that means the bot is no longer in the meeting
const ENDED_PHRASES: &[&str] = &[
    "You have been removed",
    "Someone removed you",
    "Meeting ended",
    "Call ended",
    "Quality of this call",
    "How was the quality",
];

/// Pre-join flow, called with the participant name. Skips device prompts,
/// turns off mic and camera, fills in the name and clicks join when possible.
const JOIN_SCRIPT: &str = r#"(name) => {
    const lower = (s) => (s || '').toLowerCase();
    const buttons = Array.from(document.querySelectorAll('button'));

    const skipMedia = buttons.find(b => lower(b.innerText).includes('continue without audio'));
    if (skipMedia) skipMedia.click();

    for (const toggle of document.querySelectorAll('input[role="switch"]')) {
        const label = lower(toggle.getAttribute('aria-label'));
        const on = toggle.checked || toggle.getAttribute('aria-checked') === 'true';
        if (on && (label.includes('mic') || label.includes('camera') || label.includes('video'))) {
            toggle.click();
        }
    }

    const input = Array.from(document.querySelectorAll('input')).find(i =>
        i.getAttribute('data-tid') === 'prejoin-display-name-input' ||
        lower(i.placeholder).includes('name') ||
        lower(i.getAttribute('aria-label')).includes('name'));
    if (input && input.value !== name) {
        const setter = Object.getOwnPropertyDescriptor(HTMLInputElement.prototype, 'value').set;
        setter.call(input, name);
        for (const type of ['input', 'change', 'blur']) {
            input.dispatchEvent(new Event(type, { bubbles: true }));
        }
    }

    const join = buttons.find(b =>
        b.getAttribute('data-tid') === 'prejoin-join-button' ||
        ['join now', 'ask to join', 'join'].includes(lower(b.innerText).trim()) ||
        lower(b.getAttribute('aria-label')) === 'join now');
    if (!join) return input ? 'waiting_for_join_button' : 'input_not_found';
    if (join.disabled) return 'waiting_for_join_button';
    join.click();
    return 'joined';
}"#;

/// Rewrite meeting links that need a different entry point in a browser
///
/// Teams consumer links (`teams.live.com/meet/<id>?p=<code>`) are turned into
/// the anonymous web-join deep link; other URLs are returned unchanged.
pub fn rewrite_meeting_url(url: &str) -> String {
    const TEAMS_LIVE: &str = "teams.live.com/meet/";

    let Some(idx) = url.find(TEAMS_LIVE) else {
        return url.to_string();
    };

    let rest = &url[idx + TEAMS_LIVE.len()..];
    let (meeting_id, query) = rest.split_once('?').unwrap_or((rest, ""));
    if meeting_id.is_empty() {
        return url.to_string();
    }

    let passcode = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("p="))
        .unwrap_or("");

    format!(
        "https://teams.live.com/_#/meet/{}?p={}&anon=true",
        meeting_id, passcode
    )
}

/// Browser resources held for one session
struct BrowserSession {
    process: tokio::sync::Mutex<Child>,
    browser: DevToolsClient,
    page: Arc<DevToolsClient>,
    /// Cancelled exactly once, by `stop_meeting`; stops the monitor and capture
    stop: CancellationToken,
    profile_dir: PathBuf,
}

/// [`BrowserAutomator`] driving one headless Chrome per session
pub struct ChromeAutomator {
    config: BrowserConfig,
    audio_sample_rate: u32,
    audio_channels: u32,
    events: Option<mpsc::UnboundedSender<MeetingEvent>>,
    sessions: Mutex<HashMap<String, Arc<BrowserSession>>>,
}

impl ChromeAutomator {
    /// Create an automator; meeting-ended notices go to `events` when given
    pub fn new(config: &Config, events: Option<mpsc::UnboundedSender<MeetingEvent>>) -> Self {
        Self {
            config: config.browser.clone(),
            audio_sample_rate: config.encoder.audio_sample_rate,
            audio_channels: config.encoder.audio_channels,
            events,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session(&self, session_id: &str) -> Option<Arc<BrowserSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn require_session(&self, session_id: &str) -> Result<Arc<BrowserSession>> {
        self.session(session_id)
            .with_context(|| format!("page not found for session {}", session_id))
    }

    fn chrome_args(&self, profile_dir: &Path) -> Vec<String> {
        let mut args = Vec::new();
        if self.config.headless {
            args.push("--headless=new".to_string());
        }
        args.extend(
            [
                "--remote-debugging-port=0",
                "--no-sandbox",
                "--disable-gpu",
                "--disable-dev-shm-usage",
                "--no-first-run",
                "--no-default-browser-check",
                "--use-fake-ui-for-media-stream",
                "--use-fake-device-for-media-stream",
                "--autoplay-policy=no-user-gesture-required",
                "--disable-notifications",
                "--disable-popup-blocking",
            ]
            .map(String::from),
        );
        args.push(format!("--user-data-dir={}", profile_dir.display()));
        args.push(format!(
            "--window-size={},{}",
            self.config.viewport_width, self.config.viewport_height
        ));
        if let Some(user_agent) = &self.config.user_agent {
            args.push(format!("--user-agent={}", user_agent));
        }
        args.push("about:blank".to_string());
        args
    }

    /// Start Chrome and open a controllable page
    async fn launch(&self, session_id: &str, profile_dir: &Path) -> Result<BrowserSession> {
        let mut command = Command::new(&self.config.chrome_path);
        command
            .args(self.chrome_args(profile_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Launching browser for session {}", session_id);
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {:?}", self.config.chrome_path))?;

        let stderr = child.stderr.take().context("Browser stderr was not captured")?;
        let mut lines = BufReader::new(stderr).lines();
        let browser_url = tokio::time::timeout(DEVTOOLS_STARTUP_TIMEOUT, wait_for_devtools_url(&mut lines))
            .await
            .context("Timed out waiting for the browser DevTools endpoint")??;

        let label = format!("browser {}", session_id);
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "browser", "[{}] {}", label, line);
            }
        });

        let browser = DevToolsClient::connect(&browser_url).await?;
        let target = browser
            .call("Target.createTarget", json!({ "url": "about:blank" }))
            .await?;
        let target_id = target
            .get("targetId")
            .and_then(Value::as_str)
            .context("Target.createTarget returned no targetId")?;
        let page_url = page_ws_url(&browser_url, target_id)
            .with_context(|| format!("Unexpected DevTools endpoint {}", browser_url))?;
        let page = DevToolsClient::connect(&page_url).await?;

        page.call("Page.enable", json!({})).await?;
        page.call(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": self.config.viewport_width,
                "height": self.config.viewport_height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;
        if let Some(user_agent) = &self.config.user_agent {
            page.call("Network.setUserAgentOverride", json!({ "userAgent": user_agent }))
                .await?;
        }

        Ok(BrowserSession {
            process: tokio::sync::Mutex::new(child),
            browser,
            page: Arc::new(page),
            stop: CancellationToken::new(),
            profile_dir: profile_dir.to_path_buf(),
        })
    }

    /// Navigate and retry the join script until it reports success
    async fn run_join_flow(&self, browser: &BrowserSession, session: &Session) -> Result<()> {
        let url = rewrite_meeting_url(&session.meeting_url);

        if let Some(origin) = url_origin(&url) {
            if let Err(e) = browser
                .browser
                .call(
                    "Browser.grantPermissions",
                    json!({
                        "origin": origin,
                        "permissions": ["audioCapture", "videoCapture", "notifications"],
                    }),
                )
                .await
            {
                warn!("Failed to grant media permissions for session {}: {:#}", session.id, e);
            }
        }

        spawn_dialog_handler(browser.page.clone(), browser.stop.clone());

        info!("Navigating session {} to {}", session.id, url);
        browser
            .page
            .call("Page.navigate", json!({ "url": url }))
            .await
            .context("Failed to navigate to meeting")?;
        pause(&browser.stop, Duration::from_secs(self.config.navigation_settle_secs)).await?;

        let script = format!("({})({})", JOIN_SCRIPT, Value::from(session.participant_name.as_str()));
        let poll = Duration::from_millis(self.config.join_poll_interval_ms);
        let deadline = Instant::now() + Duration::from_secs(self.config.join_timeout_secs);

        while Instant::now() < deadline {
            match browser.page.evaluate(&script).await {
                Ok(Value::String(state)) if state == "joined" => {
                    info!("Triggered join for session {}", session.id);
                    return Ok(());
                }
                Ok(state) => debug!("Join state for session {}: {}", session.id, state),
                Err(e) => debug!("Join attempt for session {} failed: {:#}", session.id, e),
            }
            pause(&browser.stop, poll).await?;
        }

        bail!(
            "failed to join meeting after {} seconds",
            self.config.join_timeout_secs
        )
    }

    /// Watch the page for end-of-meeting text until the session is stopped
    fn spawn_monitor(&self, session_id: &str, page: Arc<DevToolsClient>, stop: CancellationToken) {
        let interval = Duration::from_secs(self.config.monitor_interval_secs.max(1));
        let events = self.events.clone();
        let session_id = session_id.to_string();
        let script = format!(
            "(() => {{ const text = document.body ? document.body.innerText : ''; return {}.some(p => text.includes(p)); }})()",
            json!(ENDED_PHRASES)
        );

        tokio::spawn(async move {
            debug!("Monitoring session {} for exit conditions", session_id);
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!("Monitor for session {} stopped", session_id);
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                match page.evaluate(&script).await {
                    Ok(Value::Bool(true)) => {
                        info!("Detected end of meeting for session {}", session_id);
                        match &events {
                            Some(events) => {
                                let _ = events.send(MeetingEvent::Ended { session_id });
                            }
                            None => warn!("No listener for meeting end of session {}", session_id),
                        }
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Exit check for session {} failed: {:#}", session_id, e),
                }
            }
        });
    }
}

#[async_trait]
impl BrowserAutomator for ChromeAutomator {
    async fn join_meeting(&self, session: &Session) -> Result<()> {
        if self.session(&session.id).is_some() {
            bail!("Browser already running for session {}", session.id);
        }

        let profile_dir = self.config.profile_root.join(&session.id);
        tokio::fs::create_dir_all(&profile_dir)
            .await
            .with_context(|| format!("Failed to create browser profile {:?}", profile_dir))?;

        let browser = match self.launch(&session.id, &profile_dir).await {
            Ok(browser) => Arc::new(browser),
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&profile_dir).await;
                return Err(e.context("failed to launch browser"));
            }
        };

        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id.clone(), browser.clone());

        if let Err(e) = self.run_join_flow(&browser, session).await {
            if let Err(cleanup) = self.stop_meeting(&session.id).await {
                warn!("Cleanup after failed join of session {} failed: {:#}", session.id, cleanup);
            }
            return Err(e);
        }

        self.spawn_monitor(&session.id, browser.page.clone(), browser.stop.clone());
        pause(&browser.stop, Duration::from_secs(self.config.post_join_settle_secs)).await?;
        Ok(())
    }

    async fn get_meeting_streams(&self, session_id: &str) -> Result<MeetingStreams> {
        let browser = self.require_session(session_id)?;

        let (writer, video) = stream_bridge();
        tokio::spawn(capture_frames(
            session_id.to_string(),
            browser.page.clone(),
            writer,
            browser.stop.clone(),
            Duration::from_millis(self.config.capture_interval_ms.max(1)),
        ));

        let audio = match &self.config.audio_capture_device {
            Some(device) => match spawn_pulse_capture(
                device,
                self.audio_sample_rate,
                self.audio_channels,
                session_id,
                browser.stop.clone(),
            ) {
                Ok(reader) => Some(reader),
                Err(e) => {
                    warn!("Audio capture unavailable for session {}: {:#}", session_id, e);
                    None
                }
            },
            None => None,
        };

        Ok(MeetingStreams { video, audio })
    }

    async fn stop_meeting(&self, session_id: &str) -> Result<()> {
        info!("StopMeeting called for session {}", session_id);

        let browser = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        let Some(browser) = browser else {
            debug!("No browser running for session {}", session_id);
            return Ok(());
        };

        browser.stop.cancel();

        if let Err(e) = browser.browser.call("Browser.close", json!({})).await {
            // The connection often drops before the reply arrives
            debug!("Browser.close for session {}: {:#}", session_id, e);
        }

        let label = format!("browser {}", session_id);
        let outcome = {
            let mut process = browser.process.lock().await;
            wait_or_kill(&mut process, BROWSER_EXIT_TIMEOUT, &label).await
        };

        if let Err(e) = tokio::fs::remove_dir_all(&browser.profile_dir).await {
            warn!(
                "Failed to remove browser profile {:?}: {}",
                browser.profile_dir, e
            );
        }

        if outcome?.was_killed() {
            bail!("browser for session {} had to be killed", session_id);
        }
        Ok(())
    }

    async fn get_snapshot(&self, session_id: &str) -> Result<Vec<u8>> {
        let browser = self.require_session(session_id)?;
        capture_png(&browser.page).await
    }
}

/// Read browser stderr until it announces its DevTools websocket
async fn wait_for_devtools_url(lines: &mut Lines<BufReader<ChildStderr>>) -> Result<String> {
    while let Some(line) = lines.next_line().await? {
        debug!(target: "browser", "{}", line);
        if let Some(url) = parse_devtools_url(&line) {
            return Ok(url);
        }
    }
    bail!("browser exited before exposing DevTools")
}

fn parse_devtools_url(line: &str) -> Option<String> {
    line.trim()
        .strip_prefix(DEVTOOLS_BANNER)
        .map(|url| url.trim().to_string())
        .filter(|url| url.starts_with("ws://"))
}

/// `ws://host:port/devtools/browser/<id>` -> `ws://host:port/devtools/page/<target>`
fn page_ws_url(browser_url: &str, target_id: &str) -> Option<String> {
    let idx = browser_url.find("/devtools/browser/")?;
    Some(format!("{}/devtools/page/{}", &browser_url[..idx], target_id))
}

/// `scheme://host[:port]` of an absolute URL
fn url_origin(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split(['/', '?', '#']).next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{}://{}", scheme, host))
}

/// Sleep unless the session is stopped first
async fn pause(stop: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = stop.cancelled() => bail!("meeting was stopped"),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

async fn capture_png(page: &DevToolsClient) -> Result<Vec<u8>> {
    let result = page
        .call("Page.captureScreenshot", json!({ "format": "png" }))
        .await?;
    let data = result
        .get("data")
        .and_then(Value::as_str)
        .context("Screenshot response had no data")?;

    base64::engine::general_purpose::STANDARD
        .decode(data)
        .context("Screenshot data was not valid base64")
}

/// Push screenshots into the video bridge at a fixed cadence
async fn capture_frames(
    session_id: String,
    page: Arc<DevToolsClient>,
    writer: BridgeWriter,
    stop: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut frames = 0u64;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = writer.closed() => break,
            _ = ticker.tick() => {}
        }

        let frame = match capture_png(&page).await {
            Ok(frame) => frame,
            Err(e) => {
                // Usually the browser went away
                warn!("Error capturing frame for session {}: {:#}", session_id, e);
                break;
            }
        };

        if writer.write(frame).await.is_err() {
            debug!("Video reader for session {} closed", session_id);
            break;
        }
        frames += 1;
    }

    info!(
        "Frame capture for session {} stopped after {} frames",
        session_id, frames
    );
}

/// Accept any alert/confirm so it cannot block the page
fn spawn_dialog_handler(page: Arc<DevToolsClient>, stop: CancellationToken) {
    let mut events = page.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => return,
                event = events.recv() => event,
            };

            match event {
                Ok(event) if event.method == "Page.javascriptDialogOpening" => {
                    debug!("Dismissing page dialog: {}", event.params);
                    if let Err(e) = page
                        .call("Page.handleJavaScriptDialog", json!({ "accept": true }))
                        .await
                    {
                        debug!("Failed to dismiss dialog: {:#}", e);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}
