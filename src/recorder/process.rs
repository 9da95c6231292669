//! Encoder subprocess helpers
//!
//! Spawning with logged stderr, and the two-phase "ask nicely, then force"
//! shutdown used for encoders that must finalize their container headers.

use anyhow::{Context, Result};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How a child process ended after a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own within the grace period
    Exited(ExitStatus),
    /// Did not exit in time and was killed
    Killed(Option<ExitStatus>),
}

impl StopOutcome {
    pub fn was_killed(&self) -> bool {
        matches!(self, StopOutcome::Killed(_))
    }
}

/// Spawn `command`, forwarding its stderr to debug logs under `label`
///
/// stdin and stdout are left as configured by the caller.
pub fn spawn_logged(mut command: Command, label: &str) -> Result<Child> {
    command.stderr(Stdio::piped()).kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {} process", label))?;

    if let Some(stderr) = child.stderr.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "encoder", "[{}] {}", label, line);
            }
        });
    }

    info!("Started {} process (pid {:?})", label, child.id());
    Ok(child)
}

/// Wait for `child` to exit, killing it if it takes longer than `timeout`
pub async fn wait_or_kill(child: &mut Child, timeout: Duration, label: &str) -> Result<StopOutcome> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.with_context(|| format!("Failed to wait for {} process", label))?;
            debug!("{} process exited with {}", label, status);
            Ok(StopOutcome::Exited(status))
        }
        Err(_) => {
            warn!(
                "{} process did not exit within {:?}, killing...",
                label, timeout
            );
            kill_and_reap(child, label).await
        }
    }
}

/// Ask `child` to stop gracefully, escalating to a kill after `timeout`
///
/// On unix this sends SIGINT, which ffmpeg treats as "finish the file and
/// exit". Elsewhere there is no graceful request and the child is killed.
pub async fn interrupt_then_kill(
    child: &mut Child,
    timeout: Duration,
    label: &str,
) -> Result<StopOutcome> {
    if let Some(status) = child
        .try_wait()
        .with_context(|| format!("Failed to check {} process status", label))?
    {
        debug!("{} process already exited with {}", label, status);
        return Ok(StopOutcome::Exited(status));
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            debug!("Sending SIGINT to {} process (pid {})", label, pid);
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
            if rc != 0 {
                warn!(
                    "Failed to signal {} process: {}",
                    label,
                    std::io::Error::last_os_error()
                );
            }
        }
        wait_or_kill(child, timeout, label).await
    }

    #[cfg(not(unix))]
    {
        let _ = timeout;
        kill_and_reap(child, label).await
    }
}

async fn kill_and_reap(child: &mut Child, label: &str) -> Result<StopOutcome> {
    child
        .start_kill()
        .with_context(|| format!("Failed to kill {} process", label))?;

    // SIGKILL cannot be ignored, but a process stuck in uninterruptible IO can
    // still take a moment to be reaped
    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .ok()
        .and_then(|status| status.ok());

    Ok(StopOutcome::Killed(status))
}
