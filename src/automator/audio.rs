//! Live meeting audio from a PulseAudio source

use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::recorder::{spawn_logged, stream_bridge, BridgeReader};

/// Bytes per chunk handed to the bridge (~21ms of 48kHz stereo s16le)
const CHUNK_SIZE: usize = 4096;

/// Capture `device` with `parec` as raw s16le PCM
///
/// The capture runs until `stop` is cancelled, the reader goes away, or
/// `parec` exits.
pub fn spawn_pulse_capture(
    device: &str,
    sample_rate: u32,
    channels: u32,
    session_id: &str,
    stop: CancellationToken,
) -> Result<BridgeReader> {
    let mut command = Command::new("parec");
    command
        .arg(format!("--device={}", device))
        .arg("--format=s16le")
        .arg(format!("--rate={}", sample_rate))
        .arg(format!("--channels={}", channels))
        .arg("--raw")
        .stdin(Stdio::null())
        .stdout(Stdio::piped());

    let label = format!("audio capture {}", session_id);
    let mut child = spawn_logged(command, &label)?;
    let mut stdout = child
        .stdout
        .take()
        .context("parec stdout was not captured")?;

    let (writer, reader) = stream_bridge();
    info!("Capturing audio for session {} from {}", session_id, device);

    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = tokio::select! {
                _ = stop.cancelled() => break,
                _ = writer.closed() => break,
                read = stdout.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!("{}: source closed", label);
                    break;
                }
                Ok(n) => {
                    if writer.write(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{}: read failed: {}", label, e);
                    break;
                }
            }
        }

        let _ = child.start_kill();
        let _ = child.wait().await;
        debug!("{}: stopped", label);
    });

    Ok(reader)
}
