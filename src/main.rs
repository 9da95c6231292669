//! meeting-recorder
//!
//! Joins online meetings with a headless browser and records them with
//! ffmpeg, driven over a small HTTP API.

mod automator;
mod config;
mod http;
mod logging;
mod recorder;
mod service;
mod session;

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use automator::ChromeAutomator;
use config::Config;
use recorder::FfmpegRecorder;
use service::RecordingService;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;

    let _log_guard = logging::init_logging()?;
    info!("meeting-recorder starting...");

    let config = Config::load(config_path.as_deref())?;
    if let Ok(path) = config.config_path() {
        info!("Configuration loaded from {:?}", path);
    }

    let runtime = tokio::runtime::Runtime::new()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = shutdown_tx.send(true);
    })?;

    let result = runtime.block_on(run(config, shutdown_rx));
    if let Err(e) = &result {
        error!("Fatal error: {:#}", e);
    }

    info!("Shutdown complete");
    result
}

async fn run(config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let output_dir = &config.recording.output_directory;
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;
    info!("Recordings will be written to {:?}", output_dir);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let automator = Arc::new(ChromeAutomator::new(&config, Some(event_tx)));
    let recorder = Arc::new(FfmpegRecorder::new(&config));
    let service = Arc::new(RecordingService::new(
        automator,
        recorder,
        config.recording.stop_capture_wait(),
    ));

    let events = tokio::spawn(service.clone().handle_events(event_rx));

    let listener = tokio::net::TcpListener::bind(config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;

    http::serve(listener, service.clone(), wait_for_shutdown(shutdown)).await?;

    service.shutdown().await;
    events.abort();
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens on exit
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn parse_config_path(args: &[String]) -> Result<Option<PathBuf>> {
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => match iter.next() {
                Some(path) => return Ok(Some(PathBuf::from(path))),
                None => bail!("{} requires a path", arg),
            },
            other => {
                if let Some(path) = other.strip_prefix("--config=") {
                    return Ok(Some(PathBuf::from(path)));
                }
                bail!("Unknown argument: {} (see --help)", other);
            }
        }
    }
    Ok(None)
}

fn print_help() {
    println!("meeting-recorder - Join and record online meetings");
    println!();
    println!("USAGE:");
    println!("    meeting-recorder [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help             Print this help message");
    println!("    -c, --config <PATH>    Use this config file instead of the default");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG                     Set log level (e.g., debug, info, warn)");
    println!("    MEETING_RECORDER_LOG_PATH    Directory for log files");
    println!();
    println!("API:");
    println!("    POST /meetings/start                 {{\"meetingUrl\", \"participantName\"}}");
    println!("    POST /meetings/stop/<sessionId>");
    println!("    GET  /meetings/status/<sessionId>");
    println!("    GET  /meetings/snapshot/<sessionId>");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("meeting-recorder")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_config_path() {
        assert_eq!(parse_config_path(&args(&[])).unwrap(), None);
        assert_eq!(
            parse_config_path(&args(&["-c", "/etc/recorder.toml"])).unwrap(),
            Some(PathBuf::from("/etc/recorder.toml"))
        );
        assert_eq!(
            parse_config_path(&args(&["--config=/tmp/a.toml"])).unwrap(),
            Some(PathBuf::from("/tmp/a.toml"))
        );
        assert!(parse_config_path(&args(&["--config"])).is_err());
        assert!(parse_config_path(&args(&["--bogus"])).is_err());
    }
}
