//! segcast
//!
//! Records the screen in fixed-length segments and exports each one as a
//! seekable WebM file. Capture runs through an ffmpeg process; the session
//! is driven by line commands on stdin.

mod capture;
mod config;
mod crash;
mod export;
mod logging;
mod recorder;
mod repair;
mod session;
#[cfg(test)]
mod testing;

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use capture::FfmpegCaptureSource;
use config::Config;
use export::FileExportSink;
use repair::EbmlRepair;
use session::{
    create_session_channels, SessionCommand, SessionController, SessionSettings, SessionStatus,
    SystemClock,
};

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    help: bool,
    config_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    let _log_guard = logging::init_logging()?;
    info!("segcast {} starting...", env!("CARGO_PKG_VERSION"));

    match logging::get_log_dir().and_then(|dir| Ok(crash::init_crash_handler(&dir)?)) {
        Ok(path) => debug!("Crash log at {:?}", path),
        Err(e) => warn!("Failed to install crash handler: {}", e),
    }

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    info!("Configuration loaded from {:?}", config.config_path()?);

    let settings = SessionSettings::from_config(&config);
    let capture = Arc::new(FfmpegCaptureSource::new(config.capture.clone()));
    let sink = Arc::new(FileExportSink::new(config.recording.output_directory.clone()));
    info!("Segments will be written to {}", sink.output_dir().display());

    let runtime = tokio::runtime::Runtime::new()?;
    let (cmd_tx, cmd_rx, status_tx, status_rx) = create_session_channels();

    // The controller spawns its export pipeline, so it needs the runtime context
    let controller = {
        let _enter = runtime.enter();
        SessionController::new(
            settings,
            capture,
            Arc::new(EbmlRepair),
            sink,
            Arc::new(SystemClock),
            cmd_rx,
            status_tx,
        )
    };
    runtime.spawn(log_statuses(status_rx));

    // Set up Ctrl+C handler that sends shutdown command
    let ctrl_c_tx = cmd_tx.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = ctrl_c_tx.blocking_send(SessionCommand::Shutdown);
    })?;

    std::thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || read_commands(cmd_tx))
        .context("Failed to spawn command reader")?;

    println!("Commands: start | pause | stop | quit");
    runtime.block_on(controller.run());

    info!("Shutdown complete");
    Ok(())
}

fn parse_args<I>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "-c" | "--config" => {
                let path = args.next().context("--config requires a path")?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            other => bail!("Unknown argument: {}", other),
        }
    }

    Ok(parsed)
}

fn parse_command(line: &str) -> Option<SessionCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "start" | "resume" => Some(SessionCommand::Start),
        "pause" => Some(SessionCommand::Pause),
        "stop" => Some(SessionCommand::Stop),
        "quit" | "exit" => Some(SessionCommand::Shutdown),
        _ => None,
    }
}

/// Forward stdin lines to the controller until quit or EOF
fn read_commands(cmd_tx: mpsc::Sender<SessionCommand>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to read command: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let Some(cmd) = parse_command(&line) else {
            println!("Unknown command {:?}; expected start, pause, stop or quit", line.trim());
            continue;
        };

        if cmd_tx.blocking_send(cmd).is_err() || cmd == SessionCommand::Shutdown {
            return;
        }
    }
    debug!("stdin closed; use Ctrl+C to exit");
}

async fn log_statuses(mut status_rx: broadcast::Receiver<SessionStatus>) {
    loop {
        match status_rx.recv().await {
            Ok(SessionStatus::Idle) => info!("Idle"),
            Ok(SessionStatus::Recording { started_at }) => {
                info!("Recording (session {})", started_at)
            }
            Ok(SessionStatus::Paused) => info!("Paused"),
            Ok(SessionStatus::Exported {
                path,
                segment_index,
            }) => info!("Segment {} saved to {}", segment_index, path.display()),
            Ok(SessionStatus::ExportFailed { file_name, message }) => {
                error!("Segment {} lost: {}", file_name, message)
            }
            Ok(SessionStatus::Error(message)) => error!("Session error: {}", message),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Status log lagged, {} updates skipped", missed)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_help() {
    println!("segcast - segmented screen recorder");
    println!();
    println!("USAGE:");
    println!("    segcast [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help            Print this help message");
    println!("    -c, --config <PATH>   Use an alternative config file");
    println!();
    println!("COMMANDS (stdin):");
    println!("    start    Start recording, or resume when paused");
    println!("    pause    Pause recording");
    println!("    stop     Stop and export the last segment");
    println!("    quit     Stop and exit");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG            Set log level (e.g., debug, info, warn)");
    println!("    SEGCAST_LOG_PATH    Override the log directory");
}
