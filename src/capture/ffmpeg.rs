//! Screen capture through an external ffmpeg process
//!
//! Each recorder spawns one ffmpeg encoder that grabs the display (and
//! microphone) and writes a VP9/Opus WebM stream to stdout. Output is
//! buffered and handed to the session as chunks on the flush interval.
//! Stopping sends `q` on stdin so ffmpeg closes the container cleanly.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{CaptureConstraints, CaptureError, CaptureSource, CaptureStream};
use crate::config::CaptureConfig;
use crate::recorder::{RecorderBackend, RecorderError, RecorderEvent};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const ENCODER_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fully resolved ffmpeg command line shared by every recorder of a stream
#[derive(Debug, Clone)]
struct Invocation {
    program: PathBuf,
    args: Vec<String>,
}

/// Capture source backed by ffmpeg's platform grabbers
pub struct FfmpegCaptureSource {
    config: CaptureConfig,
}

impl FfmpegCaptureSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    /// Default grabber arguments for the current platform
    fn default_input_args(&self, with_audio: Option<u32>) -> Vec<String> {
        let framerate = self.config.framerate.to_string();

        #[cfg(target_os = "macos")]
        {
            let device = if with_audio.is_some() { "1:0" } else { "1:none" };
            let mut args = vec![
                "-f".to_string(),
                "avfoundation".to_string(),
                "-capture_cursor".to_string(),
                "1".to_string(),
                "-framerate".to_string(),
                framerate,
            ];
            if let Some(rate) = with_audio {
                args.extend(["-sample_rate".to_string(), rate.to_string()]);
            }
            args.extend(["-i".to_string(), device.to_string()]);
            args
        }

        #[cfg(target_os = "windows")]
        {
            // gdigrab has no audio; audio needs an explicit dshow device in config
            let _ = with_audio;
            vec![
                "-f".to_string(),
                "gdigrab".to_string(),
                "-framerate".to_string(),
                framerate,
                "-i".to_string(),
                "desktop".to_string(),
            ]
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".to_string());
            let mut args = vec![
                "-f".to_string(),
                "x11grab".to_string(),
                "-framerate".to_string(),
                framerate,
                "-i".to_string(),
                display,
            ];
            if let Some(rate) = with_audio {
                args.extend([
                    "-f".to_string(),
                    "pulse".to_string(),
                    "-sample_rate".to_string(),
                    rate.to_string(),
                    "-i".to_string(),
                    "default".to_string(),
                ]);
            }
            args
        }
    }

    fn build_invocation(&self, constraints: &CaptureConstraints) -> Invocation {
        let audio = constraints.audio.as_ref();

        let mut args = vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
        ];
        match &self.config.input_args {
            Some(custom) => args.extend(custom.iter().cloned()),
            None => args.extend(self.default_input_args(audio.map(|a| a.sample_rate))),
        }

        args.extend(
            [
                "-c:v",
                "libvpx-vp9",
                "-deadline",
                "realtime",
                "-cpu-used",
                "8",
                "-row-mt",
                "1",
            ]
            .map(String::from),
        );
        args.extend(["-b:v".to_string(), format!("{}k", self.config.video_bitrate_kbps)]);

        match audio {
            Some(audio) => {
                args.extend(["-c:a", "libopus"].map(String::from));
                if audio.noise_suppression {
                    args.extend(["-af", "afftdn"].map(String::from));
                }
                if audio.echo_cancellation {
                    debug!("Echo cancellation requested; ffmpeg has no canceller, ignoring");
                }
            }
            None => args.push("-an".to_string()),
        }

        args.extend(["-f", "webm", "pipe:1"].map(String::from));

        Invocation {
            program: self.config.ffmpeg_path.clone(),
            args,
        }
    }
}

#[async_trait]
impl CaptureSource for FfmpegCaptureSource {
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        if !constraints.video {
            return Err(CaptureError::Unsupported(
                "ffmpeg capture always records the display".to_string(),
            ));
        }

        let output = Command::new(&self.config.ffmpeg_path)
            .args(["-hide_banner", "-version"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                let reason = format!("failed to run {:?}: {}", self.config.ffmpeg_path, e);
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    CaptureError::PermissionDenied(reason)
                } else {
                    CaptureError::Unavailable(reason)
                }
            })?;
        if !output.status.success() {
            return Err(CaptureError::Unavailable(format!(
                "{:?} -version exited with {}",
                self.config.ffmpeg_path, output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        let version = version.lines().next().unwrap_or("ffmpeg").to_string();
        info!("Capture stream acquired via {}", version);

        Ok(Box::new(FfmpegStream {
            invocation: Arc::new(self.build_invocation(constraints)),
            label: version,
            released: false,
        }))
    }
}

/// A "stream" is the grabber configuration; every recorder opens the
/// devices itself
struct FfmpegStream {
    invocation: Arc<Invocation>,
    label: String,
    released: bool,
}

impl CaptureStream for FfmpegStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn create_recorder(&self) -> Result<Box<dyn RecorderBackend>, CaptureError> {
        if self.released {
            return Err(CaptureError::Released);
        }
        Ok(Box::new(FfmpegRecorder::new(self.invocation.clone())))
    }

    fn stop(&mut self) {
        if !self.released {
            debug!("Releasing capture stream {}", self.label);
            self.released = true;
        }
    }
}

struct FfmpegRecorder {
    invocation: Arc<Invocation>,
    /// How long a stopping encoder may take to exit before it is killed
    exit_timeout: Duration,
    control_tx: Option<mpsc::UnboundedSender<EncoderControl>>,
    pid: Option<u32>,
}

impl FfmpegRecorder {
    fn new(invocation: Arc<Invocation>) -> Self {
        Self {
            invocation,
            exit_timeout: ENCODER_EXIT_TIMEOUT,
            control_tx: None,
            pid: None,
        }
    }

    fn send(&self, control: EncoderControl) {
        if let Some(control_tx) = &self.control_tx {
            let _ = control_tx.send(control);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncoderControl {
    Suspend,
    Continue,
    Stop,
}

impl RecorderBackend for FfmpegRecorder {
    fn start(
        &mut self,
        flush_interval: Duration,
        tx: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), RecorderError> {
        if self.control_tx.is_some() {
            return Err(RecorderError::AlreadyStarted);
        }

        debug!(
            "Spawning encoder: {:?} {}",
            self.invocation.program,
            self.invocation.args.join(" ")
        );
        let mut child = Command::new(&self.invocation.program)
            .args(&self.invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(RecorderError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(RecorderError::MissingPipe("stdout"))?;
        self.pid = child.id();
        debug!("Encoder running with pid {:?}", self.pid);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        self.control_tx = Some(control_tx);
        tokio::spawn(pump_encoder(
            child,
            stdin,
            stdout,
            flush_interval,
            self.exit_timeout,
            tx,
            control_rx,
        ));

        Ok(())
    }

    fn stop(&mut self) {
        self.send(EncoderControl::Stop);
        self.control_tx = None;
    }

    fn pause(&mut self) {
        self.send(EncoderControl::Suspend);
    }

    fn resume(&mut self) {
        self.send(EncoderControl::Continue);
    }
}

/// Stop or continue the encoder process
#[cfg(unix)]
fn signal_encoder(child: &Child, suspend: bool) -> std::io::Result<()> {
    let pid = child.id().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "encoder has already exited")
    })?;
    let signal = if suspend { libc::SIGSTOP } else { libc::SIGCONT };

    // SAFETY: the child has not been reaped, so the pid still refers to it
    if unsafe { libc::kill(pid as libc::pid_t, signal) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn signal_encoder(_child: &Child, _suspend: bool) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "suspending the encoder is not supported on this platform",
    ))
}

/// Forward encoder output as chunks until ffmpeg exits
async fn pump_encoder(
    mut child: Child,
    stdin: ChildStdin,
    mut stdout: ChildStdout,
    flush_interval: Duration,
    exit_timeout: Duration,
    tx: mpsc::UnboundedSender<RecorderEvent>,
    mut control_rx: mpsc::UnboundedReceiver<EncoderControl>,
) {
    let mut stdin = Some(stdin);
    let mut suspended = false;
    let mut pending = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut flush_timer = tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
    // Armed once `q` has been sent
    let exit_deadline = tokio::time::sleep(exit_timeout);
    tokio::pin!(exit_deadline);

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => pending.extend_from_slice(&buf[..n]),
                    Err(e) => {
                        warn!("Failed to read encoder output: {}", e);
                        break;
                    }
                }
            }

            _ = flush_timer.tick() => {
                if !pending.is_empty() {
                    let _ = tx.send(RecorderEvent::Data(std::mem::take(&mut pending)));
                }
            }

            // A closed channel means the recorder was dropped; treat it as stop
            control = control_rx.recv(), if stdin.is_some() => {
                match control {
                    Some(EncoderControl::Suspend) if !suspended => {
                        match signal_encoder(&child, true) {
                            Ok(()) => {
                                suspended = true;
                                debug!("Encoder suspended");
                            }
                            Err(e) => warn!("Failed to suspend encoder: {}", e),
                        }
                    }
                    Some(EncoderControl::Continue) if suspended => {
                        match signal_encoder(&child, false) {
                            Ok(()) => {
                                suspended = false;
                                debug!("Encoder continued");
                            }
                            Err(e) => warn!("Failed to continue encoder: {}", e),
                        }
                    }
                    Some(EncoderControl::Suspend) | Some(EncoderControl::Continue) => {}
                    Some(EncoderControl::Stop) | None => {
                        // A stopped encoder would never read `q`
                        if suspended {
                            if let Err(e) = signal_encoder(&child, false) {
                                warn!("Failed to continue encoder before stopping: {}", e);
                            }
                            suspended = false;
                        }
                        if let Some(mut stdin) = stdin.take() {
                            if let Err(e) = stdin.write_all(b"q").await {
                                warn!("Failed to ask encoder to quit: {}", e);
                            }
                        }
                        exit_deadline.as_mut().reset(Instant::now() + exit_timeout);
                    }
                }
            }

            _ = &mut exit_deadline, if stdin.is_none() => {
                warn!("Encoder did not finish within {:?} of stop, killing it", exit_timeout);
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill encoder: {}", e);
                }
                break;
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(RecorderEvent::Data(pending));
    }

    match tokio::time::timeout(exit_timeout, child.wait()).await {
        Ok(Ok(status)) if !status.success() => warn!("Encoder exited with {}", status),
        Ok(Ok(_)) => debug!("Encoder exited cleanly"),
        Ok(Err(e)) => warn!("Failed to wait for encoder: {}", e),
        Err(_) => {
            warn!("Encoder closed its output but did not exit, killing it");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill encoder: {}", e);
            }
        }
    }

    let _ = tx.send(RecorderEvent::Stopped);
}
