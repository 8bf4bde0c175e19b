//! Session controller
//!
//! Owns the capture stream and the current segment recorder. A rollover
//! timer rotates recorders against the same stream; finished segments are
//! queued to the export pipeline so rotation never waits for repair or
//! export. Stop waits for every pending finalize and then for the export
//! queue to drain.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Clock, Controls, SessionCommand, SessionError, SessionState, SessionStatus};
use crate::capture::{CaptureConstraints, CaptureSource, CaptureStream};
use crate::config::Config;
use crate::export::{ExportMessage, ExportPipeline, ExportSink};
use crate::recorder::{PendingFinalize, SegmentRecorder, SegmentSequence, WEBM_MIME_TYPE};
use crate::repair::RepairService;

/// Tunables of a session, resolved from [`Config`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub constraints: CaptureConstraints,
    /// `None` disables rollover
    pub rollover_period: Option<Duration>,
    pub flush_interval: Duration,
    pub mime_type: String,
    pub export_queue_capacity: usize,
    pub autostart: bool,
    pub suspend_on_pause: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            constraints: config.capture.constraints(),
            rollover_period: config.recording.rollover_period(),
            flush_interval: config.recording.flush_interval(),
            mime_type: config.recording.mime_type.clone(),
            export_queue_capacity: config.recording.export_queue_capacity,
            autostart: config.recording.autostart_on_launch,
            suspend_on_pause: config.recording.suspend_on_pause,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            constraints: CaptureConstraints::default(),
            rollover_period: Some(Duration::from_millis(60_000)),
            flush_interval: Duration::from_millis(1000),
            mime_type: WEBM_MIME_TYPE.to_string(),
            export_queue_capacity: 8,
            autostart: false,
            suspend_on_pause: false,
        }
    }
}

/// The live half of a session: stream plus segment boundaries
struct ActiveSession {
    id: Uuid,
    started_at: i64,
    stream: Box<dyn CaptureStream>,
    sequence: SegmentSequence,
}

pub struct SessionController {
    settings: SessionSettings,
    capture: Arc<dyn CaptureSource>,
    clock: Arc<dyn Clock>,
    /// Command receiver
    cmd_rx: mpsc::Receiver<SessionCommand>,
    /// Status broadcaster
    status_tx: broadcast::Sender<SessionStatus>,
    /// Bounded queue feeding the export pipeline
    export_tx: mpsc::Sender<ExportMessage>,
    state: SessionState,
    active: Option<ActiveSession>,
    /// The only recorder whose buffer still receives chunks
    recorder: Option<SegmentRecorder>,
    /// Ended recorders whose finalize may still be running
    pending: Vec<PendingFinalize>,
    /// Armed while a session is live; first tick one full period after start
    rollover_timer: Option<Interval>,
    next_pass: u64,
}

impl SessionController {
    /// Create a controller and spawn its export pipeline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: SessionSettings,
        capture: Arc<dyn CaptureSource>,
        repair: Arc<dyn RepairService>,
        sink: Arc<dyn ExportSink>,
        clock: Arc<dyn Clock>,
        cmd_rx: mpsc::Receiver<SessionCommand>,
        status_tx: broadcast::Sender<SessionStatus>,
    ) -> Self {
        let (export_tx, export_rx) = mpsc::channel(settings.export_queue_capacity.max(1));
        ExportPipeline::new(repair, sink, status_tx.clone()).spawn(export_rx);

        Self {
            settings,
            capture,
            clock,
            cmd_rx,
            status_tx,
            export_tx,
            state: SessionState::Idle,
            active: None,
            recorder: None,
            pending: Vec::new(),
            rollover_timer: None,
            next_pass: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn controls(&self) -> Controls {
        self.state.controls()
    }

    /// Run the controller main loop until shutdown
    pub async fn run(mut self) {
        info!("Session controller starting");
        let _ = self.status_tx.send(SessionStatus::Idle);

        if self.settings.autostart {
            info!("Autostart recording on launch enabled");
            self.start().await;
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Start) => self.start().await,
                        Some(SessionCommand::Pause) => self.pause(),
                        Some(SessionCommand::Stop) => self.stop().await,
                        Some(SessionCommand::Shutdown) => {
                            info!("Shutdown command received");
                            self.stop().await;
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down");
                            self.stop().await;
                            break;
                        }
                    }
                    debug!("State {:?}, controls {:?}", self.state(), self.controls());
                }

                _ = next_tick(&mut self.rollover_timer) => {
                    self.rollover().await;
                }
            }
        }

        info!("Session controller stopped");
    }

    /// Start a new session from Idle, or resume from Paused.
    ///
    /// Failures are logged and published; the controller stays Idle.
    pub async fn start(&mut self) {
        match self.state {
            SessionState::Recording => {
                warn!("Start requested while already recording");
                return;
            }
            SessionState::Paused => {
                self.resume();
                return;
            }
            SessionState::Idle => {}
        }

        if let Err(e) = self.begin_session().await {
            error!("Failed to start recording: {}", e);
            let _ = self.status_tx.send(SessionStatus::Error(e.to_string()));
            let _ = self.status_tx.send(SessionStatus::Idle);
        }
    }

    async fn begin_session(&mut self) -> Result<(), SessionError> {
        info!("Requesting capture stream...");
        let mut stream = self.capture.acquire(&self.settings.constraints).await?;
        let label = stream.label().to_string();

        let started_at = self.clock.epoch_millis();
        if self
            .export_tx
            .send(ExportMessage::StartSession { started_at })
            .await
            .is_err()
        {
            stream.stop();
            return Err(SessionError::ExportPipelineClosed);
        }

        let id = Uuid::new_v4();
        self.active = Some(ActiveSession {
            id,
            started_at,
            stream,
            sequence: SegmentSequence::starting_at(Instant::now()),
        });

        match self.begin_recorder() {
            Ok(recorder) => self.recorder = Some(recorder),
            Err(e) => {
                if let Some(mut active) = self.active.take() {
                    active.stream.stop();
                }
                return Err(e);
            }
        }

        // interval() ticks immediately; the first segment gets a full period
        if let Some(period) = self.settings.rollover_period {
            self.rollover_timer = Some(tokio::time::interval_at(Instant::now() + period, period));
        }

        self.state = SessionState::Recording;
        info!(
            "Session {} recording from {} (started_at={})",
            id, label, started_at
        );
        let _ = self.status_tx.send(SessionStatus::Recording { started_at });
        Ok(())
    }

    /// Create and start the next recorder against the active stream
    fn begin_recorder(&mut self) -> Result<SegmentRecorder, SessionError> {
        let active = self.active.as_mut().ok_or(SessionError::NoActiveStream)?;
        let backend = active.stream.create_recorder()?;

        self.next_pass += 1;
        let recorder = SegmentRecorder::begin(
            backend,
            self.next_pass,
            &mut active.sequence,
            self.settings.flush_interval,
            &self.settings.mime_type,
            self.export_tx.clone(),
        )?;
        Ok(recorder)
    }

    fn resume(&mut self) {
        if self.settings.suspend_on_pause {
            if let Some(recorder) = self.recorder.as_mut() {
                recorder.resume();
            }
        }

        self.state = SessionState::Recording;
        info!("Recording resumed");
        let started_at = self.active.as_ref().map(|a| a.started_at).unwrap_or_default();
        let _ = self.status_tx.send(SessionStatus::Recording { started_at });
    }

    /// Recording -> Paused. The recorder keeps running unless
    /// `suspend_on_pause` is set.
    pub fn pause(&mut self) {
        match self.state {
            SessionState::Recording => {
                if self.settings.suspend_on_pause {
                    if let Some(recorder) = self.recorder.as_mut() {
                        recorder.pause();
                    }
                }
                self.state = SessionState::Paused;
                info!("Recording paused");
                let _ = self.status_tx.send(SessionStatus::Paused);
            }
            SessionState::Paused => debug!("Already paused"),
            SessionState::Idle => warn!("Pause requested while not recording"),
        }
    }

    /// End the session: release the stream, finalize the last segment and
    /// wait until everything queued has been exported. No-op when Idle.
    pub async fn stop(&mut self) {
        if self.state == SessionState::Idle {
            debug!("No recording in progress");
            return;
        }

        info!("Stopping recording...");
        self.rollover_timer = None;

        let recorder = self.recorder.take();
        if let Some(mut session) = self.active.take() {
            if let Some(recorder) = recorder {
                self.pending.push(recorder.end(&mut session.sequence));
            }
            session.stream.stop();
            info!("Released capture stream for session {}", session.id);
        }

        let pending = std::mem::take(&mut self.pending);
        debug!("Waiting for {} segment(s) to finalize", pending.len());
        for finalize in pending {
            finalize.wait().await;
        }

        drain_exports(&self.export_tx).await;

        self.state = SessionState::Idle;
        info!("Recording stopped");
        let _ = self.status_tx.send(SessionStatus::Idle);
    }

    /// End the current recorder and immediately begin the next one.
    ///
    /// Does not wait for the ended recorder's finalize.
    pub async fn rollover(&mut self) {
        let (Some(recorder), Some(active)) = (self.recorder.take(), self.active.as_mut()) else {
            debug!("No recorder active, skipping rollover");
            return;
        };

        info!("Rollover period reached, rotating to a new segment...");
        self.pending.retain(|finalize| !finalize.is_finished());
        self.pending.push(recorder.end(&mut active.sequence));

        match self.begin_recorder() {
            Ok(mut next) => {
                if self.state == SessionState::Paused && self.settings.suspend_on_pause {
                    next.pause();
                }
                debug!("Segment pass {} recording", next.pass());
                self.recorder = Some(next);
            }
            Err(e) => {
                error!("Failed to begin next segment, ending session: {}", e);
                let _ = self
                    .status_tx
                    .send(SessionStatus::Error(format!("Rollover failed: {}", e)));
                self.stop().await;
            }
        }
    }
}

/// Wait until the export pipeline has processed everything queued so far
async fn drain_exports(export_tx: &mpsc::Sender<ExportMessage>) {
    let (ack_tx, ack_rx) = oneshot::channel();
    if export_tx.send(ExportMessage::Flush(ack_tx)).await.is_err() {
        error!("Export pipeline is no longer running");
        return;
    }
    if ack_rx.await.is_err() {
        error!("Export pipeline exited before draining");
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Create the channels for communicating with the session controller
pub fn create_session_channels() -> (
    mpsc::Sender<SessionCommand>,
    mpsc::Receiver<SessionCommand>,
    broadcast::Sender<SessionStatus>,
    broadcast::Receiver<SessionStatus>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (status_tx, status_rx) = broadcast::channel(16);
    (cmd_tx, cmd_rx, status_tx, status_rx)
}
