//! In-memory fakes shared by unit tests

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::capture::{CaptureConstraints, CaptureError, CaptureSource, CaptureStream};
use crate::export::{ExportError, ExportSink, RepairedArtifact};
use crate::recorder::{RecorderBackend, RecorderError, RecorderEvent};
use crate::repair::{RepairError, RepairService};
use crate::session::Clock;

#[derive(Debug, Default)]
struct RecordersState {
    /// Event channel of the most recently started backend
    current: Option<mpsc::UnboundedSender<RecorderEvent>>,
    started: usize,
    pauses: usize,
    resumes: usize,
    /// Withhold `Stopped` from backends stopped while set
    hold_stops: bool,
    held: Vec<mpsc::UnboundedSender<RecorderEvent>>,
}

/// Factory for manually driven recorder backends.
///
/// `emit` delivers a chunk to whichever backend started last.
#[derive(Debug, Clone, Default)]
pub struct FakeRecorders {
    state: Arc<Mutex<RecordersState>>,
}

impl FakeRecorders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manual_backend(&self) -> Box<dyn RecorderBackend> {
        Box::new(ManualBackend {
            state: self.state.clone(),
            tx: None,
        })
    }

    pub fn emit(&self, bytes: &[u8]) {
        let state = self.state.lock().unwrap();
        let tx = state.current.as_ref().expect("no recorder is running");
        tx.send(RecorderEvent::Data(bytes.to_vec())).unwrap();
    }

    /// Backends stopped while holding keep flushing until
    /// [`release_held_stops`](Self::release_held_stops)
    pub fn hold_stops(&self, hold: bool) {
        self.state.lock().unwrap().hold_stops = hold;
    }

    pub fn release_held_stops(&self) {
        let held = std::mem::take(&mut self.state.lock().unwrap().held);
        for tx in held {
            let _ = tx.send(RecorderEvent::Stopped);
        }
    }

    pub fn started(&self) -> usize {
        self.state.lock().unwrap().started
    }

    pub fn pauses(&self) -> usize {
        self.state.lock().unwrap().pauses
    }

    pub fn resumes(&self) -> usize {
        self.state.lock().unwrap().resumes
    }
}

struct ManualBackend {
    state: Arc<Mutex<RecordersState>>,
    tx: Option<mpsc::UnboundedSender<RecorderEvent>>,
}

impl RecorderBackend for ManualBackend {
    fn start(
        &mut self,
        _flush_interval: Duration,
        tx: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), RecorderError> {
        if self.tx.is_some() {
            return Err(RecorderError::AlreadyStarted);
        }
        let mut state = self.state.lock().unwrap();
        state.current = Some(tx.clone());
        state.started += 1;
        self.tx = Some(tx);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let mut state = self.state.lock().unwrap();
            if state
                .current
                .as_ref()
                .is_some_and(|current| current.same_channel(&tx))
            {
                state.current = None;
            }
            if state.hold_stops {
                state.held.push(tx);
            } else {
                let _ = tx.send(RecorderEvent::Stopped);
            }
        }
    }

    fn pause(&mut self) {
        self.state.lock().unwrap().pauses += 1;
    }

    fn resume(&mut self) {
        self.state.lock().unwrap().resumes += 1;
    }
}

#[derive(Debug, Default)]
struct CaptureCounters {
    acquired: usize,
    released: usize,
    recorders_created: usize,
}

/// Capture source handing out streams backed by [`FakeRecorders`]
#[derive(Debug, Clone)]
pub struct FakeCapture {
    recorders: FakeRecorders,
    deny: bool,
    recorder_limit: Option<usize>,
    counters: Arc<Mutex<CaptureCounters>>,
}

impl FakeCapture {
    pub fn new(recorders: &FakeRecorders) -> Self {
        Self {
            recorders: recorders.clone(),
            deny: false,
            recorder_limit: None,
            counters: Arc::new(Mutex::new(CaptureCounters::default())),
        }
    }

    /// A source whose permission prompt is always refused
    pub fn denying(recorders: &FakeRecorders) -> Self {
        Self {
            deny: true,
            ..Self::new(recorders)
        }
    }

    /// Fail every recorder creation after the first `limit`
    pub fn with_recorder_limit(mut self, limit: usize) -> Self {
        self.recorder_limit = Some(limit);
        self
    }

    pub fn acquired(&self) -> usize {
        self.counters.lock().unwrap().acquired
    }

    pub fn released(&self) -> usize {
        self.counters.lock().unwrap().released
    }
}

#[async_trait]
impl CaptureSource for FakeCapture {
    async fn acquire(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied("refused by user".to_string()));
        }
        self.counters.lock().unwrap().acquired += 1;
        Ok(Box::new(FakeStream {
            source: self.clone(),
            released: false,
        }))
    }
}

struct FakeStream {
    source: FakeCapture,
    released: bool,
}

impl CaptureStream for FakeStream {
    fn label(&self) -> &str {
        "fake display"
    }

    fn create_recorder(&self) -> Result<Box<dyn RecorderBackend>, CaptureError> {
        if self.released {
            return Err(CaptureError::Released);
        }
        let mut counters = self.source.counters.lock().unwrap();
        if let Some(limit) = self.source.recorder_limit {
            if counters.recorders_created >= limit {
                return Err(CaptureError::Unavailable("encoder limit reached".to_string()));
            }
        }
        counters.recorders_created += 1;
        Ok(self.source.recorders.manual_backend())
    }

    fn stop(&mut self) {
        if !self.released {
            self.released = true;
            self.source.counters.lock().unwrap().released += 1;
        }
    }
}

/// Export sink keeping artifacts in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    saved: Arc<Mutex<Vec<RepairedArtifact>>>,
    reject: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn saved(&self) -> Vec<RepairedArtifact> {
        self.saved.lock().unwrap().clone()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.saved().into_iter().map(|a| a.file_name).collect()
    }
}

#[async_trait]
impl ExportSink for MemorySink {
    async fn save(&self, artifact: &RepairedArtifact) -> Result<PathBuf, ExportError> {
        if self.reject {
            return Err(ExportError::Rejected {
                file_name: artifact.file_name.clone(),
                reason: "sink is read-only".to_string(),
            });
        }
        self.saved.lock().unwrap().push(artifact.clone());
        Ok(PathBuf::from("memory").join(&artifact.file_name))
    }
}

/// Repair stand-in that passes bytes through and records durations
#[derive(Debug, Clone, Default)]
pub struct StubRepair {
    durations: Arc<Mutex<Vec<Duration>>>,
    fail_on: Option<Vec<u8>>,
}

impl StubRepair {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail whenever the raw bytes equal `raw`
    pub fn failing_on(raw: &[u8]) -> Self {
        Self {
            fail_on: Some(raw.to_vec()),
            ..Self::default()
        }
    }

    pub fn durations(&self) -> Vec<Duration> {
        self.durations.lock().unwrap().clone()
    }
}

impl RepairService for StubRepair {
    fn make_seekable(&self, raw: &[u8], duration: Duration) -> Result<Vec<u8>, RepairError> {
        if self.fail_on.as_deref() == Some(raw) {
            return Err(RepairError::NotEbml);
        }
        self.durations.lock().unwrap().push(duration);
        Ok(raw.to_vec())
    }
}

/// Settable wall clock
#[derive(Debug, Clone)]
pub struct FixedClock(Arc<AtomicI64>);

impl FixedClock {
    pub fn new(epoch_millis: i64) -> Self {
        Self(Arc::new(AtomicI64::new(epoch_millis)))
    }

    pub fn set(&self, epoch_millis: i64) {
        self.0.store(epoch_millis, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn epoch_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
