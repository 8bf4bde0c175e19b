//! One recording pass and its finalization

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::{RecorderBackend, RecorderError, RecorderEvent};
use crate::export::ExportMessage;

/// A segment ready for repair and export
#[derive(Debug, Clone)]
pub struct FinishedSegment {
    /// Concatenated recorder output
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// Time since the previous segment boundary
    pub duration: Duration,
}

/// Buffer for collecting recorder chunks during one pass
#[derive(Debug, Default)]
pub struct SegmentBuffer {
    chunks: Vec<Vec<u8>>,
    bytes: usize,
}

impl SegmentBuffer {
    /// Create a new empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; empty chunks are ignored
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push(chunk);
    }

    /// Number of buffered chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total buffered bytes
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    /// Concatenate every chunk in arrival order and clear the buffer
    pub fn take_concatenated(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.bytes = 0;
        out
    }
}

/// Boundary marker and export order of the passes of one session.
///
/// Each pass measures its duration from the boundary left by the pass before
/// it, and is queued for export only once that pass has been queued. A pass
/// whose encoder is slow to flush therefore never swaps places with its
/// successor.
#[derive(Debug)]
pub struct SegmentSequence {
    boundary: Instant,
    /// Resolves once the most recent pass has been queued or dropped
    last_queued: Option<oneshot::Receiver<()>>,
}

impl SegmentSequence {
    pub fn starting_at(start: Instant) -> Self {
        Self {
            boundary: start,
            last_queued: None,
        }
    }

    fn next_slot(&mut self) -> PassSlot {
        let (queued_tx, queued_rx) = oneshot::channel();
        PassSlot {
            started: self.boundary,
            after: self.last_queued.replace(queued_rx),
            queued: queued_tx,
        }
    }
}

/// Where one pass sits in its session
struct PassSlot {
    started: Instant,
    after: Option<oneshot::Receiver<()>>,
    /// Dropped once this pass has been queued or found empty
    queued: oneshot::Sender<()>,
}

/// A running recording pass
pub struct SegmentRecorder {
    pass: u64,
    backend: Box<dyn RecorderBackend>,
    collector: JoinHandle<()>,
    ended_tx: oneshot::Sender<Instant>,
}

impl SegmentRecorder {
    /// Start `backend` and collect its output on a background task.
    ///
    /// When the backend stops, the buffered chunks are finalized once and
    /// queued on `export_tx` after every earlier pass of `sequence`.
    pub fn begin(
        mut backend: Box<dyn RecorderBackend>,
        pass: u64,
        sequence: &mut SegmentSequence,
        flush_interval: Duration,
        mime_type: &str,
        export_tx: mpsc::Sender<ExportMessage>,
    ) -> Result<Self, RecorderError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        backend.start(flush_interval, event_tx)?;

        debug!("Segment pass {} started", pass);
        let (ended_tx, ended_rx) = oneshot::channel();
        let collector = tokio::spawn(collect(
            event_rx,
            ended_rx,
            sequence.next_slot(),
            pass,
            mime_type.to_string(),
            export_tx,
        ));

        Ok(Self {
            pass,
            backend,
            collector,
            ended_tx,
        })
    }

    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn pause(&mut self) {
        self.backend.pause();
    }

    pub fn resume(&mut self) {
        self.backend.resume();
    }

    /// Request the backend to stop. The returned handle completes once the
    /// segment has been finalized and queued.
    ///
    /// The segment boundary is the moment of the stop request; it becomes the
    /// start of the next pass of `sequence`.
    pub fn end(mut self, sequence: &mut SegmentSequence) -> PendingFinalize {
        debug!("Ending segment pass {}", self.pass);
        let boundary = Instant::now();
        sequence.boundary = boundary;
        let _ = self.ended_tx.send(boundary);
        self.backend.stop();
        PendingFinalize {
            pass: self.pass,
            _backend: self.backend,
            collector: self.collector,
        }
    }
}

/// A stopped pass whose finalize may still be running
pub struct PendingFinalize {
    pass: u64,
    // Kept alive until the collector has seen the final event
    _backend: Box<dyn RecorderBackend>,
    collector: JoinHandle<()>,
}

impl PendingFinalize {
    pub fn is_finished(&self) -> bool {
        self.collector.is_finished()
    }

    /// Wait for the finalize to complete
    pub async fn wait(self) {
        if let Err(e) = self.collector.await {
            error!("Finalize task for segment pass {} failed: {}", self.pass, e);
        }
    }
}

async fn collect(
    mut events: mpsc::UnboundedReceiver<RecorderEvent>,
    mut ended_rx: oneshot::Receiver<Instant>,
    slot: PassSlot,
    pass: u64,
    mime_type: String,
    export_tx: mpsc::Sender<ExportMessage>,
) {
    let PassSlot {
        started,
        after,
        queued: _queued,
    } = slot;
    let mut buffer = SegmentBuffer::new();

    // A closed channel counts as the terminal event
    while let Some(event) = events.recv().await {
        match event {
            RecorderEvent::Data(chunk) => buffer.push(chunk),
            RecorderEvent::Stopped => break,
        }
    }

    // Without a stop request the backend died on its own; the boundary is now
    let boundary = ended_rx.try_recv().unwrap_or_else(|_| Instant::now());
    let duration = boundary.saturating_duration_since(started);

    // Queue after the previous pass, whatever its outcome
    if let Some(after) = after {
        let _ = after.await;
    }

    if buffer.is_empty() {
        debug!("Segment pass {} produced no data, nothing to export", pass);
        return;
    }

    info!(
        "Segment pass {} finalized: {} chunks, {:.2} MB, {:.1}s",
        pass,
        buffer.len(),
        buffer.byte_len() as f64 / (1024.0 * 1024.0),
        duration.as_secs_f64()
    );

    let segment = FinishedSegment {
        bytes: buffer.take_concatenated(),
        mime_type,
        duration,
    };
    if let Err(e) = export_tx.send(ExportMessage::Segment(segment)).await {
        error!("Failed to queue segment pass {} for export: {}", pass, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::WEBM_MIME_TYPE;
    use crate::testing::FakeRecorders;

    fn begin(
        recorders: &FakeRecorders,
        pass: u64,
        sequence: &mut SegmentSequence,
        export_tx: &mpsc::Sender<ExportMessage>,
    ) -> SegmentRecorder {
        SegmentRecorder::begin(
            recorders.manual_backend(),
            pass,
            sequence,
            Duration::from_millis(1000),
            WEBM_MIME_TYPE,
            export_tx.clone(),
        )
        .unwrap()
    }

    fn expect_segment(message: Option<ExportMessage>) -> FinishedSegment {
        match message {
            Some(ExportMessage::Segment(segment)) => segment,
            other => panic!("expected a finished segment, got {:?}", other),
        }
    }

    #[test]
    fn test_buffer_concatenates_in_order_and_clears() {
        let mut buffer = SegmentBuffer::new();
        buffer.push(b"ab".to_vec());
        buffer.push(Vec::new());
        buffer.push(b"cde".to_vec());
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.byte_len(), 5);

        assert_eq!(buffer.take_concatenated(), b"abcde".to_vec());
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_finalizes_buffered_chunks() {
        let recorders = FakeRecorders::new();
        let mut sequence = SegmentSequence::starting_at(Instant::now());
        let (export_tx, mut export_rx) = mpsc::channel(8);

        let recorder = begin(&recorders, 1, &mut sequence, &export_tx);
        tokio::time::advance(Duration::from_millis(200)).await;
        recorders.emit(b"first ");
        tokio::time::advance(Duration::from_millis(600)).await;
        recorders.emit(b"second");
        tokio::time::advance(Duration::from_millis(200)).await;

        recorder.end(&mut sequence).wait().await;

        let segment = expect_segment(export_rx.recv().await);
        assert_eq!(segment.bytes, b"first second".to_vec());
        assert_eq!(segment.mime_type, WEBM_MIME_TYPE);
        assert_eq!(segment.duration, Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pass_is_not_exported() {
        let recorders = FakeRecorders::new();
        let mut sequence = SegmentSequence::starting_at(Instant::now());
        let (export_tx, mut export_rx) = mpsc::channel(8);

        let recorder = begin(&recorders, 1, &mut sequence, &export_tx);
        tokio::time::advance(Duration::from_millis(500)).await;
        recorder.end(&mut sequence).wait().await;

        drop(export_tx);
        assert!(export_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_durations_measure_from_previous_boundary() {
        let recorders = FakeRecorders::new();
        let mut sequence = SegmentSequence::starting_at(Instant::now());
        let (export_tx, mut export_rx) = mpsc::channel(8);

        let first = begin(&recorders, 1, &mut sequence, &export_tx);
        recorders.emit(b"a");
        tokio::time::advance(Duration::from_secs(60)).await;
        first.end(&mut sequence).wait().await;

        let second = begin(&recorders, 2, &mut sequence, &export_tx);
        recorders.emit(b"b");
        tokio::time::advance(Duration::from_secs(30)).await;
        second.end(&mut sequence).wait().await;

        assert_eq!(
            expect_segment(export_rx.recv().await).duration,
            Duration::from_secs(60)
        );
        assert_eq!(
            expect_segment(export_rx.recv().await).duration,
            Duration::from_secs(30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_flush_keeps_pass_order_and_duration() {
        let recorders = FakeRecorders::new();
        let mut sequence = SegmentSequence::starting_at(Instant::now());
        let (export_tx, mut export_rx) = mpsc::channel(8);

        let first = begin(&recorders, 1, &mut sequence, &export_tx);
        recorders.emit(b"first");
        tokio::time::advance(Duration::from_secs(60)).await;
        recorders.hold_stops(true);
        let first = first.end(&mut sequence);
        recorders.hold_stops(false);

        let second = begin(&recorders, 2, &mut sequence, &export_tx);
        recorders.emit(b"second");
        tokio::time::advance(Duration::from_millis(300)).await;
        let second = second.end(&mut sequence);

        // The second pass has stopped but must wait for the first
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(export_rx.try_recv().is_err());

        recorders.release_held_stops();
        first.wait().await;
        second.wait().await;

        let segment = expect_segment(export_rx.recv().await);
        assert_eq!(segment.bytes, b"first".to_vec());
        assert_eq!(segment.duration, Duration::from_secs(60));
        let segment = expect_segment(export_rx.recv().await);
        assert_eq!(segment.bytes, b"second".to_vec());
        assert_eq!(segment.duration, Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pass_still_waits_its_turn() {
        let recorders = FakeRecorders::new();
        let mut sequence = SegmentSequence::starting_at(Instant::now());
        let (export_tx, mut export_rx) = mpsc::channel(8);

        let first = begin(&recorders, 1, &mut sequence, &export_tx);
        recorders.emit(b"first");
        recorders.hold_stops(true);
        let first = first.end(&mut sequence);
        recorders.hold_stops(false);

        // Pass 2 stops empty; pass 3 must still queue after pass 1
        let second = begin(&recorders, 2, &mut sequence, &export_tx);
        let second = second.end(&mut sequence);
        let third = begin(&recorders, 3, &mut sequence, &export_tx);
        recorders.emit(b"third");
        let third = third.end(&mut sequence);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(export_rx.try_recv().is_err());

        recorders.release_held_stops();
        for finalize in [first, second, third] {
            finalize.wait().await;
        }

        assert_eq!(expect_segment(export_rx.recv().await).bytes, b"first".to_vec());
        assert_eq!(expect_segment(export_rx.recv().await).bytes, b"third".to_vec());
    }

    #[tokio::test]
    async fn test_closed_event_channel_still_finalizes_once() {
        let mut sequence = SegmentSequence::starting_at(Instant::now());
        let (export_tx, mut export_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (_ended_tx, ended_rx) = oneshot::channel();

        let collector = tokio::spawn(collect(
            event_rx,
            ended_rx,
            sequence.next_slot(),
            7,
            WEBM_MIME_TYPE.to_string(),
            export_tx,
        ));
        event_tx.send(RecorderEvent::Data(b"tail".to_vec())).unwrap();
        drop(event_tx);
        collector.await.unwrap();

        assert_eq!(expect_segment(export_rx.recv().await).bytes, b"tail".to_vec());
        assert!(export_rx.recv().await.is_none());
    }
}
