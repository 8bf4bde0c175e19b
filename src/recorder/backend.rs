//! Recorder backend trait

use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Events emitted by a running recorder backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    /// Encoded container bytes produced since the previous flush
    Data(Vec<u8>),
    /// Terminal event: the backend has flushed everything and stopped
    Stopped,
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("encoder process did not expose {0}")]
    MissingPipe(&'static str),

    #[error("recorder already started")]
    AlreadyStarted,
}

/// One recording pass over a capture stream.
///
/// Backends deliver data on the event channel at roughly `flush_interval`
/// and send exactly one [`RecorderEvent::Stopped`] after [`stop`] is
/// requested, once every pending chunk has been delivered.
///
/// [`stop`]: RecorderBackend::stop
pub trait RecorderBackend: Send {
    /// Start recording; events are sent to the provided channel
    fn start(
        &mut self,
        flush_interval: Duration,
        tx: mpsc::UnboundedSender<RecorderEvent>,
    ) -> Result<(), RecorderError>;

    /// Request the recording to stop. Does not wait for the final flush.
    fn stop(&mut self);

    /// Suspend data production. Backends that cannot suspend ignore this.
    fn pause(&mut self) {}

    /// Resume after [`pause`](RecorderBackend::pause)
    fn resume(&mut self) {}
}
