//! Recording session - lifecycle, rollover and export handoff

mod controller;

pub use controller::{create_session_channels, SessionController, SessionSettings};

use std::path::PathBuf;
use thiserror::Error;

use crate::capture::CaptureError;
use crate::recorder::RecorderError;

/// Commands that can be sent to the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Start a new session, or resume a paused one
    Start,
    /// Pause the running session
    Pause,
    /// Stop the session and wait for every segment to be exported
    Stop,
    /// Stop and exit the controller loop
    Shutdown,
}

/// Status updates from the session controller and the export pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStatus {
    /// No session; start is the only available control
    Idle,
    /// Recording; `started_at` is the session start in epoch milliseconds
    Recording { started_at: i64 },
    Paused,
    /// A segment was repaired and saved
    Exported { path: PathBuf, segment_index: u32 },
    /// A segment was lost during repair or export
    ExportFailed { file_name: String, message: String },
    /// An error occurred
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Recording,
    Paused,
}

/// Which user controls are enabled in a given state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub start: bool,
    pub pause: bool,
    pub stop: bool,
}

impl SessionState {
    pub fn controls(self) -> Controls {
        match self {
            SessionState::Idle => Controls {
                start: true,
                pause: false,
                stop: false,
            },
            SessionState::Recording => Controls {
                start: false,
                pause: true,
                stop: true,
            },
            SessionState::Paused => Controls {
                start: true,
                pause: false,
                stop: true,
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("recorder failed: {0}")]
    Recorder(#[from] RecorderError),

    #[error("export pipeline is no longer running")]
    ExportPipelineClosed,

    #[error("no capture stream is active")]
    NoActiveStream,
}

/// Wall clock used for session timestamps
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn epoch_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn epoch_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}
