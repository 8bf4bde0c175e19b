//! Capture sources
//!
//! A capture source hands out a live display + audio stream. The stream is
//! owned by the recording session for as long as it records, acts as the
//! factory for the recorders bound to it, and is released exactly once when
//! the session stops.

mod ffmpeg;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recorder::RecorderBackend;

pub use ffmpeg::FfmpegCaptureSource;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no capture source available: {0}")]
    Unavailable(String),

    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported capture constraints: {0}")]
    Unsupported(String),

    #[error("capture stream has already been released")]
    Released,
}

/// Audio processing requested from the capture source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,

    #[serde(default = "default_true")]
    pub noise_suppression: bool,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

fn default_true() -> bool {
    true
}

fn default_sample_rate() -> u32 {
    44_100
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            sample_rate: default_sample_rate(),
        }
    }
}

/// What the session asks the capture source for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub video: bool,
    /// `None` captures no audio
    pub audio: Option<AudioConstraints>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: Some(AudioConstraints::default()),
        }
    }
}

/// A live capture stream
pub trait CaptureStream: Send + Sync {
    /// Human-readable description for logs
    fn label(&self) -> &str;

    /// Create a recorder bound to this stream
    fn create_recorder(&self) -> Result<Box<dyn RecorderBackend>, CaptureError>;

    /// Stop every track of the stream. Recorders created afterwards fail.
    fn stop(&mut self);
}

/// Something that can produce a capture stream
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Acquire a stream. May wait indefinitely on a permission prompt.
    async fn acquire(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}
