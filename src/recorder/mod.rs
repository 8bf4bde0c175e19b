//! Segment recording
//!
//! A recorder backend produces encoded container bytes for one pass over a
//! capture stream; a [`SegmentRecorder`] buffers those bytes and turns them
//! into a [`FinishedSegment`] when the pass ends.

mod backend;
mod segment;

pub use backend::{RecorderBackend, RecorderError, RecorderEvent};
pub use segment::{FinishedSegment, PendingFinalize, SegmentRecorder, SegmentSequence};

/// MIME type of every finished segment
pub const WEBM_MIME_TYPE: &str = "video/webm; codecs=vp9, opus";
