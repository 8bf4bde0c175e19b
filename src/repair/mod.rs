//! Seekable container repair
//!
//! Live WebM recorders write an unknown-size Segment with no Duration and no
//! Cues, so players cannot seek in the result. The repair step scans the
//! finished bytes, rebuilds the leading metadata with the real duration and a
//! cue per keyframe cluster, and splices it in front of the untouched media
//! body.

pub mod ebml;
mod reader;
mod seekable;
#[cfg(test)]
pub(crate) mod testdata;

use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use reader::scan;
use seekable::make_metadata_seekable;

/// Errors raised while decoding or rewriting a container
#[derive(Error, Debug)]
pub enum RepairError {
    #[error("invalid variable-length integer at offset {offset}")]
    InvalidVint { offset: usize },

    #[error("input does not start with an EBML header")]
    NotEbml,

    #[error("no Segment element found")]
    MissingSegment,

    #[error("required element missing: {0}")]
    MissingElement(&'static str),

    #[error("leaf element 0x{id:X} at offset {offset} has unknown size")]
    UnknownSizedLeaf { id: u32, offset: usize },

    #[error("metadata element 0x{id:X} at offset {offset} has unknown size")]
    UnknownSizedMetadata { id: u32, offset: usize },

    #[error("seekable metadata layout did not converge")]
    LayoutDidNotConverge,
}

/// Turns raw recorder output into a seekable container
pub trait RepairService: Send + Sync {
    /// Return `raw` with its leading metadata rewritten so the container
    /// reports `duration` and carries a seek index
    fn make_seekable(&self, raw: &[u8], duration: Duration) -> Result<Vec<u8>, RepairError>;
}

/// EBML-based repair for WebM recorder output
#[derive(Debug, Default, Clone, Copy)]
pub struct EbmlRepair;

impl RepairService for EbmlRepair {
    fn make_seekable(&self, raw: &[u8], duration: Duration) -> Result<Vec<u8>, RepairError> {
        let scanned = scan(raw)?;

        let mut duration_ms = duration.as_secs_f64() * 1000.0;
        if duration_ms <= 0.0 {
            // No wall-clock length; fall back to the last block timestamp
            if let Some(last) = scanned.last_timecode {
                duration_ms = last as f64 * scanned.timecode_scale as f64 / 1_000_000.0;
            }
        }

        // Streams that already carry an index but no keyframe clusters keep it
        let cues = if scanned.cues.is_empty() {
            &scanned.indexed_cues
        } else {
            &scanned.cues
        };
        let metadata = make_metadata_seekable(&scanned, duration_ms, cues)?;

        debug!(
            "Rewrote {} metadata bytes as {} ({} cues, {:.0} ms, previously {:?} ms)",
            scanned.metadata_size,
            metadata.len(),
            cues.len(),
            duration_ms,
            scanned.duration_ms()
        );

        let body = &raw[scanned.metadata_size..];
        let mut repaired = Vec::with_capacity(metadata.len() + body.len());
        repaired.extend_from_slice(&metadata);
        repaired.extend_from_slice(body);
        Ok(repaired)
    }
}
