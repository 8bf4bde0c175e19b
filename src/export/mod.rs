//! Export of finished segments
//!
//! Finished segments travel over a bounded queue to a background pipeline
//! that repairs them and hands the result to an [`ExportSink`].

mod file;
mod pipeline;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::recorder::FinishedSegment;

pub use file::FileExportSink;
pub use pipeline::ExportPipeline;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("export sink rejected {file_name}: {reason}")]
    Rejected { file_name: String, reason: String },
}

/// A repaired segment ready to be persisted
#[derive(Debug, Clone)]
pub struct RepairedArtifact {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: String,
}

/// File name of a repaired segment: `record-<session start ms>(<index>).webm`
pub fn artifact_file_name(session_started_at: i64, segment_index: u32) -> String {
    format!("record-{}({}).webm", session_started_at, segment_index)
}

/// Where repaired segments end up
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Persist the artifact; returns where it was stored
    async fn save(&self, artifact: &RepairedArtifact) -> Result<PathBuf, ExportError>;
}

/// Messages consumed by the export pipeline, in order
#[derive(Debug)]
pub enum ExportMessage {
    /// A new session started; numbering restarts at 1
    StartSession { started_at: i64 },
    /// A finished segment to repair and export
    Segment(FinishedSegment),
    /// Acknowledged once everything queued before it has been processed
    Flush(oneshot::Sender<()>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_file_name_format() {
        assert_eq!(artifact_file_name(0, 1), "record-0(1).webm");
        assert_eq!(
            artifact_file_name(1_700_000_000_123, 12),
            "record-1700000000123(12).webm"
        );
    }
}
