//! Background repair + export of finished segments

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{artifact_file_name, ExportMessage, ExportSink, RepairedArtifact};
use crate::recorder::FinishedSegment;
use crate::repair::RepairService;
use crate::session::SessionStatus;

/// Consumes the export queue one message at a time
pub struct ExportPipeline {
    repair: Arc<dyn RepairService>,
    sink: Arc<dyn ExportSink>,
    status_tx: broadcast::Sender<SessionStatus>,
    session_started_at: Option<i64>,
    /// 1-based index of the next segment to export
    segment_index: u32,
}

impl ExportPipeline {
    pub fn new(
        repair: Arc<dyn RepairService>,
        sink: Arc<dyn ExportSink>,
        status_tx: broadcast::Sender<SessionStatus>,
    ) -> Self {
        Self {
            repair,
            sink,
            status_tx,
            session_started_at: None,
            segment_index: 1,
        }
    }

    /// Spawn the pipeline task; it runs until every sender is dropped
    pub fn spawn(mut self, mut rx: mpsc::Receiver<ExportMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                self.handle(message).await;
            }
            debug!("Export pipeline stopped");
        })
    }

    async fn handle(&mut self, message: ExportMessage) {
        match message {
            ExportMessage::StartSession { started_at } => {
                debug!("Export numbering restarts for session {}", started_at);
                self.session_started_at = Some(started_at);
                self.segment_index = 1;
            }
            ExportMessage::Segment(segment) => {
                let started_at = self.session_started_at.unwrap_or_else(|| {
                    warn!("Segment arrived before any session start, numbering from 0");
                    0
                });
                let file_name = artifact_file_name(started_at, self.segment_index);

                match self.export(segment, file_name.clone()).await {
                    Ok(path) => {
                        info!("Exported segment {} to {}", self.segment_index, path.display());
                        let _ = self.status_tx.send(SessionStatus::Exported {
                            path,
                            segment_index: self.segment_index,
                        });
                        self.segment_index += 1;
                    }
                    Err(e) => {
                        // No retry: the segment is lost
                        error!("Failed to export {}: {:#}", file_name, e);
                        let _ = self.status_tx.send(SessionStatus::ExportFailed {
                            file_name,
                            message: format!("{:#}", e),
                        });
                    }
                }
            }
            ExportMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    /// Repair, splice and save one segment
    async fn export(&self, segment: FinishedSegment, file_name: String) -> Result<PathBuf> {
        let FinishedSegment {
            bytes,
            mime_type,
            duration,
        } = segment;

        let repair = self.repair.clone();
        let repaired = tokio::task::spawn_blocking(move || repair.make_seekable(&bytes, duration))
            .await
            .context("Repair task panicked")?
            .context("Failed to make segment seekable")?;

        let artifact = RepairedArtifact {
            bytes: repaired,
            mime_type,
            file_name,
        };
        self.sink
            .save(&artifact)
            .await
            .with_context(|| format!("Failed to save {}", artifact.file_name))
    }
}
