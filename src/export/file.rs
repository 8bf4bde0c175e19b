//! Export sink writing artifacts into a directory

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

use super::{ExportError, ExportSink, RepairedArtifact};

/// Saves every artifact as a file in the output directory
#[derive(Debug, Clone)]
pub struct FileExportSink {
    output_dir: PathBuf,
}

impl FileExportSink {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }
}

#[async_trait]
impl ExportSink for FileExportSink {
    async fn save(&self, artifact: &RepairedArtifact) -> Result<PathBuf, ExportError> {
        if artifact.file_name.contains(['/', '\\']) {
            return Err(ExportError::Rejected {
                file_name: artifact.file_name.clone(),
                reason: "file name must not contain path separators".to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;

        let path = self.output_dir.join(&artifact.file_name);
        tokio::fs::write(&path, &artifact.bytes).await?;

        info!(
            "Saved {} ({:.2} MB, {})",
            path.display(),
            artifact.bytes.len() as f64 / (1024.0 * 1024.0),
            artifact.mime_type
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(file_name: &str) -> RepairedArtifact {
        RepairedArtifact {
            bytes: b"webm bytes".to_vec(),
            mime_type: "video/webm".to_string(),
            file_name: file_name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_creates_directory_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileExportSink::new(dir.path().join("nested").join("out"));

        let path = sink.save(&artifact("record-0(1).webm")).await.unwrap();

        assert_eq!(path, dir.path().join("nested").join("out").join("record-0(1).webm"));
        assert_eq!(std::fs::read(&path).unwrap(), b"webm bytes".to_vec());
    }

    #[tokio::test]
    async fn test_save_rejects_path_separators() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileExportSink::new(dir.path().to_path_buf());

        let result = sink.save(&artifact("../escape.webm")).await;
        assert!(matches!(result, Err(ExportError::Rejected { .. })));
    }
}
