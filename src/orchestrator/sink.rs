//! Consumers of successfully fetched payloads.

use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::download::{DownloadResult, output_filename};
use crate::queue::Task;

/// Errors raised while handing a payload to a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no payload to store for {url}")]
    MissingBody { url: String },
}

impl SinkError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Receives each successful result before its task is marked complete.
///
/// A sink error turns the task into a failure, releasing its key.
#[async_trait]
pub trait ResultSink: Send + Sync + Debug {
    async fn accept(&self, task: &Task, result: &DownloadResult) -> Result<(), SinkError>;
}

/// Drops payloads; only counters are kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl ResultSink for DiscardSink {
    async fn accept(&self, _task: &Task, _result: &DownloadResult) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Writes each payload into a directory under a key-prefixed filename.
#[derive(Debug, Clone)]
pub struct DiskSink {
    dir: PathBuf,
}

impl DiskSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ResultSink for DiskSink {
    #[instrument(skip(self, task, result), fields(task = %task.dedup_key()))]
    async fn accept(&self, task: &Task, result: &DownloadResult) -> Result<(), SinkError> {
        let body = result.body.as_deref().ok_or_else(|| SinkError::MissingBody {
            url: task.url().to_string(),
        })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SinkError::io(&self.dir, e))?;

        let path = self
            .dir
            .join(output_filename(task, result.content_type.as_deref()));
        let tmp = path.with_extension("part");

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| SinkError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(SinkError::io(&path, e));
        }

        debug!(path = %path.display(), bytes = body.len(), "payload stored");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::{Priority, TaskPayload};

    fn success(body: &[u8]) -> DownloadResult {
        DownloadResult {
            success: true,
            bytes: body.len() as u64,
            attempts: 1,
            body: Some(body.to_vec()),
            content_type: Some("application/pdf".to_string()),
            ..DownloadResult::default()
        }
    }

    #[tokio::test]
    async fn test_disk_sink_writes_named_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiskSink::new(dir.path().join("out"));
        let task = Task::new(
            TaskPayload::new("https://court.test/a/order.pdf"),
            Priority::Tribunal,
        );

        sink.accept(&task, &success(b"%PDF-1.7 body")).await.unwrap();

        let expected = dir
            .path()
            .join("out")
            .join(output_filename(&task, Some("application/pdf")));
        assert_eq!(std::fs::read(expected).unwrap(), b"%PDF-1.7 body");
        let names: Vec<_> = std::fs::read_dir(dir.path().join("out")).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_disk_sink_rejects_missing_body() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DiskSink::new(dir.path());
        let task = Task::new(TaskPayload::new("https://court.test/x"), Priority::Other);
        let err = sink
            .accept(&task, &DownloadResult::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::MissingBody { .. }));
    }
}
