//! Durable job progress for crash recovery.
//!
//! A [`CheckpointStore`] serializes [`CheckpointRecord`]s to JSON and hands
//! the bytes to a [`CheckpointBackend`]. Backends replace the stored record
//! atomically, so a crash mid-save leaves the previous checkpoint intact.
//!
//! On startup, [`CheckpointStore::load_for_resume`] returns a record only if
//! it parses, validates and is still running. Anything else is set aside and
//! the job starts fresh.

mod backend;
mod error;
mod record;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument, warn};

pub use backend::{CheckpointBackend, FileBackend, MAX_CHECKPOINT_BYTES, SqliteBackend};
pub use error::CheckpointError;
pub use record::{CheckpointRecord, CheckpointStatus, SCHEMA_VERSION, now_millis};

use crate::db::Database;

/// Saves, loads and validates checkpoints through a backend.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self { backend }
    }

    /// Store backed by a JSON file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(path)))
    }

    /// Store backed by the `checkpoints` table, one row per `job_key`.
    pub fn sqlite(db: Database, job_key: impl Into<String>) -> Self {
        Self::new(Arc::new(SqliteBackend::new(db, job_key)))
    }

    #[must_use]
    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    /// Writes `record`, replacing any previous checkpoint.
    ///
    /// # Errors
    ///
    /// Serialization or backend failure. The previous checkpoint is left
    /// untouched when this fails.
    #[instrument(
        skip(self, record),
        fields(batch = record.current_batch, processed = record.processed)
    )]
    pub async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec(record).map_err(CheckpointError::Serialize)?;
        self.backend.write(&body).await
    }

    /// Reads and parses the stored checkpoint without validating it.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Corrupt`] if the bytes do not parse; backend errors
    /// otherwise.
    pub async fn load(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let Some(bytes) = self.backend.read().await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CheckpointError::corrupt(e.to_string()))
    }

    /// Checks a record's internal consistency.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Invalid`] describing the violated rule.
    pub fn validate(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        record.validate()
    }

    /// Marks the stored checkpoint invalid and sets it aside.
    ///
    /// If the stored bytes still parse, the record is rewritten with status
    /// `invalidated` and the reason before being moved, so the reason travels
    /// with it.
    ///
    /// # Errors
    ///
    /// Backend failure while rewriting or discarding.
    #[instrument(skip(self), fields(location = %self.backend.describe()))]
    pub async fn invalidate(&self, reason: &str) -> Result<(), CheckpointError> {
        if let Ok(Some(mut record)) = self.load().await {
            record.status = CheckpointStatus::Invalidated;
            record.invalid_reason = Some(reason.to_string());
            self.save(&record).await?;
        }
        warn!(reason, "checkpoint invalidated");
        self.backend.discard().await
    }

    /// Loads the checkpoint a new run should resume from.
    ///
    /// Returns `None` when there is nothing to resume: no checkpoint, a
    /// completed job, or a checkpoint that was corrupt or inconsistent (which
    /// is invalidated here).
    ///
    /// # Errors
    ///
    /// Only I/O or database failures; untrusted data never errors.
    #[instrument(skip(self), fields(location = %self.backend.describe()))]
    pub async fn load_for_resume(&self) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let record = match self.load().await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) if e.is_untrusted() => {
                warn!(error = %e, "discarding unreadable checkpoint");
                self.invalidate(&e.to_string()).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match record.status {
            CheckpointStatus::Completed => {
                info!("previous job completed; starting fresh");
                return Ok(None);
            }
            CheckpointStatus::Invalidated => return Ok(None),
            CheckpointStatus::Running => {}
        }

        if let Err(e) = record.validate() {
            warn!(error = %e, "discarding inconsistent checkpoint");
            self.invalidate(&e.to_string()).await?;
            return Ok(None);
        }

        info!(
            processed = record.processed,
            successful = record.successful,
            failed = record.failed,
            "resuming from checkpoint"
        );
        Ok(Some(record))
    }

    /// Saves `record` with status `completed`.
    ///
    /// # Errors
    ///
    /// Same as [`save`](Self::save).
    pub async fn mark_completed(
        &self,
        record: &mut CheckpointRecord,
    ) -> Result<(), CheckpointError> {
        record.status = CheckpointStatus::Completed;
        record.last_checkpoint = now_millis().max(record.start_time);
        self.save(record).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::queue::DedupKey;

    fn running_record() -> CheckpointRecord {
        let mut record = CheckpointRecord::new(1_000);
        record.total = 3;
        record.processed = 2;
        record.successful = 1;
        record.failed = 1;
        record.last_checkpoint = 2_000;
        record.current_batch = 1;
        record.completed_keys = vec![DedupKey::for_url("https://a.test/1")];
        record
    }

    #[tokio::test]
    async fn test_save_then_load_returns_equal_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::file(dir.path().join("job.json"));
        let record = running_record();
        store.save(&record).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(record.clone()));
        assert_eq!(store.load_for_resume().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_invalidated_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, b"{\"total\": 3, \"proc").unwrap();
        let store = CheckpointStore::file(&path);

        assert!(store.load().await.unwrap_err().is_untrusted());
        assert_eq!(store.load_for_resume().await.unwrap(), None);
        assert!(!path.exists());
        assert!(dir.path().join("job.json.invalid").exists());
    }

    #[tokio::test]
    async fn test_inconsistent_checkpoint_records_reason() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("job.json"));
        let store = CheckpointStore::new(Arc::new(backend.clone()));
        let mut record = running_record();
        record.failed = 5;
        store.save(&record).await.unwrap();

        assert_eq!(store.load_for_resume().await.unwrap(), None);
        let set_aside: CheckpointRecord =
            serde_json::from_slice(&std::fs::read(backend.invalid_path()).unwrap()).unwrap();
        assert_eq!(set_aside.status, CheckpointStatus::Invalidated);
        assert!(set_aside.invalid_reason.unwrap().contains("processed"));
    }

    #[tokio::test]
    async fn test_completed_checkpoint_is_not_resumed() {
        let db = Database::new_in_memory().await.unwrap();
        let store = CheckpointStore::sqlite(db, "job-1");
        let mut record = running_record();
        store.mark_completed(&mut record).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().status, CheckpointStatus::Completed);
        assert_eq!(store.load_for_resume().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_resumes_nothing() {
        let db = Database::new_in_memory().await.unwrap();
        let store = CheckpointStore::sqlite(db, "absent");
        assert_eq!(store.load_for_resume().await.unwrap(), None);
        assert!(store.describe().contains("absent"));
    }
}
