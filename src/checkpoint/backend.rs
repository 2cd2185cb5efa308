//! Storage backends for checkpoint bytes.

use std::ffi::OsString;
use std::fmt::Debug;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::error::CheckpointError;
use super::record::now_millis;
use crate::db::Database;

/// Largest checkpoint accepted on load.
pub const MAX_CHECKPOINT_BYTES: u64 = 64 * 1024 * 1024;

/// Durable storage for a single serialized checkpoint.
///
/// `write` must be atomic: a concurrent or later `read` sees either the
/// previous bytes or the new bytes, never a mix.
#[async_trait]
pub trait CheckpointBackend: Send + Sync + Debug {
    /// Replaces the stored checkpoint.
    async fn write(&self, body: &[u8]) -> Result<(), CheckpointError>;

    /// Returns the stored bytes, or `None` when nothing has been saved.
    async fn read(&self) -> Result<Option<Vec<u8>>, CheckpointError>;

    /// Sets the stored checkpoint aside so it is no longer loaded.
    async fn discard(&self) -> Result<(), CheckpointError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Checkpoint stored as a JSON file, replaced via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location a discarded checkpoint is moved to.
    #[must_use]
    pub fn invalid_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, ".invalid")
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<(), CheckpointError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;

    remove_stale_temps(path, parent);
    let tmp = sibling_with_suffix(path, &format!(".{}.tmp", std::process::id()));
    if let Err(e) = write_then_rename(&tmp, path, body) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    sync_dir(parent);
    Ok(())
}

/// Deletes `<name>.<pid>.tmp` files left behind by crashed processes.
fn remove_stale_temps(path: &Path, parent: &Path) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Ok(entries) = std::fs::read_dir(parent) else {
        return;
    };
    let prefix = format!("{name}.");
    let own_pid = std::process::id().to_string();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(pid) = file_name
            .to_str()
            .and_then(|n| n.strip_prefix(&prefix))
            .and_then(|rest| rest.strip_suffix(".tmp"))
        else {
            continue;
        };
        if pid.is_empty() || pid == own_pid || !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let stale = entry.path();
        match std::fs::remove_file(&stale) {
            Ok(()) => debug!(path = %stale.display(), "removed stale checkpoint temp file"),
            Err(e) => {
                warn!(path = %stale.display(), error = %e, "could not remove stale temp file");
            }
        }
    }
}

fn write_then_rename(tmp: &Path, path: &Path, body: &[u8]) -> Result<(), CheckpointError> {
    let mut file = std::fs::File::create(tmp).map_err(|e| CheckpointError::io(tmp, e))?;
    file.write_all(body).map_err(|e| CheckpointError::io(tmp, e))?;
    file.flush().map_err(|e| CheckpointError::io(tmp, e))?;
    file.sync_all().map_err(|e| CheckpointError::io(tmp, e))?;
    std::fs::rename(tmp, path).map_err(|e| CheckpointError::io(path, e))
}

/// Persists the rename itself. Best effort.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = std::fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

fn read_capped(path: &Path) -> Result<Option<Vec<u8>>, CheckpointError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CheckpointError::io(path, e)),
    };
    if metadata.len() > MAX_CHECKPOINT_BYTES {
        return Err(CheckpointError::TooLarge {
            size: metadata.len(),
            max: MAX_CHECKPOINT_BYTES,
        });
    }
    std::fs::read(path)
        .map(Some)
        .map_err(|e| CheckpointError::io(path, e))
}

async fn blocking<T, F>(path: &Path, f: F) -> Result<T, CheckpointError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CheckpointError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CheckpointError::io(path, std::io::Error::other(e)))?
}

#[async_trait]
impl CheckpointBackend for FileBackend {
    #[instrument(skip(self, body), fields(path = %self.path.display(), bytes = body.len()))]
    async fn write(&self, body: &[u8]) -> Result<(), CheckpointError> {
        let path = self.path.clone();
        let body = body.to_vec();
        blocking(&self.path, move || write_atomic(&path, &body)).await?;
        debug!("checkpoint written");
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
        let path = self.path.clone();
        blocking(&self.path, move || read_capped(&path)).await
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn discard(&self) -> Result<(), CheckpointError> {
        let from = self.path.clone();
        let to = self.invalid_path();
        blocking(&self.path, move || match std::fs::rename(&from, &to) {
            Ok(()) => {
                warn!(moved_to = %to.display(), "checkpoint set aside");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(&from, e)),
        })
        .await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Checkpoint stored as a row in the `checkpoints` table, keyed by job.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    db: Database,
    job_key: String,
}

impl SqliteBackend {
    pub fn new(db: Database, job_key: impl Into<String>) -> Self {
        Self {
            db,
            job_key: job_key.into(),
        }
    }

    #[must_use]
    pub fn job_key(&self) -> &str {
        &self.job_key
    }
}

#[async_trait]
impl CheckpointBackend for SqliteBackend {
    #[instrument(skip(self, body), fields(job = %self.job_key, bytes = body.len()))]
    async fn write(&self, body: &[u8]) -> Result<(), CheckpointError> {
        let body = std::str::from_utf8(body)
            .map_err(|e| CheckpointError::corrupt(format!("checkpoint is not UTF-8: {e}")))?;
        let updated_at = i64::try_from(now_millis()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO checkpoints (job_key, body, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(job_key) DO UPDATE
             SET body = excluded.body, updated_at = excluded.updated_at",
        )
        .bind(&self.job_key)
        .bind(body)
        .bind(updated_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn read(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM checkpoints WHERE job_key = ?")
                .bind(&self.job_key)
                .fetch_optional(self.db.pool())
                .await?;
        match row {
            Some((body,)) if body.len() as u64 > MAX_CHECKPOINT_BYTES => {
                Err(CheckpointError::TooLarge {
                    size: body.len() as u64,
                    max: MAX_CHECKPOINT_BYTES,
                })
            }
            Some((body,)) => Ok(Some(body.into_bytes())),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(job = %self.job_key))]
    async fn discard(&self) -> Result<(), CheckpointError> {
        sqlx::query("DELETE FROM checkpoints WHERE job_key = ?")
            .bind(&self.job_key)
            .execute(self.db.pool())
            .await?;
        warn!("checkpoint row removed");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.job_key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_backend_missing_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("job.json"));
        assert!(backend.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_backend_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("nested").join("job.json"));
        backend.write(b"first").await.unwrap();
        backend.write(b"second").await.unwrap();
        assert_eq!(backend.read().await.unwrap().unwrap(), b"second");

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1, "temp files left behind: {entries:?}");
    }

    #[tokio::test]
    async fn test_file_backend_discard_moves_aside() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("job.json"));
        backend.write(b"{}").await.unwrap();
        backend.discard().await.unwrap();
        assert!(backend.read().await.unwrap().is_none());
        assert!(backend.invalid_path().exists());
        // Discarding nothing is fine
        backend.discard().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_backend_upserts_per_job() {
        let db = Database::new_in_memory().await.unwrap();
        let a = SqliteBackend::new(db.clone(), "a");
        let b = SqliteBackend::new(db, "b");
        a.write(b"one").await.unwrap();
        a.write(b"two").await.unwrap();
        b.write(b"other").await.unwrap();
        assert_eq!(a.read().await.unwrap().unwrap(), b"two");
        assert_eq!(b.read().await.unwrap().unwrap(), b"other");

        a.discard().await.unwrap();
        assert!(a.read().await.unwrap().is_none());
        assert!(b.read().await.unwrap().is_some());
    }
}
