//! Error types for checkpoint persistence.

use std::path::PathBuf;

use thiserror::Error;

use crate::db::DbError;
use crate::download::ErrorKind;

/// Errors raised while saving, loading or validating checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The record could not be serialized.
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Stored bytes are not a readable checkpoint.
    #[error("checkpoint is corrupt: {reason}")]
    Corrupt { reason: String },

    /// The record parsed but violates a consistency rule.
    #[error("checkpoint failed validation: {reason}")]
    Invalid { reason: String },

    /// Stored checkpoint exceeds the size limit.
    #[error("checkpoint is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },

    /// Database backend failure.
    #[error("checkpoint database error: {0}")]
    Database(#[from] DbError),
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    /// True when the stored checkpoint cannot be trusted and should be discarded.
    #[must_use]
    pub fn is_untrusted(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. } | Self::Invalid { .. } | Self::TooLarge { .. }
        )
    }

    /// Untrusted checkpoints map onto [`ErrorKind::CheckpointCorrupt`].
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        self.is_untrusted().then_some(ErrorKind::CheckpointCorrupt)
    }
}

impl From<sqlx::Error> for CheckpointError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database(DbError::from(error))
    }
}
