//! Persisted job progress snapshot.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::error::CheckpointError;
use crate::queue::DedupKey;

/// Current checkpoint schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Job in progress; eligible for resume.
    #[default]
    Running,
    /// Job finished; nothing to resume.
    Completed,
    /// Failed validation and was set aside.
    Invalidated,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Invalidated => "invalidated",
        })
    }
}

/// Snapshot of job counters. Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: u32,
    /// Tasks submitted (accepted or skipped) over the job's lifetime.
    pub total: u64,
    pub processed: u64,
    pub successful: u64,
    pub failed: u64,
    /// Submissions skipped because they had already completed.
    pub skipped: u64,
    pub start_time: u64,
    pub last_checkpoint: u64,
    /// Number of checkpoint saves so far.
    pub current_batch: u64,
    pub status: CheckpointStatus,
    /// Dedup key of the most recently finished task.
    #[serde(default)]
    pub last_marker: Option<String>,
    /// Keys of every successfully fetched task, for rebuilding the dedup set.
    #[serde(default)]
    pub completed_keys: Vec<DedupKey>,
    #[serde(default)]
    pub invalid_reason: Option<String>,
}

impl Default for CheckpointRecord {
    fn default() -> Self {
        Self::new(now_millis())
    }
}

impl CheckpointRecord {
    /// Empty running record started at `start_time`.
    #[must_use]
    pub fn new(start_time: u64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            total: 0,
            processed: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            start_time,
            last_checkpoint: start_time,
            current_batch: 0,
            status: CheckpointStatus::Running,
            last_marker: None,
            completed_keys: Vec::new(),
            invalid_reason: None,
        }
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Invalid`] naming the first violated rule.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(CheckpointError::invalid(format!(
                "unsupported schema version {} (expected {SCHEMA_VERSION})",
                self.schema_version
            )));
        }
        if self.successful.checked_add(self.failed) != Some(self.processed) {
            return Err(CheckpointError::invalid(format!(
                "successful ({}) + failed ({}) != processed ({})",
                self.successful, self.failed, self.processed
            )));
        }
        if self.processed > self.total {
            return Err(CheckpointError::invalid(format!(
                "processed ({}) exceeds total ({})",
                self.processed, self.total
            )));
        }
        if self.completed_keys.len() as u64 > self.successful {
            return Err(CheckpointError::invalid(format!(
                "{} completed keys but only {} successful",
                self.completed_keys.len(),
                self.successful
            )));
        }
        if self.last_checkpoint < self.start_time {
            return Err(CheckpointError::invalid(
                "last checkpoint precedes start time",
            ));
        }
        Ok(())
    }
}

/// Milliseconds since the Unix epoch (0 if the clock is before it).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
