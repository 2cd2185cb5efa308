//! Job counters and the statistics snapshot built from them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::checkpoint::{CheckpointRecord, CheckpointStatus, SCHEMA_VERSION, now_millis};
use crate::proxy::PoolStats;
use crate::queue::{DedupKey, Priority, QueueStats};

/// Counters carried over from a resumed checkpoint.
#[derive(Debug, Default, Clone, Copy)]
struct ResumeBase {
    total: u64,
    successful: u64,
    failed: u64,
    skipped: u64,
    batch: u64,
}

/// Lock-free job counters updated by workers.
#[derive(Debug)]
pub(crate) struct JobCounters {
    successful: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    batches: AtomicU64,
    start_time: AtomicU64,
    base: Mutex<ResumeBase>,
    last_marker: Mutex<Option<String>>,
}

impl Default for JobCounters {
    fn default() -> Self {
        Self {
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            start_time: AtomicU64::new(now_millis()),
            base: Mutex::new(ResumeBase::default()),
            last_marker: Mutex::new(None),
        }
    }
}

impl JobCounters {
    /// Carries a resumed checkpoint's counters forward.
    pub(crate) fn apply_resume(&self, record: &CheckpointRecord) {
        *self.base.lock().unwrap_or_else(PoisonError::into_inner) = ResumeBase {
            total: record.total,
            successful: record.successful,
            failed: record.failed,
            skipped: record.skipped,
            batch: record.current_batch,
        };
        self.start_time.store(record.start_time, Ordering::Relaxed);
        if let Some(marker) = &record.last_marker {
            self.set_marker(marker.clone());
        }
    }

    /// Records a success; returns the session's processed count.
    pub(crate) fn record_success(&self, key: &DedupKey, bytes: u64) -> u64 {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.set_marker(key.as_str().to_string());
        let successful = self.successful.fetch_add(1, Ordering::SeqCst) + 1;
        successful + self.failed.load(Ordering::SeqCst)
    }

    /// Records a failure; returns the session's processed count.
    pub(crate) fn record_failure(&self, key: &DedupKey) -> u64 {
        self.set_marker(key.as_str().to_string());
        let failed = self.failed.fetch_add(1, Ordering::SeqCst) + 1;
        failed + self.successful.load(Ordering::SeqCst)
    }

    fn set_marker(&self, marker: String) {
        *self
            .last_marker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(marker);
    }

    pub(crate) fn start_time(&self) -> u64 {
        self.start_time.load(Ordering::Relaxed)
    }

    /// Builds a checkpoint record.
    ///
    /// `completed_keys` must be captured before this call and `queue` after
    /// it, so that keys never outnumber successes and the submitted total
    /// never trails the processed count.
    pub(crate) fn checkpoint_after(
        &self,
        completed_keys: Vec<DedupKey>,
        queue: impl FnOnce() -> QueueStats,
        status: CheckpointStatus,
    ) -> CheckpointRecord {
        let base = *self.base.lock().unwrap_or_else(PoisonError::into_inner);
        let successful = base
            .successful
            .saturating_add(self.successful.load(Ordering::SeqCst));
        let failed = base.failed.saturating_add(self.failed.load(Ordering::SeqCst));
        let queue = queue();
        let start_time = self.start_time();
        let batch = base
            .batch
            .saturating_add(self.batches.fetch_add(1, Ordering::SeqCst) + 1);

        CheckpointRecord {
            schema_version: SCHEMA_VERSION,
            total: base
                .total
                .saturating_add(queue.total_added + queue.already_completed),
            processed: successful.saturating_add(failed),
            successful,
            failed,
            skipped: base.skipped.saturating_add(queue.already_completed),
            start_time,
            last_checkpoint: now_millis().max(start_time),
            current_batch: batch,
            status,
            last_marker: self
                .last_marker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            completed_keys,
            invalid_reason: None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn statistics(
        &self,
        queue: &QueueStats,
        retried: u64,
        elapsed: Duration,
        proxies: Option<PoolStats>,
    ) -> JobStatistics {
        let base = *self.base.lock().unwrap_or_else(PoisonError::into_inner);
        let session_completed = self.successful.load(Ordering::SeqCst);
        let session_failed = self.failed.load(Ordering::SeqCst);
        let completed = base.successful.saturating_add(session_completed);
        let failed = base.failed.saturating_add(session_failed);
        let pending = queue.pending();

        let rate_per_sec = rate(session_completed + session_failed, elapsed);
        let remaining = (pending + queue.in_flight) as f64;
        let eta = (rate_per_sec > 0.0 && remaining > 0.0)
            .then(|| Duration::from_secs_f64(remaining / rate_per_sec));

        JobStatistics {
            completed,
            failed,
            processed: completed.saturating_add(failed),
            skipped: base.skipped.saturating_add(queue.already_completed),
            total_submitted: base
                .total
                .saturating_add(queue.total_added + queue.already_completed),
            duplicates_rejected: queue.duplicates_rejected,
            already_completed: queue.already_completed,
            dedup_rate: queue.dedup_rate(),
            pending,
            pending_by_priority: queue.pending_by_priority.clone(),
            in_flight: queue.in_flight,
            bytes: self.bytes.load(Ordering::Relaxed),
            retried,
            elapsed,
            rate_per_sec,
            eta,
            proxies,
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        count as f64 / secs
    }
}

/// Point-in-time job statistics. Counters include a resumed run's totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStatistics {
    pub completed: u64,
    pub failed: u64,
    pub processed: u64,
    /// Submissions skipped because they completed earlier.
    pub skipped: u64,
    pub total_submitted: u64,
    pub duplicates_rejected: u64,
    pub already_completed: u64,
    pub dedup_rate: f64,
    pub pending: usize,
    pub pending_by_priority: BTreeMap<Priority, usize>,
    pub in_flight: usize,
    /// Payload bytes fetched this session.
    pub bytes: u64,
    /// Retry attempts scheduled this session.
    pub retried: u64,
    pub elapsed: Duration,
    /// Tasks finished per second this session.
    pub rate_per_sec: f64,
    pub eta: Option<Duration>,
    pub proxies: Option<PoolStats>,
}

impl JobStatistics {
    /// One-line summary for logs and the CLI.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "{} completed, {} failed, {} skipped, {} duplicates, {} pending, {:.1}/s",
            self.completed,
            self.failed,
            self.skipped,
            self.duplicates_rejected,
            self.pending,
            self.rate_per_sec
        );
        if let Some(eta) = self.eta {
            line.push_str(&format!(", eta {}s", eta.as_secs()));
        }
        if let Some(proxies) = &self.proxies {
            line.push_str(&format!(", proxies {}/{} active", proxies.active, proxies.total));
        }
        line
    }
}
