//! Priority-ordered, deduplicating in-memory task queue.
//!
//! The queue is the only point of coordination between workers. It tracks
//! every task from admission through completion:
//!
//! - pending tasks live in one FIFO per [`Priority`] tier
//! - a dedup key is *outstanding* while its task is pending or in flight
//! - [`TaskQueue::fail`] releases the key so the task can be resubmitted
//! - [`TaskQueue::complete`] blocks the key permanently
//!
//! All state sits behind a single mutex that is never held across an await.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use docfetch_core::queue::{Priority, Task, TaskPayload, TaskQueue};
//!
//! # async fn example() {
//! let queue = TaskQueue::new();
//! let task = Task::new(TaskPayload::new("https://example.com/a.pdf"), Priority::HighCourt);
//! assert!(queue.add(task.clone()));
//! assert!(!queue.add(task)); // still outstanding
//!
//! let taken = queue.take(Duration::from_millis(10)).await.unwrap();
//! queue.complete(&taken);
//! # }
//! ```

mod stats;
mod task;

pub use stats::QueueStats;
pub use task::{
    DedupKey, ExpectedContent, PRIORITY_TIERS, Priority, Task, TaskPayload, canonicalize_url,
};

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

#[derive(Debug, Default)]
struct QueueState {
    tiers: [VecDeque<Task>; PRIORITY_TIERS],
    outstanding: HashSet<DedupKey>,
    completed_keys: HashSet<DedupKey>,
    in_flight: usize,
    next_sequence: u64,
    closed: bool,
    total_added: u64,
    duplicates_rejected: u64,
    already_completed: u64,
    completed: u64,
    failed: u64,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.pending() == 0
    }

    fn pop_most_urgent(&mut self) -> Option<Task> {
        self.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Ends an in-flight task. Returns false if the key was not outstanding.
    fn settle(&mut self, key: &DedupKey) -> bool {
        let was_outstanding = self.outstanding.remove(key);
        if was_outstanding {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        was_outstanding
    }
}

/// Shared work queue for the worker pool.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Notify,
    idle: Notify,
}

impl TaskQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a task. Returns `false` if its dedup key is outstanding or was
    /// already completed; the rejection is counted, not treated as an error.
    #[instrument(skip(self, task), fields(key = %task.dedup_key(), priority = %task.priority()))]
    pub fn add(&self, mut task: Task) -> bool {
        let mut state = self.lock();
        let key = task.dedup_key().clone();

        if state.completed_keys.contains(&key) {
            state.already_completed += 1;
            debug!("rejected task: already completed");
            return false;
        }
        if state.outstanding.contains(&key) {
            state.duplicates_rejected += 1;
            debug!("rejected task: duplicate outstanding");
            return false;
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        task.admit(sequence);
        state.outstanding.insert(key);
        state.tiers[task.priority().tier()].push_back(task);
        state.total_added += 1;
        drop(state);

        trace!(sequence, "task admitted");
        self.available.notify_one();
        true
    }

    /// Pops the most urgent pending task without waiting.
    pub fn try_take(&self) -> Option<Task> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let task = state.pop_most_urgent()?;
        state.in_flight += 1;
        Some(task)
    }

    /// Waits up to `timeout` for a task. Returns `None` on timeout or once the
    /// queue is closed.
    pub async fn take(&self, timeout: Duration) -> Option<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }
            if let Some(task) = self.try_take() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Marks an in-flight task as done. Its key stays blocked permanently.
    #[instrument(skip(self, task), fields(key = %task.dedup_key()))]
    pub fn complete(&self, task: &Task) {
        let mut state = self.lock();
        let key = task.dedup_key().clone();
        if !state.settle(&key) {
            warn!("complete called for a task that was not outstanding");
        }
        state.completed_keys.insert(key);
        state.completed += 1;
        self.notify_if_idle(&state);
    }

    /// Marks an in-flight task as failed and releases its key for resubmission.
    #[instrument(skip(self, task), fields(key = %task.dedup_key()))]
    pub fn fail(&self, task: &Task) {
        let mut state = self.lock();
        if !state.settle(task.dedup_key()) {
            warn!("fail called for a task that was not outstanding");
        }
        state.failed += 1;
        self.notify_if_idle(&state);
    }

    fn notify_if_idle(&self, state: &QueueState) {
        if state.is_idle() || (state.closed && state.in_flight == 0) {
            self.idle.notify_waiters();
        }
    }

    /// Seeds the permanently-blocked set with keys completed in a prior run.
    ///
    /// Returns how many keys were newly added.
    pub fn restore_completed<I>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = DedupKey>,
    {
        let mut state = self.lock();
        let before = state.completed_keys.len();
        state.completed_keys.extend(keys);
        state.completed_keys.len() - before
    }

    /// Snapshot of every completed key, sorted for stable serialization.
    #[must_use]
    pub fn completed_keys(&self) -> Vec<DedupKey> {
        let state = self.lock();
        let mut keys: Vec<DedupKey> = state.completed_keys.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Stops handing out work. Pending tasks stay queued; waiting takers wake up.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
        self.idle.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of pending (not yet taken) tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().pending()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// True when nothing is pending or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Resolves once the queue is idle (or closed with nothing in flight).
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.lock();
                if state.is_idle() || (state.closed && state.in_flight == 0) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Counts by priority plus lifetime totals.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending_by_priority: Priority::ALL
                .iter()
                .map(|p| (*p, state.tiers[p.tier()].len()))
                .collect(),
            in_flight: state.in_flight,
            total_added: state.total_added,
            duplicates_rejected: state.duplicates_rejected,
            already_completed: state.already_completed,
            completed: state.completed,
            failed: state.failed,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn task(url: &str, priority: Priority) -> Task {
        Task::new(TaskPayload::new(url), priority)
    }

    #[test]
    fn test_add_rejects_outstanding_duplicate() {
        let queue = TaskQueue::new();
        assert!(queue.add(task("https://a.test/1", Priority::Other)));
        assert!(!queue.add(task("https://a.test/1", Priority::SupremeCourt)));

        let stats = queue.stats();
        assert_eq!(stats.total_added, 1);
        assert_eq!(stats.duplicates_rejected, 1);
        assert_eq!(stats.pending(), 1);
    }

    #[test]
    fn test_try_take_serves_priority_then_fifo() {
        let queue = TaskQueue::new();
        queue.add(task("https://a.test/other-1", Priority::Other));
        queue.add(task("https://a.test/tribunal", Priority::Tribunal));
        queue.add(task("https://a.test/other-2", Priority::Other));
        queue.add(task("https://a.test/supreme", Priority::SupremeCourt));

        let order: Vec<String> = std::iter::from_fn(|| queue.try_take())
            .map(|t| t.url().to_string())
            .collect();
        assert_eq!(
            order,
            vec![
                "https://a.test/supreme",
                "https://a.test/tribunal",
                "https://a.test/other-1",
                "https://a.test/other-2",
            ]
        );
    }

    #[test]
    fn test_sequence_assigned_on_admission() {
        let queue = TaskQueue::new();
        queue.add(task("https://a.test/1", Priority::Other));
        queue.add(task("https://a.test/2", Priority::Other));
        let first = queue.try_take().unwrap();
        let second = queue.try_take().unwrap();
        assert_eq!(first.sequence(), 1);
        assert_eq!(second.sequence(), 2);
    }

    #[test]
    fn test_fail_releases_key_complete_blocks_it() {
        let queue = TaskQueue::new();
        queue.add(task("https://a.test/f", Priority::Other));
        queue.add(task("https://a.test/c", Priority::Other));

        let f = queue.try_take().unwrap();
        let c = queue.try_take().unwrap();
        assert!(!queue.add(task("https://a.test/f", Priority::Other)));

        queue.fail(&f);
        queue.complete(&c);

        assert!(queue.add(task("https://a.test/f", Priority::Other)));
        assert!(!queue.add(task("https://a.test/c", Priority::Other)));

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.already_completed, 1);
        assert_eq!(stats.duplicates_rejected, 1);
    }

    #[test]
    fn test_in_flight_tracking() {
        let queue = TaskQueue::new();
        queue.add(task("https://a.test/1", Priority::Other));
        assert!(!queue.is_idle());
        let t = queue.try_take().unwrap();
        assert_eq!(queue.in_flight(), 1);
        assert!(queue.is_empty());
        assert!(!queue.is_idle());
        queue.complete(&t);
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_restore_completed_blocks_keys() {
        let queue = TaskQueue::new();
        let added = queue.restore_completed([DedupKey::for_url("https://a.test/done")]);
        assert_eq!(added, 1);
        assert!(!queue.add(task("https://a.test/done", Priority::Other)));
        assert_eq!(queue.completed_keys().len(), 1);
        assert_eq!(queue.stats().already_completed, 1);
    }

    #[tokio::test]
    async fn test_take_times_out_with_none() {
        tokio::time::pause();
        let queue = TaskQueue::new();
        let start = Instant::now();
        assert!(queue.take(Duration::from_millis(200)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_take_wakes_when_task_added() {
        let queue = Arc::new(TaskQueue::new());
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.add(task("https://a.test/late", Priority::Other));
        });

        let taken = queue.take(Duration::from_secs(5)).await;
        assert_eq!(taken.unwrap().url(), "https://a.test/late");
    }

    #[tokio::test]
    async fn test_close_wakes_takers() {
        let queue = Arc::new(TaskQueue::new());
        let closer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });

        let start = std::time::Instant::now();
        assert!(queue.take(Duration::from_secs(30)).await.is_none());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_until_idle_resolves_after_completion() {
        let queue = Arc::new(TaskQueue::new());
        queue.add(task("https://a.test/1", Priority::Other));
        let t = queue.try_take().unwrap();

        let worker = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.complete(&t);
        });

        tokio::time::timeout(Duration::from_secs(5), queue.wait_until_idle())
            .await
            .unwrap();
        assert!(queue.is_idle());
    }
}
