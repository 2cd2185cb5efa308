//! Worker pool that drives a fetch job from submission to final checkpoint.
//!
//! The [`Orchestrator`] owns the shared [`TaskQueue`], spawns a fixed number
//! of workers, a single checkpoint writer and an optional progress reporter,
//! and coordinates graceful shutdown.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use docfetch_core::download::{Downloader, HttpFetcher, RateLimiter, RetryPolicy};
//! use docfetch_core::orchestrator::{Orchestrator, OrchestratorConfig};
//! use docfetch_core::queue::{Priority, TaskPayload};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let downloader = Arc::new(Downloader::new(
//!     Arc::new(HttpFetcher::new()),
//!     Arc::new(RateLimiter::new(10, 10.0)),
//!     RetryPolicy::default(),
//! ));
//! let config = OrchestratorConfig::default().with_workers(5);
//! let orchestrator = Orchestrator::new(config, downloader)?;
//! orchestrator.start().await?;
//! orchestrator.submit(TaskPayload::new("https://example.com/a.pdf"), Some(Priority::HighCourt));
//! let stats = orchestrator.run_to_completion().await?;
//! println!("{}", stats.summary_line());
//! # Ok(())
//! # }
//! ```

mod shutdown;
mod sink;
mod stats;
mod worker;

pub use shutdown::ShutdownSignal;
pub use sink::{DiscardSink, DiskSink, ResultSink, SinkError};
pub use stats::JobStatistics;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::checkpoint::{CheckpointError, CheckpointRecord, CheckpointStatus, CheckpointStore};
use crate::download::Downloader;
use crate::queue::{Priority, Task, TaskPayload, TaskQueue};
use stats::JobCounters;
use worker::{CheckpointRequest, WorkerContext, run_worker};

/// Upper bound on the worker pool.
pub const MAX_WORKERS: usize = 100;

/// Orchestrator-level errors. Task failures never surface here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("orchestrator already started")]
    AlreadyStarted,

    #[error("cannot resume after {submitted} tasks were submitted")]
    SubmittedBeforeResume { submitted: u64 },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl OrchestratorError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

/// Tuning for a job run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Concurrent workers, `1..=100`.
    pub workers: usize,
    /// How long an idle worker waits on the queue before re-checking shutdown.
    pub take_timeout: Duration,
    /// Save a checkpoint every this many processed tasks.
    pub checkpoint_every: u64,
    /// Default wait for in-flight tasks during shutdown.
    pub drain_timeout: Duration,
    /// Interval for progress log lines; `None` disables them.
    pub progress_interval: Option<Duration>,
    /// Load and apply a checkpoint during `start`.
    pub resume: bool,
    /// Pause after a task fails for lack of proxies.
    pub proxy_exhausted_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            take_timeout: Duration::from_millis(250),
            checkpoint_every: 50,
            drain_timeout: Duration::from_secs(30),
            progress_interval: Some(Duration::from_secs(10)),
            resume: false,
            proxy_exhausted_backoff: Duration::from_secs(1),
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn with_take_timeout(mut self, timeout: Duration) -> Self {
        self.take_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_checkpoint_every(mut self, every: u64) -> Self {
        self.checkpoint_every = every;
        self
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_progress_interval(mut self, interval: Option<Duration>) -> Self {
        self.progress_interval = interval;
        self
    }

    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    #[must_use]
    pub fn with_proxy_exhausted_backoff(mut self, backoff: Duration) -> Self {
        self.proxy_exhausted_backoff = backoff;
        self
    }

    /// Range-checks every field.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !(1..=MAX_WORKERS).contains(&self.workers) {
            return Err(OrchestratorError::invalid(
                "workers",
                format!("must be between 1 and {MAX_WORKERS}, got {}", self.workers),
            ));
        }
        if self.checkpoint_every == 0 {
            return Err(OrchestratorError::invalid("checkpoint_every", "must be at least 1"));
        }
        if self.take_timeout.is_zero() {
            return Err(OrchestratorError::invalid("take_timeout", "must be non-zero"));
        }
        if self.progress_interval.is_some_and(|i| i.is_zero()) {
            return Err(OrchestratorError::invalid("progress_interval", "must be non-zero"));
        }
        Ok(())
    }
}

/// Handles for everything spawned by `start`.
#[derive(Debug)]
struct Running {
    workers: Vec<JoinHandle<()>>,
    checkpointer: Option<(mpsc::Sender<CheckpointRequest>, JoinHandle<()>)>,
    reporter: Option<JoinHandle<()>>,
}

/// Coordinates queue, downloader, workers and checkpoints for one job.
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    queue: Arc<TaskQueue>,
    downloader: Arc<Downloader>,
    checkpoint: Option<CheckpointStore>,
    sink: Arc<dyn ResultSink>,
    counters: Arc<JobCounters>,
    shutdown: Arc<ShutdownSignal>,
    created_at: Instant,
    resumed: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl Orchestrator {
    /// Creates an orchestrator that discards payloads and keeps no checkpoint.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidConfig`] if `config` fails validation.
    pub fn new(
        config: OrchestratorConfig,
        downloader: Arc<Downloader>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self {
            config,
            queue: Arc::new(TaskQueue::new()),
            downloader,
            checkpoint: None,
            sink: Arc::new(DiscardSink),
            counters: Arc::new(JobCounters::default()),
            shutdown: ShutdownSignal::shared(),
            created_at: Instant::now(),
            resumed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            running: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn with_checkpoint(mut self, store: CheckpointStore) -> Self {
        self.checkpoint = Some(store);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Signal observed by workers; request it to stop between tasks.
    #[must_use]
    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        Arc::clone(&self.shutdown)
    }

    /// Queues a task. Returns `false` for duplicates, already-completed work,
    /// or once shutdown has begun.
    pub fn submit(&self, payload: TaskPayload, priority: Option<Priority>) -> bool {
        if self.shutdown.is_requested() {
            warn!(url = %payload.url, "submit after shutdown ignored");
            return false;
        }
        self.queue.add(Task::new(payload, priority.unwrap_or_default()))
    }

    /// Loads the last checkpoint and applies it: completed keys are blocked
    /// and counters continue from the saved totals.
    ///
    /// Must run before tasks are submitted. A corrupt or inconsistent
    /// checkpoint is invalidated and the job starts clean.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::AlreadyStarted`] after `start`,
    /// [`OrchestratorError::SubmittedBeforeResume`] once anything was queued;
    /// checkpoint I/O errors.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<Option<CheckpointRecord>, OrchestratorError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStarted);
        }
        let submitted = self.queue.stats().total_added;
        if submitted > 0 {
            return Err(OrchestratorError::SubmittedBeforeResume { submitted });
        }
        if self.resumed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let Some(store) = &self.checkpoint else {
            warn!("resume requested without a checkpoint store");
            return Ok(None);
        };
        let Some(record) = store.load_for_resume().await? else {
            return Ok(None);
        };
        let restored = self.queue.restore_completed(record.completed_keys.iter().cloned());
        self.counters.apply_resume(&record);
        info!(restored, batch = record.current_batch, "resumed job state");
        Ok(Some(record))
    }

    /// Spawns workers, the checkpoint writer and the progress reporter.
    ///
    /// Applies a checkpoint first when `config.resume` is set.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::AlreadyStarted`] on a second call; resume errors.
    #[instrument(skip(self), fields(workers = self.config.workers))]
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStarted);
        }
        if self.config.resume {
            self.resume().await?;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyStarted);
        }

        let checkpointer = self.checkpoint.clone().map(|store| {
            let (tx, rx) = mpsc::channel(4);
            let handle = tokio::spawn(checkpoint_writer(
                store,
                Arc::clone(&self.queue),
                Arc::clone(&self.counters),
                rx,
            ));
            (tx, handle)
        });

        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&self.queue),
            downloader: Arc::clone(&self.downloader),
            sink: Arc::clone(&self.sink),
            counters: Arc::clone(&self.counters),
            shutdown: Arc::clone(&self.shutdown),
            checkpoints: checkpointer.as_ref().map(|(tx, _)| tx.clone()),
            take_timeout: self.config.take_timeout,
            checkpoint_every: self.config.checkpoint_every,
            proxy_exhausted_backoff: self.config.proxy_exhausted_backoff,
        });
        let workers = (0..self.config.workers)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&ctx))))
            .collect();

        let reporter = self.config.progress_interval.map(|interval| {
            tokio::spawn(progress_reporter(
                interval,
                Arc::clone(&self.queue),
                Arc::clone(&self.counters),
                Arc::clone(&self.downloader),
                Arc::clone(&self.shutdown),
                Instant::now(),
            ))
        });

        *self.lock_running() = Some(Running {
            workers,
            checkpointer,
            reporter,
        });
        info!("orchestrator started");
        Ok(())
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once nothing is pending or in flight.
    ///
    /// Never resolves while tasks are pending and no workers are running.
    pub async fn wait_until_idle(&self) {
        self.queue.wait_until_idle().await;
    }

    /// Current counters, queue depths and proxy health.
    #[must_use]
    pub fn get_statistics(&self) -> JobStatistics {
        self.counters.statistics(
            &self.queue.stats(),
            self.downloader.retried(),
            self.created_at.elapsed(),
            self.downloader.proxies().map(|p| p.stats()),
        )
    }

    /// Stops the job: signals workers, closes the queue, waits up to
    /// `drain_timeout` for in-flight tasks, then writes a final checkpoint.
    ///
    /// Workers still running at the deadline are aborted and their tasks stay
    /// unfinished. The final checkpoint is `completed` only when nothing was
    /// left pending or in flight. A failed final save is logged, not returned.
    ///
    /// Only the first call does any work; later calls return current statistics.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for callers to `?` it.
    #[instrument(skip(self))]
    pub async fn shutdown(
        &self,
        drain_timeout: Duration,
    ) -> Result<JobStatistics, OrchestratorError> {
        self.shutdown.request();
        self.queue.close();
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(self.get_statistics());
        }
        info!("shutting down");

        let running = self.lock_running().take();
        let (checkpointer, reporter) = match running {
            Some(running) => {
                let aborts: Vec<_> = running.workers.iter().map(JoinHandle::abort_handle).collect();
                if tokio::time::timeout(drain_timeout, join_all(running.workers))
                    .await
                    .is_err()
                {
                    warn!(
                        in_flight = self.queue.in_flight(),
                        "drain timeout elapsed; abandoning in-flight tasks"
                    );
                    for handle in aborts {
                        handle.abort();
                    }
                }
                (running.checkpointer, running.reporter)
            }
            None => (None, None),
        };

        if let Some(reporter) = reporter {
            reporter.abort();
        }

        let finished = self.queue.is_empty() && self.queue.in_flight() == 0;
        let status = if finished {
            CheckpointStatus::Completed
        } else {
            CheckpointStatus::Running
        };

        match checkpointer {
            Some((tx, handle)) => {
                final_checkpoint(&tx, status).await;
                drop(tx);
                let _ = handle.await;
            }
            None => {
                // Never started: write directly if a store exists
                if let Some(store) = &self.checkpoint {
                    let record = self.counters.checkpoint_after(
                        self.queue.completed_keys(),
                        || self.queue.stats(),
                        status,
                    );
                    if let Err(e) = store.save(&record).await {
                        warn!(error = %e, "final checkpoint save failed");
                    }
                }
            }
        }

        let stats = self.get_statistics();
        info!(summary = %stats.summary_line(), status = %status, "orchestrator stopped");
        Ok(stats)
    }

    /// Starts if needed, waits until the queue drains, then shuts down.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub async fn run_to_completion(&self) -> Result<JobStatistics, OrchestratorError> {
        if !self.started.load(Ordering::SeqCst) {
            self.start().await?;
        }
        tokio::select! {
            () = self.wait_until_idle() => {}
            () = self.shutdown.wait() => {}
        }
        self.shutdown(self.config.drain_timeout).await
    }
}

async fn final_checkpoint(tx: &mpsc::Sender<CheckpointRequest>, status: CheckpointStatus) {
    let (reply, rx) = oneshot::channel();
    if tx.send(CheckpointRequest::Final { status, reply }).await.is_err() {
        warn!("checkpoint writer stopped before final save");
        return;
    }
    match rx.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "final checkpoint save failed"),
        Err(_) => warn!("checkpoint writer dropped final save"),
    }
}

/// Sole writer of checkpoints for the job.
async fn checkpoint_writer(
    store: CheckpointStore,
    queue: Arc<TaskQueue>,
    counters: Arc<JobCounters>,
    mut rx: mpsc::Receiver<CheckpointRequest>,
) {
    while let Some(request) = rx.recv().await {
        let (status, reply) = match request {
            CheckpointRequest::Periodic => (CheckpointStatus::Running, None),
            CheckpointRequest::Final { status, reply } => (status, Some(reply)),
        };
        let record = counters.checkpoint_after(queue.completed_keys(), || queue.stats(), status);
        let result = store.save(&record).await;
        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(error = %e, "periodic checkpoint save failed");
                }
            }
        }
    }
}

async fn progress_reporter(
    interval: Duration,
    queue: Arc<TaskQueue>,
    counters: Arc<JobCounters>,
    downloader: Arc<Downloader>,
    shutdown: Arc<ShutdownSignal>,
    started: Instant,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = shutdown.wait() => break,
            _ = ticker.tick() => {
                let stats = counters.statistics(
                    &queue.stats(),
                    downloader.retried(),
                    started.elapsed(),
                    downloader.proxies().map(|p| p.stats()),
                );
                info!(
                    completed = stats.completed,
                    failed = stats.failed,
                    pending = stats.pending,
                    in_flight = stats.in_flight,
                    rate = stats.rate_per_sec,
                    eta_secs = ?stats.eta.map(|e| e.as_secs()),
                    "progress"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation_ranges() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        assert!(OrchestratorConfig::default().with_workers(0).validate().is_err());
        assert!(OrchestratorConfig::default().with_workers(101).validate().is_err());
        assert!(OrchestratorConfig::default().with_workers(100).validate().is_ok());
        let err = OrchestratorConfig::default()
            .with_checkpoint_every(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("checkpoint_every"));
        assert!(
            OrchestratorConfig::default()
                .with_progress_interval(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
    }
}
