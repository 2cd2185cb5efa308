//! Worker loop: take, execute, hand off, settle, count.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use super::shutdown::ShutdownSignal;
use super::sink::ResultSink;
use super::stats::JobCounters;
use crate::checkpoint::{CheckpointError, CheckpointStatus};
use crate::download::{Downloader, ErrorKind};
use crate::queue::{Task, TaskQueue};

/// Messages to the single checkpoint writer.
#[derive(Debug)]
pub(crate) enum CheckpointRequest {
    Periodic,
    Final {
        status: CheckpointStatus,
        reply: oneshot::Sender<Result<(), CheckpointError>>,
    },
}

/// State shared by every worker.
#[derive(Debug)]
pub(crate) struct WorkerContext {
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) downloader: Arc<Downloader>,
    pub(crate) sink: Arc<dyn ResultSink>,
    pub(crate) counters: Arc<JobCounters>,
    pub(crate) shutdown: Arc<ShutdownSignal>,
    pub(crate) checkpoints: Option<mpsc::Sender<CheckpointRequest>>,
    pub(crate) take_timeout: Duration,
    pub(crate) checkpoint_every: u64,
    pub(crate) proxy_exhausted_backoff: Duration,
}

#[instrument(skip(ctx), fields(worker = id))]
pub(crate) async fn run_worker(id: usize, ctx: Arc<WorkerContext>) {
    debug!("worker started");
    loop {
        if ctx.shutdown.is_requested() {
            break;
        }
        let Some(task) = ctx.queue.take(ctx.take_timeout).await else {
            if ctx.queue.is_closed() {
                break;
            }
            continue;
        };
        let kind = process(&ctx, &task).await;

        if kind == Some(ErrorKind::ProxyExhausted) && !ctx.proxy_exhausted_backoff.is_zero() {
            debug!(
                backoff_ms = ctx.proxy_exhausted_backoff.as_millis(),
                "no proxy available, backing off"
            );
            tokio::select! {
                () = tokio::time::sleep(ctx.proxy_exhausted_backoff) => {}
                () = ctx.shutdown.wait() => {}
            }
        }
    }
    debug!("worker stopped");
}

/// Runs one task to completion. Returns the failure kind, if any.
async fn process(ctx: &WorkerContext, task: &Task) -> Option<ErrorKind> {
    let result = ctx.downloader.execute(task).await;
    let key = task.dedup_key();

    let outcome = if result.success {
        match ctx.sink.accept(task, &result).await {
            Ok(()) => Ok(result.bytes),
            Err(e) => {
                warn!(task = %key, error = %e, "result sink rejected payload");
                Err(None)
            }
        }
    } else {
        Err(result.error_kind)
    };

    // Counters move before the queue so checkpoints never list a key
    // that the counters do not yet account for.
    let processed = match outcome {
        Ok(bytes) => {
            let processed = ctx.counters.record_success(key, bytes);
            ctx.queue.complete(task);
            info!(task = %key, bytes, attempts = result.attempts, "fetched");
            processed
        }
        Err(kind) => {
            let processed = ctx.counters.record_failure(key);
            ctx.queue.fail(task);
            warn!(
                task = %key,
                url = %task.url(),
                kind = ?kind,
                attempts = result.attempts,
                error = result.error.as_deref().unwrap_or("sink failure"),
                "task failed"
            );
            processed
        }
    };

    if processed % ctx.checkpoint_every == 0
        && let Some(tx) = &ctx.checkpoints
        && tx.try_send(CheckpointRequest::Periodic).is_err()
    {
        debug!("checkpoint already queued");
    }

    match outcome {
        Ok(_) => None,
        Err(kind) => kind,
    }
}
