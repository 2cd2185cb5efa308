//! Spinner showing job progress while the orchestrator runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use docfetch_core::orchestrator::Orchestrator;
use indicatif::{ProgressBar, ProgressStyle};

/// Spawns the spinner when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `use_spinner` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    use_spinner: bool,
    orchestrator: Arc<Orchestrator>,
    total: usize,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_spinner_inner(orchestrator, total, Arc::clone(&stop));
    (Some(handle), stop)
}

fn spawn_spinner_inner(
    orchestrator: Arc<Orchestrator>,
    total: usize,
    stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            let stats = orchestrator.get_statistics();
            let done = usize::try_from(stats.completed + stats.failed).unwrap_or(usize::MAX);
            let eta = stats
                .eta
                .map(|eta| format!(", eta {}s", eta.as_secs()))
                .unwrap_or_default();
            spinner.set_message(format!(
                "[{}/{}] {} ok, {} failed, {} in flight, {:.1}/s{}",
                done,
                total,
                stats.completed,
                stats.failed,
                stats.in_flight,
                stats.rate_per_sec,
                eta
            ));
            tokio::time::sleep(Duration::from_millis(120)).await;
        }

        spinner.finish_and_clear();
    })
}
