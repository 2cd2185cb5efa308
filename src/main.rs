//! CLI entry point for docfetch.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use docfetch_core::checkpoint::CheckpointStore;
use docfetch_core::download::{Downloader, HttpFetcher, ProxyMode, RateLimiter, RetryPolicy};
use docfetch_core::orchestrator::{DiskSink, Orchestrator, OrchestratorConfig};
use docfetch_core::proxy::{ProxyEndpoint, ProxyPool, ProxyProvider, parse_proxy_list};
use tracing::{debug, info, warn};

mod cli;
mod config;
mod input;
mod progress;

use cli::Args;
use config::FileConfig;

const DEFAULT_WORKERS: usize = 10;
const DEFAULT_RATE: f64 = 2.0;
const DEFAULT_CHECKPOINT_EVERY: u64 = 50;
const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);
const PROXY_API_KEY_ENV: &str = "DOCFETCH_PROXY_API_KEY";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let loaded = config::load(args.config.as_deref())?;
    let file_config = loaded
        .as_ref()
        .map(|(_, cfg)| cfg.clone())
        .unwrap_or_default();

    init_tracing(&args, &file_config);
    debug!(?args, "CLI arguments parsed");
    if let Some((path, _)) = &loaded {
        info!(path = %path.display(), "loaded config file");
    }

    // Read input: from positional args or stdin
    let input_text = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read URLs from stdin")?;
        buffer
    } else {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'high_court https://example.com/judgment.pdf' | docfetch");
        return Ok(());
    };

    let parsed = input::parse_lines(&input_text);
    for line in &parsed.skipped {
        warn!(line = %line, "skipped input line without a URL");
    }
    if parsed.items.is_empty() {
        info!("No valid URLs found in input");
        return Ok(());
    }

    let settings = Settings::merge(&args, &file_config)?;
    let downloader = Arc::new(build_downloader(&args, &file_config, &settings).await?);

    let orchestrator_config = OrchestratorConfig::default()
        .with_workers(settings.workers)
        .with_checkpoint_every(settings.checkpoint_every)
        .with_drain_timeout(settings.drain_timeout)
        .with_progress_interval((!args.quiet).then_some(PROGRESS_LOG_INTERVAL))
        .with_resume(args.resume);
    let mut orchestrator = Orchestrator::new(orchestrator_config, downloader)?
        .with_sink(Arc::new(DiskSink::new(&settings.output_dir)));
    if let Some(path) = &settings.checkpoint {
        orchestrator = orchestrator.with_checkpoint(CheckpointStore::file(path));
    }
    let orchestrator = Arc::new(orchestrator);

    orchestrator.start().await?;

    let default_priority = args.priority;
    let mut accepted = 0usize;
    for item in parsed.items {
        if orchestrator.submit(item.payload, item.priority.or(default_priority)) {
            accepted += 1;
        }
    }
    info!(
        accepted,
        skipped = parsed.skipped.len(),
        "submitted tasks"
    );

    let signal = orchestrator.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight tasks");
            signal.request();
        }
    });

    let use_spinner = !args.quiet && io::stderr().is_terminal();
    let (spinner, stop) =
        progress::spawn_progress_ui(use_spinner, Arc::clone(&orchestrator), accepted);

    let stats = orchestrator.run_to_completion().await?;

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = spinner {
        let _ = handle.await;
    }

    info!(
        completed = stats.completed,
        failed = stats.failed,
        skipped = stats.skipped,
        duplicates = stats.duplicates_rejected,
        bytes = stats.bytes,
        retried = stats.retried,
        elapsed_secs = stats.elapsed.as_secs(),
        "{}",
        stats.summary_line()
    );

    Ok(())
}

/// Priority: `RUST_LOG` > `--quiet` > `-v` > config verbosity > info.
fn init_tracing(args: &Args, file_config: &FileConfig) {
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => file_config.verbosity.map_or("info", |v| v.filter()),
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Effective settings after layering CLI flags over the config file.
#[derive(Debug)]
struct Settings {
    workers: usize,
    rate: f64,
    burst: u32,
    max_retries: u32,
    checkpoint: Option<PathBuf>,
    checkpoint_every: u64,
    drain_timeout: Duration,
    output_dir: PathBuf,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
}

impl Settings {
    fn merge(args: &Args, file: &FileConfig) -> Result<Self> {
        let rate = args.rate.or(file.rate).unwrap_or(DEFAULT_RATE);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let default_burst = rate.ceil().clamp(1.0, 10_000.0) as u32;
        let checkpoint = args.checkpoint.clone().or_else(|| file.checkpoint.clone());
        if args.resume && checkpoint.is_none() {
            bail!("--resume needs a checkpoint location (--checkpoint or `checkpoint` in config)");
        }

        Ok(Self {
            workers: args
                .workers
                .map(usize::from)
                .or(file.workers)
                .unwrap_or(DEFAULT_WORKERS),
            rate,
            burst: args.burst.or(file.burst).unwrap_or(default_burst),
            max_retries: args
                .max_retries
                .or(file.max_retries)
                .unwrap_or(docfetch_core::download::DEFAULT_MAX_RETRIES),
            checkpoint,
            checkpoint_every: args
                .checkpoint_every
                .or(file.checkpoint_every)
                .unwrap_or(DEFAULT_CHECKPOINT_EVERY),
            drain_timeout: Duration::from_secs(
                args.drain_timeout
                    .or(file.drain_timeout_secs)
                    .unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS),
            ),
            output_dir: args
                .output_dir
                .clone()
                .or_else(|| file.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            connect_timeout: file.connect_timeout_secs.map(Duration::from_secs),
            read_timeout: file.read_timeout_secs.map(Duration::from_secs),
        })
    }
}

async fn build_downloader(
    args: &Args,
    file: &FileConfig,
    settings: &Settings,
) -> Result<Downloader> {
    let rate_limiter = if settings.rate <= 0.0 {
        debug!("rate limiting disabled");
        Arc::new(RateLimiter::disabled())
    } else {
        debug!(rate = settings.rate, burst = settings.burst, "rate limiting enabled");
        Arc::new(RateLimiter::new(settings.burst, settings.rate))
    };

    let mut fetcher = HttpFetcher::new();
    if settings.connect_timeout.is_some() || settings.read_timeout.is_some() {
        let defaults = HttpFetcher::new();
        fetcher = HttpFetcher::with_timeouts(
            settings.connect_timeout.unwrap_or(defaults.connect_timeout()),
            settings.read_timeout.unwrap_or(defaults.read_timeout()),
        );
    }

    let retry_policy = RetryPolicy::with_max_attempts(settings.max_retries + 1);
    let downloader = Downloader::new(Arc::new(fetcher), rate_limiter, retry_policy);

    let endpoints = collect_proxies(args, file).await?;
    let mode = args.proxy_mode.or(file.proxy_mode);
    if endpoints.is_empty() {
        if mode == Some(ProxyMode::Required) {
            bail!("proxy mode `required` needs at least one proxy");
        }
        return Ok(downloader);
    }

    let pool = Arc::new(ProxyPool::new(endpoints));
    let mode = mode.unwrap_or(ProxyMode::PreferProxy);
    let strategy = args.proxy_strategy.or(file.proxy_strategy).unwrap_or_default();
    info!(proxies = pool.len(), %mode, %strategy, "proxy pool ready");
    Ok(downloader.with_proxies(pool, mode, strategy))
}

async fn collect_proxies(args: &Args, file: &FileConfig) -> Result<Vec<ProxyEndpoint>> {
    let mut endpoints = args
        .proxies
        .iter()
        .map(|raw| ProxyEndpoint::parse(raw))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid --proxy value")?;

    if let Some(path) = args.proxy_file.as_ref().or(file.proxy_file.as_ref()) {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read proxy file '{}'", path.display()))?;
        endpoints.extend(
            parse_proxy_list(&text)
                .with_context(|| format!("invalid proxy file '{}'", path.display()))?,
        );
    }

    if let Some(url) = &args.proxy_provider {
        let api_key = std::env::var(PROXY_API_KEY_ENV)
            .with_context(|| format!("{PROXY_API_KEY_ENV} must be set to use --proxy-provider"))?;
        let provider = ProxyProvider::new(url.as_str(), api_key)?;
        let fetched = provider
            .fetch_all()
            .await
            .context("failed to load proxies from provider")?;
        info!(count = fetched.len(), "loaded proxies from provider");
        endpoints.extend(fetched);
    }

    Ok(endpoints)
}
