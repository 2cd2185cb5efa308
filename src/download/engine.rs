//! Single-task execution: token, proxy, fetch with bounded retries, validation.
//!
//! The [`Downloader`] turns one [`Task`] into a [`DownloadResult`]. It never
//! returns an error: every failure is folded into the result with a closed
//! [`ErrorKind`] so the worker loop can decide between `complete` and `fail`.
//!
//! # Retry Behavior
//!
//! - One rate-limiter token is acquired before every attempt
//! - Transient errors (timeouts, resets, 5xx, 408) are retried with exponential backoff
//! - 429 responses are retried, honouring `Retry-After` when present
//! - Permanent errors (other 4xx) fail immediately
//! - An invalid payload is retried only through a different proxy
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use docfetch_core::download::{Downloader, HttpFetcher, RateLimiter, RetryPolicy};
//! use docfetch_core::queue::{Priority, Task, TaskPayload};
//!
//! # async fn example() {
//! let downloader = Downloader::new(
//!     Arc::new(HttpFetcher::new()),
//!     Arc::new(RateLimiter::new(5, 2.0)),
//!     RetryPolicy::default(),
//! );
//! let task = Task::new(TaskPayload::new("https://example.com/a.pdf"), Priority::Other);
//! let result = downloader.execute(&task).await;
//! println!("success={} bytes={} attempts={}", result.success, result.bytes, result.attempts);
//! # }
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::client::{FetchRequest, FetchResponse, Fetcher};
use super::error::{DownloadError, ErrorKind};
use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::validation::ValidationRules;
use crate::proxy::{ProxyHandle, ProxyPool, RotationStrategy};
use crate::queue::{ExpectedContent, Task};

/// Whether and how requests are routed through the proxy pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// Never use a proxy.
    #[default]
    Direct,
    /// Every request must go through a proxy; exhaustion fails the task.
    Required,
    /// Use a proxy when one is active, otherwise connect directly.
    PreferProxy,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Required => "required",
            Self::PreferProxy => "prefer_proxy",
        })
    }
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "direct" | "off" => Ok(Self::Direct),
            "required" | "always" => Ok(Self::Required),
            "prefer_proxy" | "prefer" => Ok(Self::PreferProxy),
            other => Err(format!(
                "unknown proxy mode '{other}' (expected direct, required or prefer_proxy)"
            )),
        }
    }
}

/// Outcome of executing one task.
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    pub success: bool,
    /// Size of the validated body (0 on failure).
    pub bytes: u64,
    /// Duration of the final attempt.
    pub latency: Duration,
    pub attempts: u32,
    /// Last HTTP status observed, if any response arrived.
    pub status: Option<u16>,
    /// Id of the proxy used by the final attempt.
    pub proxy: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    /// The validated payload on success.
    pub body: Option<Vec<u8>>,
    pub content_type: Option<String>,
}

/// Executes tasks against a [`Fetcher`], shared by every worker.
#[derive(Debug)]
pub struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    rate_limiter: Arc<RateLimiter>,
    proxies: Option<Arc<ProxyPool>>,
    proxy_mode: ProxyMode,
    strategy: RotationStrategy,
    retry_policy: RetryPolicy,
    validation: ValidationRules,
    retried: AtomicU64,
}

impl Downloader {
    /// Creates a downloader that connects directly, with default validation.
    #[must_use]
    #[instrument(level = "debug", skip(fetcher, rate_limiter, retry_policy))]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
    ) -> Self {
        debug!(
            max_attempts = retry_policy.max_attempts(),
            rate_capacity = rate_limiter.capacity(),
            rate_refill = rate_limiter.refill_rate(),
            rate_limit_disabled = rate_limiter.is_disabled(),
            "creating downloader"
        );
        Self {
            fetcher,
            rate_limiter,
            proxies: None,
            proxy_mode: ProxyMode::Direct,
            strategy: RotationStrategy::default(),
            retry_policy,
            validation: ValidationRules::default(),
            retried: AtomicU64::new(0),
        }
    }

    /// Routes requests through `pool` according to `mode` and `strategy`.
    #[must_use]
    pub fn with_proxies(
        mut self,
        pool: Arc<ProxyPool>,
        mode: ProxyMode,
        strategy: RotationStrategy,
    ) -> Self {
        self.proxies = Some(pool);
        self.proxy_mode = mode;
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_validation(mut self, validation: ValidationRules) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.fetcher
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    #[must_use]
    pub fn proxies(&self) -> Option<&Arc<ProxyPool>> {
        self.proxies.as_ref()
    }

    #[must_use]
    pub fn proxy_mode(&self) -> ProxyMode {
        self.proxy_mode
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Total retry attempts scheduled across all tasks.
    #[must_use]
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Executes one task to a final outcome.
    #[instrument(skip(self, task), fields(task = %task.dedup_key(), url = %task.url()))]
    pub async fn execute(&self, task: &Task) -> DownloadResult {
        let url = task.url();
        let expected = task.payload().expected;
        // Proxies that already served an invalid payload for this task
        let mut tainted: Vec<String> = Vec::new();
        let mut attempt = 0u32;
        let mut last_status = None;

        loop {
            attempt += 1;
            self.rate_limiter.acquire(1).await;

            let proxy = match self.select_proxy(&tainted) {
                Ok(proxy) => proxy,
                Err(error) => {
                    warn!(attempt, %error, "no proxy available");
                    return failure(&error, attempt, Duration::ZERO, last_status, None);
                }
            };
            let proxy_id = proxy.as_ref().map(ProxyHandle::id);

            debug!(attempt, proxy = ?proxy_id, "attempting fetch");
            let started = Instant::now();
            let outcome = self.attempt(url, expected, proxy.as_ref()).await;
            let latency = started.elapsed();

            let error = match outcome {
                Ok(response) => {
                    if let (Some(pool), Some(handle)) = (&self.proxies, &proxy) {
                        pool.record_success(handle, latency);
                    }
                    debug!(attempt, bytes = response.body.len(), "fetch succeeded");
                    return DownloadResult {
                        success: true,
                        bytes: response.body.len() as u64,
                        latency,
                        attempts: attempt,
                        status: Some(response.status),
                        proxy: proxy_id,
                        error_kind: None,
                        error: None,
                        content_type: response.content_type,
                        body: Some(response.body),
                    };
                }
                Err(error) => error,
            };

            last_status = error.status().or(last_status);
            let mut failure_type = classify_error(&error);

            if let (Some(pool), Some(handle)) = (&self.proxies, &proxy) {
                match failure_type {
                    // The proxy delivered a definitive answer from the origin
                    FailureType::Permanent => pool.record_success(handle, latency),
                    _ => pool.record_failure(handle),
                }
            }

            if failure_type == FailureType::InvalidPayload
                && let Some(handle) = &proxy
            {
                tainted.push(handle.id());
                if self.has_untainted_proxy(&tainted) {
                    debug!(proxy = %handle.id(), "invalid payload, retrying via another proxy");
                    failure_type = FailureType::Transient;
                }
            }

            let retry_after = if failure_type == FailureType::RateLimited {
                retry_after_delay(&error)
            } else {
                None
            };

            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay: backoff_delay,
                    attempt: next_attempt,
                } => {
                    let delay = retry_after.unwrap_or(backoff_delay);
                    info!(
                        attempt = next_attempt,
                        max_attempts = self.retry_policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = retry_after.is_some(),
                        error = %error,
                        "retrying fetch"
                    );
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(%reason, "not retrying fetch");
                    return failure(&error, attempt, latency, last_status, proxy_id);
                }
            }
        }
    }

    /// One fetch plus status and payload checks.
    async fn attempt(
        &self,
        url: &str,
        expected: ExpectedContent,
        proxy: Option<&ProxyHandle>,
    ) -> Result<FetchResponse, DownloadError> {
        let request = FetchRequest {
            url,
            proxy: proxy.map(ProxyHandle::endpoint),
        };
        let response = self.fetcher.fetch(request).await?;

        if !response.is_success() {
            return Err(DownloadError::http_status_with_retry_after(
                url,
                response.status,
                response.retry_after,
            ));
        }

        self.validation
            .validate(&response.body, expected)
            .map_err(|reason| DownloadError::invalid_payload(url, reason))?;

        Ok(response)
    }

    fn select_proxy(&self, exclude: &[String]) -> Result<Option<ProxyHandle>, DownloadError> {
        let pool = match (&self.proxies, self.proxy_mode) {
            (_, ProxyMode::Direct) => return Ok(None),
            (None, ProxyMode::Required) => return Err(DownloadError::ProxyExhausted),
            (None, ProxyMode::PreferProxy) => return Ok(None),
            (Some(pool), _) => pool,
        };

        match pool.get_next_excluding(self.strategy, exclude) {
            Ok(handle) => Ok(Some(handle)),
            Err(_) if self.proxy_mode == ProxyMode::PreferProxy => {
                debug!("proxy pool exhausted, falling back to direct fetch");
                Ok(None)
            }
            Err(_) => Err(DownloadError::ProxyExhausted),
        }
    }

    fn has_untainted_proxy(&self, tainted: &[String]) -> bool {
        self.proxies
            .as_ref()
            .is_some_and(|pool| pool.has_eligible(tainted))
    }
}

/// Parses the Retry-After header carried by a rate-limited error.
fn retry_after_delay(error: &DownloadError) -> Option<Duration> {
    let DownloadError::HttpStatus {
        retry_after: Some(header),
        ..
    } = error
    else {
        return None;
    };
    let delay = parse_retry_after(header)?;
    debug!(retry_after = %header, delay_ms = delay.as_millis(), "using Retry-After header delay");
    Some(delay)
}

fn failure(
    error: &DownloadError,
    attempts: u32,
    latency: Duration,
    status: Option<u16>,
    proxy: Option<String>,
) -> DownloadResult {
    DownloadResult {
        success: false,
        bytes: 0,
        latency,
        attempts,
        status,
        proxy,
        error_kind: Some(error.kind()),
        error: Some(error.to_string()),
        body: None,
        content_type: None,
    }
}
