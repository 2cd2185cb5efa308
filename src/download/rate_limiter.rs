//! Token-bucket rate limiting shared by every worker.
//!
//! This module provides the [`RateLimiter`] struct which caps the global
//! request rate of a job. The bucket holds up to `capacity` tokens and refills
//! continuously at `refill_rate` tokens per second; each fetch attempt
//! consumes one token.
//!
//! Refill and consume happen as one step under the limiter's guard. The guard
//! is released before sleeping, so waiting workers never block each other.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use docfetch_core::download::RateLimiter;
//!
//! # async fn example() {
//! // Bursts of 5, sustained 10 requests per second
//! let limiter = Arc::new(RateLimiter::new(5, 10.0));
//!
//! // First five proceed immediately, the rest are paced
//! for _ in 0..8 {
//!     limiter.acquire(1).await;
//! }
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use super::constants::MAX_RETRY_AFTER;

/// Smallest accepted refill rate (tokens per second).
const MIN_REFILL_RATE: f64 = 0.001;

/// Floor on a single wait so rounding never produces a busy loop.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Upper bound on a single computed wait.
const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Slack for floating point accumulation when comparing token counts.
const EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Consumes `n` tokens if available, otherwise returns how long until they are.
    fn try_consume(&mut self, n: f64) -> Result<(), Duration> {
        if self.tokens + EPSILON >= n {
            self.tokens = (self.tokens - n).max(0.0);
            return Ok(());
        }
        let deficit = n - self.tokens;
        let wait = Duration::try_from_secs_f64(deficit / self.refill_rate).unwrap_or(MAX_WAIT);
        Err(wait.max(MIN_WAIT))
    }
}

/// Global token-bucket rate limiter.
///
/// Designed to be wrapped in `Arc` and shared across worker tasks. The bucket
/// state sits behind a `std::sync::Mutex` that is only held for the
/// refill-and-consume arithmetic.
///
/// # Usage Pattern
///
/// ```no_run
/// use std::sync::Arc;
/// use docfetch_core::download::RateLimiter;
///
/// # async fn example() {
/// let rate_limiter = Arc::new(RateLimiter::new(10, 2.0));
///
/// let limiter = Arc::clone(&rate_limiter);
/// tokio::spawn(async move {
///     limiter.acquire(1).await;
///     // ... fetch
/// });
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    /// Whether rate limiting is disabled (for `--rate 0`).
    disabled: bool,

    bucket: Mutex<TokenBucket>,

    /// Total tokens handed out since creation.
    tokens_consumed: AtomicU64,
}

impl RateLimiter {
    /// Creates a full bucket with `capacity` tokens refilling at
    /// `refill_per_sec` tokens per second.
    ///
    /// Capacity is clamped to at least 1 and the rate to at least 0.001.
    #[must_use]
    #[instrument]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        let refill_rate = if refill_per_sec.is_finite() {
            refill_per_sec.max(MIN_REFILL_RATE)
        } else {
            MIN_REFILL_RATE
        };
        debug!(capacity, refill_rate, "creating rate limiter");
        Self {
            disabled: false,
            bucket: Mutex::new(TokenBucket {
                capacity,
                tokens: capacity,
                refill_rate,
                last_refill: Instant::now(),
            }),
            tokens_consumed: AtomicU64::new(0),
        }
    }

    /// Creates a disabled rate limiter that never waits.
    ///
    /// # Example
    ///
    /// ```
    /// use docfetch_core::download::RateLimiter;
    ///
    /// let limiter = RateLimiter::disabled();
    /// assert!(limiter.is_disabled());
    /// ```
    #[must_use]
    #[instrument]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        let mut limiter = Self::new(1, 1.0);
        limiter.disabled = true;
        limiter
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Bucket capacity in tokens.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn capacity(&self) -> u32 {
        self.lock().capacity as u32
    }

    /// Refill rate in tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.lock().refill_rate
    }

    /// Tokens currently in the bucket after a lazy refill.
    #[must_use]
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    /// Total tokens consumed since creation.
    #[must_use]
    pub fn tokens_consumed(&self) -> u64 {
        self.tokens_consumed.load(Ordering::Relaxed)
    }

    fn clamp_request(&self, n: u32) -> u32 {
        let capacity = self.capacity();
        if n > capacity {
            warn!(
                requested = n,
                capacity, "token request exceeds bucket capacity, clamping"
            );
            capacity
        } else {
            n
        }
    }

    /// Waits until `n` tokens are available and consumes them.
    ///
    /// `n == 0` returns immediately. Requests above capacity are clamped to
    /// capacity, since they could otherwise never be satisfied.
    #[instrument(skip(self))]
    pub async fn acquire(&self, n: u32) {
        if self.disabled || n == 0 {
            return;
        }
        let n = self.clamp_request(n);
        let wanted = f64::from(n);

        loop {
            let wait = {
                let mut bucket = self.lock();
                bucket.refill(Instant::now());
                match bucket.try_consume(wanted) {
                    Ok(()) => None,
                    Err(wait) => Some(wait),
                }
            };

            match wait {
                None => {
                    self.tokens_consumed.fetch_add(u64::from(n), Ordering::Relaxed);
                    trace!(tokens = n, "tokens acquired");
                    return;
                }
                Some(wait) => {
                    trace!(wait_ms = wait.as_millis(), "waiting for tokens");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Consumes `n` tokens if they are available right now.
    pub fn try_acquire(&self, n: u32) -> bool {
        if self.disabled || n == 0 {
            return true;
        }
        let n = self.clamp_request(n);
        let acquired = {
            let mut bucket = self.lock();
            bucket.refill(Instant::now());
            bucket.try_consume(f64::from(n)).is_ok()
        };
        if acquired {
            self.tokens_consumed.fetch_add(u64::from(n), Ordering::Relaxed);
        }
        acquired
    }

    /// Refills the bucket to capacity.
    pub fn reset(&self) {
        let mut bucket = self.lock();
        bucket.tokens = bucket.capacity;
        bucket.last_refill = Instant::now();
        debug!("rate limiter reset");
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use docfetch_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();

        if let Ok(duration) = datetime.duration_since(now) {
            if duration > MAX_RETRY_AFTER {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                return Some(MAX_RETRY_AFTER);
            }
            Some(duration)
        } else {
            debug!(header_value, "Retry-After date is in the past, returning zero");
            Some(Duration::ZERO)
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}
