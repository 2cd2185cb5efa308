//! Fetching one document: rate limiting, retries, proxies, validation.
//!
//! This module provides the pieces a worker uses to execute a task:
//!
//! - [`RateLimiter`] - global token bucket, one token per attempt
//! - [`Fetcher`] / [`HttpFetcher`] - pluggable fetch primitive
//! - [`RetryPolicy`] - exponential backoff with jitter for transient failures
//! - [`ValidationRules`] - minimum size and magic-byte checks on payloads
//! - [`Downloader`] - ties them together and yields a [`DownloadResult`]
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
//!     Arc::new(RateLimiter::new(10, 10.0)),
//!     RetryPolicy::default(),
//! );
//! let task = Task::new(TaskPayload::new("https://example.com/paper.pdf"), Priority::Other);
//! let result = downloader.execute(&task).await;
//! assert!(result.attempts >= 1);
//! # }
//! ```

mod client;
mod constants;
mod engine;
mod error;
mod filename;
pub mod rate_limiter;
mod retry;
mod validation;

pub use client::{FetchRequest, FetchResponse, Fetcher, HttpFetcher};
pub use engine::{DownloadResult, Downloader, ProxyMode};
pub use error::{DownloadError, ErrorKind};
pub use filename::output_filename;
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use validation::{DEFAULT_MIN_PAYLOAD_BYTES, PDF_MAGIC, ValidationError, ValidationRules};
