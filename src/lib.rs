//! docfetch core library
//!
//! Concurrent, resumable bulk document fetching: tasks are queued by
//! priority and deduplicated, a pool of workers fetches them under a global
//! rate limit (optionally through rotating proxies), and progress is
//! checkpointed so an interrupted job can pick up where it left off.
//!
//! # Architecture
//!
//! - [`queue`] - priority-ordered, deduplicating task queue
//! - [`download`] - token-bucket rate limiter, fetcher, retries, validation
//! - [`proxy`] - proxy pool with health tracking and rotation strategies
//! - [`checkpoint`] - atomic, validated progress snapshots (file or SQLite)
//! - [`orchestrator`] - worker pool, statistics and graceful shutdown
//! - [`db`] - SQLite connection used by the checkpoint store

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod db;
pub mod download;
pub mod orchestrator;
pub mod proxy;
pub mod queue;
mod user_agent;

// Re-export commonly used types
pub use checkpoint::{CheckpointError, CheckpointRecord, CheckpointStatus, CheckpointStore};
pub use db::Database;
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, DownloadResult, Downloader, ErrorKind, Fetcher,
    HttpFetcher, ProxyMode, RateLimiter, RetryPolicy,
};
pub use orchestrator::{JobStatistics, Orchestrator, OrchestratorConfig, OrchestratorError};
pub use proxy::{ProxyEndpoint, ProxyError, ProxyPool, RotationStrategy};
pub use queue::{DedupKey, Priority, Task, TaskPayload, TaskQueue};
