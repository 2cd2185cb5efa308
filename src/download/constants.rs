//! Constants for the download module (timeouts, limits).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Default cap on a buffered response body (256 MiB).
pub const DEFAULT_MAX_BODY_BYTES: u64 = 256 * 1024 * 1024;
