//! Error types for the download module.
//!
//! [`DownloadError`] carries the context of one failed attempt. The worker loop
//! never matches on it directly; it matches on the closed [`ErrorKind`] set
//! returned by [`DownloadError::kind`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::validation::ValidationError;

/// Closed set of failure kinds the orchestrator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, connection resets, 5xx. Retried, then counted as a failure.
    Transient,
    /// 4xx (other than rate limiting) or an invalid payload. Never retried blindly.
    Permanent,
    /// No active proxy remains in the pool.
    ProxyExhausted,
    /// A persisted checkpoint could not be trusted.
    CheckpointCorrupt,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::ProxyExhausted => "proxy_exhausted",
            Self::CheckpointCorrupt => "checkpoint_corrupt",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur while fetching a single document.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The peer reset or aborted the connection mid-request.
    #[error("connection reset fetching {url}")]
    ConnectionReset {
        /// The URL being fetched.
        url: String,
    },

    /// Other network-level failure (DNS, refused connection, broken body stream).
    #[error("network error fetching {url}: {message}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// Description of the underlying failure.
        message: String,
    },

    /// TLS handshake or certificate failure.
    #[error("TLS error fetching {url}: {message}")]
    Tls {
        /// The URL being fetched.
        url: String,
        /// Description of the underlying failure.
        message: String,
    },

    /// The outbound proxy refused or failed the connection.
    #[error("proxy {proxy} failed: {message}")]
    Proxy {
        /// Proxy identifier (`host:port`).
        proxy: String,
        /// Description of the underlying failure.
        message: String,
    },

    /// Non-success HTTP response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// The provided URL is malformed or unsupported.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Response body exceeded the configured size cap.
    #[error("response from {url} exceeds {limit} bytes")]
    BodyTooLarge {
        /// The URL being fetched.
        url: String,
        /// Configured cap in bytes.
        limit: u64,
    },

    /// The body arrived but failed payload validation.
    #[error("invalid payload from {url}: {reason}")]
    InvalidPayload {
        /// The URL being fetched.
        url: String,
        /// Why validation failed.
        #[source]
        reason: ValidationError,
    },

    /// Proxying is required but every proxy is inactive.
    #[error("no active proxies remain")]
    ProxyExhausted,
}

impl DownloadError {
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn connection_reset(url: impl Into<String>) -> Self {
        Self::ConnectionReset { url: url.into() }
    }

    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn tls(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tls {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn proxy(proxy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Proxy {
            proxy: proxy.into(),
            message: message.into(),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn body_too_large(url: impl Into<String>, limit: u64) -> Self {
        Self::BodyTooLarge {
            url: url.into(),
            limit,
        }
    }

    pub fn invalid_payload(url: impl Into<String>, reason: ValidationError) -> Self {
        Self::InvalidPayload {
            url: url.into(),
            reason,
        }
    }

    /// Returns the HTTP status when the failure was a status response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Maps this error onto the closed [`ErrorKind`] set.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match super::retry::classify_error(self) {
            super::FailureType::Transient | super::FailureType::RateLimited => {
                ErrorKind::Transient
            }
            super::FailureType::Permanent | super::FailureType::InvalidPayload => {
                ErrorKind::Permanent
            }
            super::FailureType::ProxyExhausted => ErrorKind::ProxyExhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/file.pdf");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/file.pdf"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/file.pdf", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("https://example.com/file.pdf"));
        assert_eq!(error.status(), Some(404));
    }

    #[test]
    fn test_download_error_invalid_payload_display() {
        let error = DownloadError::invalid_payload(
            "https://example.com/a.pdf",
            ValidationError::TooSmall { actual: 3, min: 64 },
        );
        let msg = error.to_string();
        assert!(msg.contains("invalid payload"), "got: {msg}");
    }

    #[test]
    fn test_kind_maps_failures() {
        assert_eq!(
            DownloadError::timeout("https://a.test").kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            DownloadError::http_status("https://a.test", 503).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            DownloadError::http_status("https://a.test", 429).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            DownloadError::http_status("https://a.test", 404).kind(),
            ErrorKind::Permanent
        );
        assert_eq!(
            DownloadError::invalid_payload(
                "https://a.test",
                ValidationError::MissingMagic { expected: "%PDF-" }
            )
            .kind(),
            ErrorKind::Permanent
        );
        assert_eq!(DownloadError::ProxyExhausted.kind(), ErrorKind::ProxyExhausted);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::CheckpointCorrupt.to_string(), "checkpoint_corrupt");
        assert_eq!(ErrorKind::ProxyExhausted.as_str(), "proxy_exhausted");
    }
}
