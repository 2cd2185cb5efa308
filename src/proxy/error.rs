//! Error types for proxy pool operations.

use thiserror::Error;

/// Errors raised by the proxy pool and provider.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No active proxy is eligible for selection.
    #[error("no active proxies available")]
    Exhausted,

    /// A proxy address could not be parsed.
    #[error("invalid proxy address '{input}': {reason}")]
    InvalidAddress { input: String, reason: String },

    /// The provider request failed at the transport level.
    #[error("proxy provider request to {url} failed: {message}")]
    Provider { url: String, message: String },

    /// The provider answered with a non-success status.
    #[error("proxy provider {url} returned HTTP {status}")]
    ProviderStatus { url: String, status: u16 },

    /// The proxy id does not belong to this pool.
    #[error("unknown proxy {id}")]
    UnknownProxy { id: String },

    /// Reading a proxy list file failed.
    #[error("failed to read proxy list {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProxyError {
    pub fn invalid_address(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn provider(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Provider {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn unknown(id: impl Into<String>) -> Self {
        Self::UnknownProxy { id: id.into() }
    }
}
