//! HTTP fetch primitive.
//!
//! The downloader never talks to `reqwest` directly. It goes through the
//! [`Fetcher`] trait so tests and embedders can substitute their own transport.
//! [`HttpFetcher`] is the production implementation: it buffers the body with
//! a size cap and keeps one pooled `reqwest::Client` per outbound proxy.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Proxy};
use tracing::{debug, instrument, trace};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_MAX_BODY_BYTES, READ_TIMEOUT_SECS};
use super::error::DownloadError;
use crate::proxy::ProxyEndpoint;
use crate::user_agent;

/// Cache key for the client that connects without a proxy.
const DIRECT_KEY: &str = "direct";

/// One outbound request.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub url: &'a str,
    /// Route through this proxy, or connect directly when `None`.
    pub proxy: Option<&'a ProxyEndpoint>,
}

impl<'a> FetchRequest<'a> {
    #[must_use]
    pub fn direct(url: &'a str) -> Self {
        Self { url, proxy: None }
    }

    #[must_use]
    pub fn via(url: &'a str, proxy: &'a ProxyEndpoint) -> Self {
        Self {
            url,
            proxy: Some(proxy),
        }
    }
}

/// A completed HTTP exchange, whatever its status.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    /// Raw `Retry-After` header value.
    pub retry_after: Option<String>,
}

impl FetchResponse {
    /// Convenience constructor used by custom fetchers and tests.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Pluggable fetch primitive.
///
/// Implementations return `Ok` for any HTTP response, including error
/// statuses, and `Err` only when no response was obtained.
#[async_trait]
pub trait Fetcher: Send + Sync + std::fmt::Debug {
    /// Performs one request.
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchResponse, DownloadError>;
}

/// `reqwest`-backed fetcher with a per-proxy client cache.
///
/// This fetcher is designed to be created once and shared, taking advantage of
/// each client's connection pool.
///
/// # Example
///
/// ```no_run
/// use docfetch_core::download::{FetchRequest, Fetcher, HttpFetcher};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = HttpFetcher::new();
/// let response = fetcher.fetch(FetchRequest::direct("https://example.com/a.pdf")).await?;
/// println!("HTTP {} with {} bytes", response.status, response.body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HttpFetcher {
    clients: DashMap<String, Client>,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_body_bytes: u64,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    /// Creates a fetcher with default timeouts.
    ///
    /// Default configuration:
    /// - Connect timeout: 30 seconds
    /// - Read timeout: 5 minutes (for large files)
    /// - Body cap: 256 MiB
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    #[must_use]
    pub fn with_timeouts(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout,
            read_timeout,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Replaces the response body cap.
    #[must_use]
    pub fn with_max_body_bytes(mut self, max_body_bytes: u64) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Number of distinct clients built so far (one per proxy plus direct).
    #[must_use]
    pub fn cached_clients(&self) -> usize {
        self.clients.len()
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, DownloadError> {
        let key = proxy.map_or_else(|| DIRECT_KEY.to_string(), ProxyEndpoint::url);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent());
        if let Some(endpoint) = proxy {
            let resolved = Proxy::all(endpoint.url())
                .map_err(|e| DownloadError::proxy(endpoint.id(), e.to_string()))?;
            builder = builder.proxy(resolved);
            debug!(proxy = %endpoint, "building proxied HTTP client");
        }
        let client = builder.build().map_err(|e| match proxy {
            Some(endpoint) => DownloadError::proxy(endpoint.id(), e.to_string()),
            None => DownloadError::network(DIRECT_KEY, e.to_string()),
        })?;

        // Racing builders may both insert; either client is equivalent.
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(
        skip(self, request),
        fields(url = %request.url, proxy = ?request.proxy.map(ProxyEndpoint::id))
    )]
    async fn fetch(&self, request: FetchRequest<'_>) -> Result<FetchResponse, DownloadError> {
        let url = request.url;
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let client = self.client_for(request.proxy)?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, request.proxy, &e))?;

        let status = response.status().as_u16();
        let content_type = header_string(&response, CONTENT_TYPE.as_str());
        let retry_after = header_string(&response, RETRY_AFTER.as_str());

        if !response.status().is_success() {
            trace!(status, "non-success status, skipping body");
            return Ok(FetchResponse {
                status,
                body: Vec::new(),
                content_type,
                retry_after,
            });
        }

        if let Some(length) = header_string(&response, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse::<u64>().ok())
            && length > self.max_body_bytes
        {
            return Err(DownloadError::body_too_large(url, self.max_body_bytes));
        }

        let body = read_body(response, url, request.proxy, self.max_body_bytes).await?;
        debug!(status, bytes = body.len(), "fetch complete");

        Ok(FetchResponse {
            status,
            body,
            content_type,
            retry_after,
        })
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(std::string::ToString::to_string)
}

/// Buffers the body stream, failing once it passes `limit`.
async fn read_body(
    response: reqwest::Response,
    url: &str,
    proxy: Option<&ProxyEndpoint>,
    limit: u64,
) -> Result<Vec<u8>, DownloadError> {
    let mut stream = response.bytes_stream();
    let mut body = Vec::new();

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| map_reqwest_error(url, proxy, &e))?;
        if body.len() as u64 + chunk.len() as u64 > limit {
            return Err(DownloadError::body_too_large(url, limit));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

/// Translates a transport error into the download taxonomy.
fn map_reqwest_error(
    url: &str,
    proxy: Option<&ProxyEndpoint>,
    error: &reqwest::Error,
) -> DownloadError {
    if error.is_timeout() {
        return DownloadError::timeout(url);
    }
    if has_io_kind(error, &[io::ErrorKind::ConnectionReset, io::ErrorKind::ConnectionAborted]) {
        return DownloadError::connection_reset(url);
    }

    let message = error_chain(error);
    if looks_like_tls(&message) {
        return DownloadError::tls(url, message);
    }
    if error.is_connect()
        && let Some(endpoint) = proxy
    {
        return DownloadError::proxy(endpoint.id(), message);
    }
    DownloadError::network(url, message)
}

fn has_io_kind(error: &reqwest::Error, kinds: &[io::ErrorKind]) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>()
            && kinds.contains(&io_err.kind())
        {
            return true;
        }
        source = err.source();
    }
    false
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

fn looks_like_tls(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("certificate")
        || lower.contains("tls handshake")
        || lower.contains("invalid peer")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_success_returns_body_and_content_type() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "application/pdf")
                    .set_body_bytes(b"%PDF-1.7 content".to_vec()),
            )
            .mount(&mock_server)
            .await;

        let fetcher = HttpFetcher::new();
        let url = format!("{}/doc.pdf", mock_server.uri());
        let response = fetcher.fetch(FetchRequest::direct(&url)).await.unwrap();

        assert_eq!(response.status, 200);
        assert!(response.is_success());
        assert_eq!(response.body, b"%PDF-1.7 content");
        assert_eq!(response.content_type.as_deref(), Some("application/pdf"));
    }

    #[tokio::test]
    async fn test_fetch_error_status_is_ok_with_retry_after() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&mock_server)
            .await;

        let fetcher = HttpFetcher::new();
        let url = format!("{}/busy", mock_server.uri());
        let response = fetcher.fetch(FetchRequest::direct(&url)).await.unwrap();

        assert_eq!(response.status, 429);
        assert!(!response.is_success());
        assert_eq!(response.retry_after.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_fetch_invalid_url() {
        let fetcher = HttpFetcher::new();
        let result = fetcher.fetch(FetchRequest::direct("not a url")).await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_fetch_enforces_body_cap() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 4096]))
            .mount(&mock_server)
            .await;

        let fetcher = HttpFetcher::new().with_max_body_bytes(1024);
        let url = format!("{}/big", mock_server.uri());
        let result = fetcher.fetch(FetchRequest::direct(&url)).await;
        assert!(matches!(result, Err(DownloadError::BodyTooLarge { limit: 1024, .. })));
    }

    #[tokio::test]
    async fn test_fetch_read_timeout_maps_to_timeout() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&mock_server)
            .await;

        let fetcher =
            HttpFetcher::with_timeouts(Duration::from_secs(1), Duration::from_millis(200));
        let url = format!("{}/slow", mock_server.uri());
        let result = fetcher.fetch(FetchRequest::direct(&url)).await;
        assert!(matches!(result, Err(DownloadError::Timeout { .. })), "got {result:?}");
    }

    #[test]
    fn test_client_cache_is_per_proxy() {
        let fetcher = HttpFetcher::new();
        let a = ProxyEndpoint::parse("127.0.0.1:9001").unwrap();
        let b = ProxyEndpoint::parse("127.0.0.1:9002").unwrap();

        fetcher.client_for(None).unwrap();
        fetcher.client_for(Some(&a)).unwrap();
        fetcher.client_for(Some(&a)).unwrap();
        fetcher.client_for(Some(&b)).unwrap();

        assert_eq!(fetcher.cached_clients(), 3);
    }

    #[test]
    fn test_looks_like_tls() {
        assert!(looks_like_tls("invalid peer certificate: UnknownIssuer"));
        assert!(!looks_like_tls("connection refused"));
    }
}
