//! Paginated proxy provider client and static list parsing.
//!
//! The provider returns pages of the form
//! `{"results": [{"proxy_address", "port", "username", "password", ...}], "next": url | null}`
//! and authenticates with an `Authorization: Token <key>` header.

use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::error::ProxyError;
use super::record::{ProxyEndpoint, ProxyProtocol};
use crate::user_agent;

/// Upper bound on pages fetched from a provider, against `next` loops.
pub const MAX_PROVIDER_PAGES: usize = 100;

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ProviderPage {
    #[serde(default)]
    results: Vec<ProviderEntry>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderEntry {
    proxy_address: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    protocol: Option<String>,
    valid: Option<bool>,
}

impl ProviderEntry {
    /// Converts to an endpoint, or `None` for entries that are unusable.
    fn into_endpoint(self) -> Option<ProxyEndpoint> {
        if self.valid == Some(false) {
            return None;
        }
        let host = self.proxy_address.filter(|h| !h.trim().is_empty())?;
        let port = self.port.filter(|p| *p != 0)?;
        let protocol = match self.protocol.as_deref() {
            Some(raw) => ProxyProtocol::from_str(raw).ok()?,
            None => ProxyProtocol::Http,
        };

        let mut endpoint = ProxyEndpoint::new(host.trim(), port, protocol);
        if let Some(username) = self.username.filter(|u| !u.is_empty()) {
            endpoint = endpoint.with_credentials(username, self.password.unwrap_or_default());
        }
        Some(endpoint)
    }
}

/// Client for a paginated proxy list API.
pub struct ProxyProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for ProxyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl ProxyProvider {
    /// Creates a provider client for `base_url` (the first page).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Provider`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProxyError> {
        let base_url = base_url.into();
        let client = Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .user_agent(user_agent::default_user_agent())
            .build()
            .map_err(|e| ProxyError::provider(&base_url, e))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Follows `next` links until exhausted or [`MAX_PROVIDER_PAGES`] pages.
    /// Entries that are marked invalid or lack an address are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Provider`] for transport or JSON failures and
    /// [`ProxyError::ProviderStatus`] for non-success responses.
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn fetch_all(&self) -> Result<Vec<ProxyEndpoint>, ProxyError> {
        let mut endpoints = Vec::new();
        let mut skipped = 0usize;
        let mut next = Some(self.base_url.clone());
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages >= MAX_PROVIDER_PAGES {
                warn!(pages, "provider page limit reached, stopping");
                break;
            }
            pages += 1;

            let page = self.fetch_page(&url).await?;
            debug!(page = pages, entries = page.results.len(), "provider page fetched");

            for entry in page.results {
                match entry.into_endpoint() {
                    Some(endpoint) => endpoints.push(endpoint),
                    None => skipped += 1,
                }
            }
            next = page.next.filter(|n| !n.is_empty());
        }

        info!(proxies = endpoints.len(), skipped, pages, "proxy provider loaded");
        Ok(endpoints)
    }

    async fn fetch_page(&self, url: &str) -> Result<ProviderPage, ProxyError> {
        let response = self
            .client
            .get(url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Token {}", self.api_key),
            )
            .send()
            .await
            .map_err(|e| ProxyError::provider(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::ProviderStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<ProviderPage>()
            .await
            .map_err(|e| ProxyError::provider(url, e))
    }
}

/// Parses a newline-separated proxy list. Blank lines and `#` comments are ignored.
///
/// # Errors
///
/// Returns [`ProxyError::InvalidAddress`] for the first malformed entry.
pub fn parse_proxy_list(text: &str) -> Result<Vec<ProxyEndpoint>, ProxyError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ProxyEndpoint::parse)
        .collect()
}
