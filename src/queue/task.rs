//! Task types, priorities and dedup key derivation.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Number of priority tiers.
pub const PRIORITY_TIERS: usize = 4;

/// Task priority. Lower variants are more urgent and always served first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Apex court documents.
    SupremeCourt,
    /// High court documents.
    HighCourt,
    /// Tribunal documents.
    Tribunal,
    /// Everything else.
    #[default]
    Other,
}

impl Priority {
    /// All tiers in service order.
    pub const ALL: [Self; PRIORITY_TIERS] = [
        Self::SupremeCourt,
        Self::HighCourt,
        Self::Tribunal,
        Self::Other,
    ];

    /// Returns the stable string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SupremeCourt => "supreme_court",
            Self::HighCourt => "high_court",
            Self::Tribunal => "tribunal",
            Self::Other => "other",
        }
    }

    /// Returns the tier index (0 = most urgent).
    #[must_use]
    pub fn tier(self) -> usize {
        match self {
            Self::SupremeCourt => 0,
            Self::HighCourt => 1,
            Self::Tribunal => 2,
            Self::Other => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "supreme_court" | "supreme" => Ok(Self::SupremeCourt),
            "high_court" | "high" => Ok(Self::HighCourt),
            "tribunal" => Ok(Self::Tribunal),
            "other" => Ok(Self::Other),
            _ => Err(format!("invalid priority: {s}")),
        }
    }
}

/// Content type a task is expected to return, used for payload validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedContent {
    /// Accept any non-empty body.
    #[default]
    Any,
    /// Body must start with the PDF magic bytes.
    Pdf,
    /// Body must look like an HTML document.
    Html,
}

impl ExpectedContent {
    /// Infers the expected content from a URL's path extension.
    #[must_use]
    pub fn infer_from_url(url: &str) -> Self {
        let path = Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());
        if path.ends_with(".pdf") {
            Self::Pdf
        } else if path.ends_with(".html") || path.ends_with(".htm") {
            Self::Html
        } else {
            Self::Any
        }
    }
}

impl FromStr for ExpectedContent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "pdf" => Ok(Self::Pdf),
            "html" => Ok(Self::Html),
            _ => Err(format!("invalid expected content: {s}")),
        }
    }
}

/// Stable identifier for a logical task: hex SHA-256 of the canonical URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Derives the key for a URL.
    #[must_use]
    pub fn for_url(url: &str) -> Self {
        let canonical = canonicalize_url(url);
        let digest = Sha256::digest(canonical.as_bytes());
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    /// Wraps an already-derived key, e.g. one restored from a checkpoint.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the full hex key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a 12-character prefix suitable for filenames and log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short())
    }
}

/// Canonical form of a URL used for deduplication.
///
/// Scheme and host are lowercased and default ports dropped (the `url` crate
/// normalizes both), the fragment is removed and a trailing slash on a
/// non-root path is stripped. Unparseable input is returned trimmed.
#[must_use]
pub fn canonicalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }
    url.to_string()
}

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPayload {
    /// Document URL.
    pub url: String,
    /// Optional caller label (case number, citation, ...).
    pub label: Option<String>,
    /// Expected content type for validation.
    pub expected: ExpectedContent,
}

impl TaskPayload {
    /// Creates a payload, inferring the expected content from the URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let expected = ExpectedContent::infer_from_url(&url);
        Self {
            url,
            label: None,
            expected,
        }
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_expected(mut self, expected: ExpectedContent) -> Self {
        self.expected = expected;
        self
    }
}

/// A unit of work owned by the queue while pending and by a worker while in flight.
#[derive(Debug, Clone)]
pub struct Task {
    priority: Priority,
    enqueued_at: Instant,
    sequence: u64,
    dedup_key: DedupKey,
    payload: TaskPayload,
}

impl Task {
    /// Creates a task; the dedup key is derived from the payload URL.
    #[must_use]
    pub fn new(payload: TaskPayload, priority: Priority) -> Self {
        Self {
            priority,
            enqueued_at: Instant::now(),
            sequence: 0,
            dedup_key: DedupKey::for_url(&payload.url),
            payload,
        }
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[must_use]
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Queue-assigned admission sequence number (0 until accepted).
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn dedup_key(&self) -> &DedupKey {
        &self.dedup_key
    }

    #[must_use]
    pub fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.payload.url
    }

    pub(crate) fn admit(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.enqueued_at = Instant::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_orders_most_urgent_first() {
        assert!(Priority::SupremeCourt < Priority::HighCourt);
        assert!(Priority::HighCourt < Priority::Tribunal);
        assert!(Priority::Tribunal < Priority::Other);
        assert_eq!(Priority::default(), Priority::Other);
    }

    #[test]
    fn test_priority_from_str_accepts_variants() {
        assert_eq!("supreme_court".parse::<Priority>().unwrap(), Priority::SupremeCourt);
        assert_eq!("High-Court".parse::<Priority>().unwrap(), Priority::HighCourt);
        assert_eq!("TRIBUNAL".parse::<Priority>().unwrap(), Priority::Tribunal);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_priority_tier_matches_all_order() {
        for (index, priority) in Priority::ALL.iter().enumerate() {
            assert_eq!(priority.tier(), index);
        }
    }

    #[test]
    fn test_canonicalize_url_normalizes_host_and_fragment() {
        assert_eq!(
            canonicalize_url("HTTPS://Example.COM:443/doc.pdf#page=2"),
            "https://example.com/doc.pdf"
        );
    }

    #[test]
    fn test_canonicalize_url_strips_trailing_slash() {
        assert_eq!(
            canonicalize_url("https://example.com/judgments/"),
            "https://example.com/judgments"
        );
        assert_eq!(canonicalize_url("https://example.com/"), "https://example.com/");
    }

    #[test]
    fn test_canonicalize_url_keeps_unparseable_input() {
        assert_eq!(canonicalize_url("  not a url "), "not a url");
    }

    #[test]
    fn test_dedup_key_stable_across_equivalent_urls() {
        let a = DedupKey::for_url("https://example.com/a.pdf");
        let b = DedupKey::for_url("https://EXAMPLE.com/a.pdf#x");
        let c = DedupKey::for_url("https://example.com/b.pdf");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.short().len(), 12);
    }

    #[test]
    fn test_expected_content_inferred_from_extension() {
        assert_eq!(
            ExpectedContent::infer_from_url("https://example.com/x/Order.PDF"),
            ExpectedContent::Pdf
        );
        assert_eq!(
            ExpectedContent::infer_from_url("https://example.com/index.html?q=1"),
            ExpectedContent::Html
        );
        assert_eq!(
            ExpectedContent::infer_from_url("https://example.com/case/42"),
            ExpectedContent::Any
        );
    }

    #[test]
    fn test_task_new_derives_key_from_url() {
        let task = Task::new(TaskPayload::new("https://example.com/a.pdf"), Priority::Tribunal);
        assert_eq!(task.dedup_key(), &DedupKey::for_url("https://example.com/a.pdf"));
        assert_eq!(task.priority(), Priority::Tribunal);
        assert_eq!(task.sequence(), 0);
        assert_eq!(task.payload().expected, ExpectedContent::Pdf);
    }
}
