//! Payload validation for fetched documents.
//!
//! Servers fronted by bot protection or flaky storage often answer `200 OK`
//! with an HTML error page, a truncated body, or nothing at all. Validation
//! catches those before a payload is handed to the result sink.

use thiserror::Error;

use crate::queue::ExpectedContent;

/// Magic prefix for PDF documents.
pub const PDF_MAGIC: &[u8] = b"%PDF-";

/// Default minimum body size in bytes.
pub const DEFAULT_MIN_PAYLOAD_BYTES: usize = 64;

/// How far into an HTML body to look for markup.
const HTML_SNIFF_LEN: usize = 1024;

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Body is shorter than the configured minimum.
    #[error("body is {actual} bytes, minimum is {min}")]
    TooSmall {
        /// Observed size.
        actual: usize,
        /// Configured minimum.
        min: usize,
    },

    /// Binary content did not start with the expected magic bytes.
    #[error("missing {expected} signature")]
    MissingMagic {
        /// Expected signature.
        expected: &'static str,
    },

    /// Expected HTML but found no markup.
    #[error("body does not look like HTML")]
    NotHtml,
}

/// Validation settings applied to every successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    /// Minimum accepted body size in bytes.
    pub min_bytes: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_bytes: DEFAULT_MIN_PAYLOAD_BYTES,
        }
    }
}

impl ValidationRules {
    /// Checks `body` against these rules and the expected content type.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] encountered.
    pub fn validate(&self, body: &[u8], expected: ExpectedContent) -> Result<(), ValidationError> {
        if body.len() < self.min_bytes || body.is_empty() {
            return Err(ValidationError::TooSmall {
                actual: body.len(),
                min: self.min_bytes.max(1),
            });
        }

        match expected {
            ExpectedContent::Any => Ok(()),
            ExpectedContent::Pdf => {
                if strip_leading_whitespace(body).starts_with(PDF_MAGIC) {
                    Ok(())
                } else {
                    Err(ValidationError::MissingMagic { expected: "%PDF-" })
                }
            }
            ExpectedContent::Html => {
                if looks_like_html(body) {
                    Ok(())
                } else {
                    Err(ValidationError::NotHtml)
                }
            }
        }
    }
}

fn strip_leading_whitespace(body: &[u8]) -> &[u8] {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    &body[start..]
}

fn looks_like_html(body: &[u8]) -> bool {
    let head = &body[..body.len().min(HTML_SNIFF_LEN)];
    let text = String::from_utf8_lossy(head).to_ascii_lowercase();
    text.contains("<!doctype html") || text.contains("<html") || text.contains("<body")
}
