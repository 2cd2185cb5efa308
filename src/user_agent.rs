//! User-Agent string sent with every fetch.

/// Project URL for User-Agent identification (RFC 9308 good citizenship).
const PROJECT_UA_URL: &str = "https://github.com/fierce/docfetch";

/// Default User-Agent identifying the tool and its version.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("docfetch/{version} (bulk-document-fetcher; +{PROJECT_UA_URL})")
}
