//! Turns free-form input lines into task submissions.
//!
//! Each line may start with a priority word (`supreme_court`, `high_court`,
//! `tribunal`, `other`), followed by a URL and an optional label:
//!
//! ```text
//! high_court https://court.example/judgments/123.pdf State v. Rao
//! https://tribunal.example/orders?id=9
//! ```

use std::sync::LazyLock;

use docfetch_core::queue::{Priority, TaskPayload};
use regex::Regex;
use tracing::{debug, trace};
use url::Url;

#[allow(clippy::expect_used)]
static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // Static pattern, safe to panic
    Regex::new(r#"https?://[^\s<>"'\]]+"#).expect("URL regex is valid")
});

/// One submission parsed from input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputItem {
    pub payload: TaskPayload,
    /// Priority written on the line, if any.
    pub priority: Option<Priority>,
}

/// Parse outcome: accepted items plus the lines that held no usable URL.
#[derive(Debug, Default)]
pub struct ParsedInput {
    pub items: Vec<InputItem>,
    pub skipped: Vec<String>,
}

/// Parses every non-blank, non-comment line of `text`.
#[tracing::instrument(skip(text), fields(input_len = text.len()))]
pub fn parse_lines(text: &str) -> ParsedInput {
    let mut parsed = ParsedInput::default();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some(item) => {
                trace!(url = %item.payload.url, "parsed input line");
                parsed.items.push(item);
            }
            None => {
                debug!(line, "no URL on input line");
                parsed.skipped.push(line.to_string());
            }
        }
    }
    parsed
}

fn parse_line(line: &str) -> Option<InputItem> {
    let found = URL_PATTERN.find(line)?;
    let url = clean_url_trailing(found.as_str());
    Url::parse(url).ok()?;

    let priority = line[..found.start()]
        .split_whitespace()
        .next()
        .and_then(|word| word.trim_end_matches(':').parse::<Priority>().ok());

    let label = line[found.end()..].trim();
    let mut payload = TaskPayload::new(url);
    if !label.is_empty() {
        payload = payload.with_label(label);
    }
    Some(InputItem { payload, priority })
}

fn clean_url_trailing(url: &str) -> &str {
    let mut result = url;
    while let Some(last) = result.chars().last() {
        let strip = match last {
            '.' | ',' | ';' | ':' | '!' | '?' => true,
            ')' => result.matches('(').count() < result.matches(')').count(),
            _ => false,
        };
        if !strip {
            break;
        }
        result = &result[..result.len() - last.len_utf8()];
    }
    result
}
