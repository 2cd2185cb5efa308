//! Filename derivation and sanitization for stored payloads.
//!
//! Stored names are `<short dedup key>-<name><ext>`. The key prefix keeps
//! names unique per task, so no existence probing is needed.

use std::path::{Component, Path};

use url::Url;

use crate::queue::{ExpectedContent, Task};

/// Longest name component kept before the extension.
const MAX_NAME_CHARS: usize = 80;

/// Builds the on-disk filename for a fetched task.
///
/// The name comes from the task label when present, otherwise from the last
/// URL path segment. The extension comes from the URL, then the response
/// Content-Type, then the expected content kind.
#[must_use]
pub fn output_filename(task: &Task, content_type: Option<&str>) -> String {
    let payload = task.payload();
    let url = Url::parse(&payload.url).ok();

    let from_url = url.as_ref().and_then(last_segment);
    let raw_name = payload
        .label
        .as_deref()
        .filter(|l| !l.trim().is_empty())
        .or(from_url.as_deref())
        .unwrap_or("document");

    let url_ext = url.as_ref().and_then(extension_from_url);
    let stem = match &url_ext {
        Some(ext) if payload.label.is_none() => {
            raw_name.strip_suffix(ext.as_str()).unwrap_or(raw_name)
        }
        _ => raw_name,
    };

    let mut stem = sanitize_filename_component(stem);
    if stem.is_empty() {
        stem = "document".to_string();
    }
    let stem: String = stem.chars().take(MAX_NAME_CHARS).collect();

    let extension = url_ext
        .or_else(|| content_type.map(|ct| extension_from_content_type(ct).to_string()))
        .filter(|ext| ext != ".bin")
        .unwrap_or_else(|| extension_for_expected(payload.expected).to_string());

    let filename = format!("{}-{stem}{extension}", task.dedup_key().short());
    sanitize_filename(&filename)
}

fn last_segment(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    let last = segments.next_back()?;
    (!last.is_empty()).then(|| last.to_string())
}

fn extension_for_expected(expected: ExpectedContent) -> &'static str {
    match expected {
        ExpectedContent::Pdf => ".pdf",
        ExpectedContent::Html => ".html",
        ExpectedContent::Any => ".bin",
    }
}

pub(crate) fn extension_from_url(url: &Url) -> Option<String> {
    let last_segment = url.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index..];
    if ext.len() <= 1 || ext.len() > 12 {
        return None;
    }
    Some(ext.to_lowercase())
}

pub(crate) fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\'' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    out.trim_matches('_').to_string()
}

/// Guess file extension from Content-Type header.
pub(crate) fn extension_from_content_type(content_type: &str) -> &'static str {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match mime.as_str() {
        "text/html" | "application/xhtml+xml" => ".html",
        "text/plain" => ".txt",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/pdf" => ".pdf",
        "application/msword" => ".doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
        "application/rtf" | "text/rtf" => ".rtf",
        "application/zip" => ".zip",
        _ => ".bin",
    }
}

/// Sanitizes a filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
