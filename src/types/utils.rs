//! Shared utility functions: token estimation, fingerprints, text cleanup.

use regex::Regex;
use serde::Serialize;
use std::fmt::Display;
use std::sync::LazyLock;

use crate::constants::scheduler::CHARS_PER_TOKEN;

/// Serialize an enum to its serde string representation (without quotes).
pub fn enum_to_str<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_default()
        .trim_matches('"')
        .to_string()
}

/// Filter an iterator of Results, logging errors at debug level before discarding.
pub fn log_filter_error<T, E: Display>(result: Result<T, E>, context: &str) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!("{}: {}", context, e);
            None
        }
    }
}

/// Like log_filter_error but logs at warn level for more important operations.
pub fn log_filter_warn<T, E: Display>(result: Result<T, E>, context: &str) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("{}: {}", context, e);
            None
        }
    }
}

// =============================================================================
// Token Estimation
// =============================================================================

/// Estimated token count (content length / 4, rounded up)
#[inline]
pub fn estimate_tokens(content: &str) -> usize {
    content.len().div_ceil(CHARS_PER_TOKEN)
}

/// Truncate content to fit within token limit
///
/// Breaks at a paragraph boundary when possible, then a line boundary.
pub fn truncate_to_token_limit(content: &str, max_tokens: usize) -> String {
    let max_bytes = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    if content.len() <= max_bytes {
        return content.to_string();
    }

    let mut cut = max_bytes;
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncated = &content[..cut];

    let end = truncated
        .rfind("\n\n")
        .or_else(|| truncated.rfind('\n'))
        .filter(|pos| *pos > cut / 2)
        .unwrap_or(cut);

    format!("{}\n[truncated]", content[..end].trim_end())
}

// =============================================================================
// Content Fingerprint
// =============================================================================

/// Fast non-cryptographic fingerprint used for change detection
pub fn content_fingerprint(content: &str) -> String {
    format!("{:08x}", crc32fast::hash(content.as_bytes()))
}

// =============================================================================
// HTML Cleanup
// =============================================================================

static BLOCK_TAGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head)[^>]*>.*?</(script|style|head)>")
        .expect("valid regex")
});
static BREAK_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(br|/p|/div|/li|/tr|/h[1-6])[^>]*>").expect("valid regex"));
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").expect("valid regex"));
static BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("valid regex"));

/// Reduce an HTML body to readable plain text
pub fn html_to_text(html: &str) -> String {
    let text = BLOCK_TAGS.replace_all(html, "");
    let text = BREAK_TAGS.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    BLANK_RUNS
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(600_000)), 150_000);
    }

    #[test]
    fn test_truncate_no_truncation() {
        let content = "Short content.";
        assert_eq!(truncate_to_token_limit(content, 1000), content);
    }

    #[test]
    fn test_truncate_prefers_paragraph_boundary() {
        let content = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let result = truncate_to_token_limit(&content, 10);
        assert!(result.starts_with(&"a".repeat(30)));
        assert!(!result.contains('b'));
        assert!(result.ends_with("[truncated]"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let content = "안녕하세요".repeat(20);
        let result = truncate_to_token_limit(&content, 3);
        assert!(result.ends_with("[truncated]"));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(content_fingerprint("hello"), content_fingerprint("hello"));
        assert_ne!(content_fingerprint("hello"), content_fingerprint("hello!"));
        assert_eq!(content_fingerprint("hello").len(), 8);
    }

    #[test]
    fn test_html_to_text() {
        let html = "<html><head><title>x</title></head><body><p>Hi&nbsp;there</p><script>evil()</script><div>Second &amp; last</div></body></html>";
        let text = html_to_text(html);
        assert_eq!(text, "Hi there\nSecond & last");
    }
}
