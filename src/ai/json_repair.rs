//! JSON extraction from model output
//!
//! Combined calls ask the model for a JSON object keyed by item ID. Models
//! wrap it in code fences, prepend prose, leave trailing commas or stop
//! mid-object; these helpers recover what they can.

use serde_json::{Map, Value};
use tracing::debug;

/// Parse the first JSON value in `raw`, repairing common damage.
pub fn extract_json(raw: &str) -> Option<Value> {
    let cleaned = preprocess(raw);
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
        return Some(value);
    }

    let candidate = embedded_json(&cleaned).unwrap_or(cleaned.as_str());
    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        debug!("JSON recovered from surrounding text");
        return Some(value);
    }

    let repaired = close_open_structures(&strip_trailing_commas(candidate));
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => {
            debug!("JSON recovered after repair");
            Some(value)
        }
        Err(_) => None,
    }
}

/// Like `extract_json`, but only accepts an object
pub fn extract_object(raw: &str) -> Option<Map<String, Value>> {
    match extract_json(raw)? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Text of a JSON value: strings as-is, anything structured re-serialized
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        other => Some(other.to_string()),
    }
}

fn preprocess(raw: &str) -> String {
    let mut s = raw.trim().trim_start_matches('\u{feff}').trim();

    if s.starts_with("```") {
        s = match s.find('\n') {
            Some(newline) => &s[newline + 1..],
            None => "",
        };
    }
    if let Some(stripped) = s.trim_end().strip_suffix("```") {
        s = stripped;
    }
    s.trim().to_string()
}

/// Slice from the first `{`/`[` to its matching closer, or to the end when
/// the structure never closes
fn embedded_json(s: &str) -> Option<&str> {
    let start = s.find(['{', '['])?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in s[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    Some(&s[start..])
}

fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escape = false;

    for (i, &ch) in chars.iter().enumerate() {
        if escape {
            escape = false;
            out.push(ch);
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            ',' if !in_string => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, Some('}') | Some(']')) {
                    continue;
                }
            }
            _ => {}
        }
        out.push(ch);
    }
    out
}

/// Close an unterminated string and any open objects/arrays, innermost first
fn close_open_structures(s: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for ch in s.chars() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut out = s.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        let trimmed = out.trim_end();
        if trimmed.ends_with(',') || trimmed.ends_with(':') {
            let keep = trimmed.len() - 1;
            out.truncate(keep);
        }
        out.push(closer);
    }
    out
}
