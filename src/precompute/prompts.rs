//! Summary/subject prompts, single and combined.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::content::ThreadContent;
use crate::ai::json_repair::{extract_object, value_text};
use crate::types::{ContentPart, Payload};

const DEFAULT_SUMMARY_PROMPT: &str = "Summarize the email thread in one or two plain sentences. \
State who wants what and any deadline. No greeting, no preamble.";

const DEFAULT_SUBJECT_PROMPT: &str = "Write a short, specific subject line (at most eight words) \
describing what the latest message is actually about.";

/// Instruction text for each generated field; configurable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSet {
    pub summary: String,
    pub subject: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            summary: DEFAULT_SUMMARY_PROMPT.to_string(),
            subject: DEFAULT_SUBJECT_PROMPT.to_string(),
        }
    }
}

/// Which fields an item asks for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextFields {
    pub summary: bool,
    pub subject: bool,
}

impl TextFields {
    pub fn any(&self) -> bool {
        self.summary || self.subject
    }

    fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(2);
        if self.summary {
            names.push("summary");
        }
        if self.subject {
            names.push("subject");
        }
        names
    }

    /// Fields in `self` that `result` did not fill
    pub fn missing_from(&self, result: &TextResult) -> TextFields {
        TextFields {
            summary: self.summary && result.summary.is_none(),
            subject: self.subject && result.subject.is_none(),
        }
    }
}

/// Generated text for one thread; `None` where nothing usable came back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextResult {
    pub summary: Option<String>,
    pub subject: Option<String>,
}

impl TextResult {
    pub fn fill_from(&mut self, other: TextResult) {
        if self.summary.is_none() {
            self.summary = other.summary;
        }
        if self.subject.is_none() {
            self.subject = other.subject;
        }
    }
}

impl PromptSet {
    fn instructions(&self, fields: TextFields) -> String {
        let mut out = String::from("You help triage an email inbox.\n");
        if fields.summary {
            out.push_str(&format!("\nsummary: {}\n", self.summary.trim()));
        }
        if fields.subject {
            out.push_str(&format!("\nsubject: {}\n", self.subject.trim()));
        }
        out
    }

    /// Prompt for one thread
    pub fn single(&self, content: &ThreadContent, fields: TextFields) -> Payload {
        let system = format!(
            "{}\nRespond with only a JSON object with the keys: {}.",
            self.instructions(fields),
            fields.names().join(", ")
        );
        Payload::Parts(vec![ContentPart::system(system), ContentPart::user(content.render())])
    }

    /// Prompt for several threads at once, keyed by thread ID
    pub fn combined(&self, items: &[(&ThreadContent, TextFields)]) -> Payload {
        let union = items.iter().fold(TextFields::default(), |acc, (_, f)| TextFields {
            summary: acc.summary || f.summary,
            subject: acc.subject || f.subject,
        });
        let system = format!(
            "{}\nYou will receive several threads, each introduced by \"### Thread <id>\" and the \
             fields wanted for it. Respond with only a JSON object mapping each thread id to an \
             object holding those fields.",
            self.instructions(union)
        );

        let mut body = String::new();
        for (content, fields) in items {
            body.push_str(&format!(
                "### Thread {}\nFields: {}\n{}\n\n",
                content.thread_id,
                fields.names().join(", "),
                content.render().trim_end()
            ));
        }
        Payload::Parts(vec![
            ContentPart::system(system),
            ContentPart::user(body.trim_end()),
        ])
    }
}

fn read_fields(map: &Map<String, Value>, fields: TextFields) -> TextResult {
    TextResult {
        summary: fields
            .summary
            .then(|| map.get("summary").and_then(value_text))
            .flatten(),
        subject: fields
            .subject
            .then(|| map.get("subject").and_then(value_text))
            .flatten(),
    }
}

/// Read a single-thread answer. Plain text is accepted when only one field
/// was asked for.
pub fn parse_single(text: &str, fields: TextFields) -> TextResult {
    if let Some(map) = extract_object(text) {
        let result = read_fields(&map, fields);
        if result != TextResult::default() {
            return result;
        }
    }
    let plain = text.trim();
    if plain.is_empty() || plain.starts_with('{') {
        return TextResult::default();
    }
    match (fields.summary, fields.subject) {
        (true, false) => TextResult {
            summary: Some(plain.to_string()),
            subject: None,
        },
        (false, true) => TextResult {
            summary: None,
            subject: Some(plain.lines().next().unwrap_or(plain).trim().to_string()),
        },
        _ => TextResult::default(),
    }
}

/// Read a combined answer into per-thread results. Threads absent from the
/// answer are absent from the map.
pub fn parse_combined(text: &str, items: &[(&str, TextFields)]) -> HashMap<String, TextResult> {
    let Some(map) = extract_object(text) else {
        return HashMap::new();
    };

    let mut results = HashMap::new();
    for (thread_id, fields) in items {
        let result = match map.get(*thread_id) {
            Some(Value::Object(inner)) => read_fields(inner, *fields),
            // A bare string can only be read when one field was asked for
            Some(Value::String(s)) => parse_single(s, *fields),
            _ => continue,
        };
        if result != TextResult::default() {
            results.insert(thread_id.to_string(), result);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: TextFields = TextFields {
        summary: true,
        subject: true,
    };
    const SUMMARY: TextFields = TextFields {
        summary: true,
        subject: false,
    };

    fn content(id: &str) -> ThreadContent {
        ThreadContent {
            thread_id: id.to_string(),
            subject: "Lunch".into(),
            from: "a@example.com".into(),
            body: "Are you free Friday?".into(),
            attachments: vec![],
            fingerprint: "00000000".into(),
        }
    }

    #[test]
    fn test_combined_prompt_lists_threads_and_fields() {
        let a = content("t1");
        let b = content("t2");
        let payload = PromptSet::default().combined(&[(&a, BOTH), (&b, SUMMARY)]);
        let parts = payload.to_parts();
        assert!(parts[0].text.contains("summary:"));
        assert!(parts[0].text.contains("subject:"));
        assert!(parts[1].text.contains("### Thread t1\nFields: summary, subject"));
        assert!(parts[1].text.contains("### Thread t2\nFields: summary\n"));
    }

    #[test]
    fn test_parse_combined_partial() {
        let text = r#"{"t1": {"summary": "Lunch Friday?", "subject": "Friday lunch"},
                       "t2": {"subject": "not asked"}}"#;
        let results = parse_combined(text, &[("t1", BOTH), ("t2", SUMMARY), ("t3", BOTH)]);
        assert_eq!(results.len(), 1);
        assert_eq!(results["t1"].subject.as_deref(), Some("Friday lunch"));
    }

    #[test]
    fn test_parse_single_plain_text() {
        let result = parse_single("Alice asks about lunch on Friday.", SUMMARY);
        assert_eq!(result.summary.as_deref(), Some("Alice asks about lunch on Friday."));

        // Plain text is ambiguous when both fields were requested
        assert_eq!(parse_single("some text", BOTH), TextResult::default());

        let json = parse_single(r#"{"summary": "s", "subject": "t"}"#, BOTH);
        assert_eq!(json.summary.as_deref(), Some("s"));
        assert_eq!(json.subject.as_deref(), Some("t"));
    }

    #[test]
    fn test_missing_fields() {
        let partial = TextResult {
            summary: Some("s".into()),
            subject: None,
        };
        let missing = BOTH.missing_from(&partial);
        assert!(!missing.summary);
        assert!(missing.subject);
        assert!(!SUMMARY.missing_from(&partial).any());
    }
}
