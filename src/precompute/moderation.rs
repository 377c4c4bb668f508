//! Moderation rules: eligibility, prompts and verdict parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use regex::Regex;

use super::content::ThreadContent;
use crate::ai::json_repair::extract_json;
use crate::types::{ContentPart, ModerationStatus, Payload, ThreadRecord};

/// A user-defined rule; a `match` verdict applies `label` to the thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationRule {
    pub id: String,
    /// Bump to re-evaluate every thread under a changed prompt
    pub version: u32,
    /// Mail label name applied on a match
    pub label: String,
    /// What the rule looks for, in plain language
    pub prompt: String,
    pub enabled: bool,
    /// Re-check `not_match` verdicts older than this
    pub reevaluate_after_secs: Option<u64>,
}

impl Default for ModerationRule {
    fn default() -> Self {
        Self {
            id: String::new(),
            version: 1,
            label: String::new(),
            prompt: String::new(),
            enabled: true,
            reevaluate_after_secs: None,
        }
    }
}

/// What a rule still needs on one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleWork {
    /// Ask the model for a verdict
    Evaluate,
    /// Matched earlier but the label was never applied
    ActionOnly,
}

impl ModerationRule {
    pub fn work_for(
        &self,
        record: &ThreadRecord,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Option<RuleWork> {
        if !self.enabled {
            return None;
        }
        let Some(entry) = record.moderation.get(&self.id) else {
            return Some(RuleWork::Evaluate);
        };
        let age = entry.evaluated_at.map(|at| now - at);

        if entry.status == ModerationStatus::Pending {
            return age.is_none_or(|age| age >= stale_after).then_some(RuleWork::Evaluate);
        }
        if entry.rule_version < self.version {
            return Some(RuleWork::Evaluate);
        }

        match entry.status {
            ModerationStatus::Unset | ModerationStatus::Unknown | ModerationStatus::Error => {
                Some(RuleWork::Evaluate)
            }
            ModerationStatus::Match if entry.needs_action() => Some(RuleWork::ActionOnly),
            ModerationStatus::Match | ModerationStatus::Pending => None,
            ModerationStatus::NotMatch => {
                let window = self
                    .reevaluate_after_secs
                    .and_then(|secs| chrono::Duration::try_seconds(secs as i64))?;
                age.is_none_or(|age| age >= window).then_some(RuleWork::Evaluate)
            }
        }
    }

    pub fn payload(&self, content: &ThreadContent) -> Payload {
        let system = format!(
            "You classify email threads against one rule.\n\nRule: {}\n\n\
             Answer with a JSON object {{\"verdict\": \"MATCH\" | \"NOT_MATCH\" | \"UNKNOWN\"}}. \
             Use UNKNOWN only when the message gives too little to decide.",
            self.prompt.trim()
        );
        Payload::Parts(vec![ContentPart::system(system), ContentPart::user(content.render())])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    NotMatch,
    Unknown,
}

impl Verdict {
    pub fn status(self) -> ModerationStatus {
        match self {
            Verdict::Match => ModerationStatus::Match,
            Verdict::NotMatch => ModerationStatus::NotMatch,
            Verdict::Unknown => ModerationStatus::Unknown,
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        let normalized = token.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "MATCH" | "YES" | "TRUE" => Some(Verdict::Match),
            "NOT_MATCH" | "NO_MATCH" | "NOMATCH" | "NO" | "FALSE" => Some(Verdict::NotMatch),
            "UNKNOWN" | "UNSURE" => Some(Verdict::Unknown),
            _ => None,
        }
    }
}

static VERDICT_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(not[ _-]?match|no[ _-]?match|match|unknown)\b").expect("valid regex")
});

/// Read a verdict from JSON (`{"verdict": ...}` or a bare string) or plain text
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    if let Some(value) = extract_json(text) {
        let token = match &value {
            serde_json::Value::Object(map) => map
                .get("verdict")
                .or_else(|| map.get("result"))
                .and_then(|v| v.as_str()),
            serde_json::Value::String(s) => Some(s.as_str()),
            _ => None,
        };
        if let Some(verdict) = token.and_then(Verdict::from_token) {
            return Some(verdict);
        }
    }

    if let Some(verdict) = Verdict::from_token(text) {
        return Some(verdict);
    }
    VERDICT_WORD
        .find(text)
        .and_then(|m| Verdict::from_token(m.as_str()))
}
