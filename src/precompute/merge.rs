//! Conflict rules for writing results back into a thread record.
//!
//! Every function works on the freshly re-read record and reports whether it
//! changed anything, so the caller can skip the write entirely.

use chrono::{DateTime, Utc};

use super::moderation::{ModerationRule, Verdict};
use crate::types::{AiFieldStatus, ModerationStatus, ThreadRecord};

/// Result of generating one field: text, or why there is none
pub type FieldOutcome = Result<String, String>;

/// Computed text for one thread; `None` for fields not requested this tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextOutcome {
    pub summary: Option<FieldOutcome>,
    pub subject: Option<FieldOutcome>,
}

#[derive(Debug, Clone, Copy)]
pub struct MergeContext {
    pub now: DateTime<Utc>,
    pub subject_version: u32,
    /// Replace existing text
    pub force: bool,
}

/// Apply computed summary/subject. Existing non-empty text wins unless
/// forced; a subject written under an older prompt version is replaceable.
pub fn merge_text(record: &mut ThreadRecord, outcome: &TextOutcome, ctx: &MergeContext) -> bool {
    let mut changed = false;

    if let Some(summary) = &outcome.summary
        && (ctx.force || !record.has_summary())
    {
        match summary {
            Ok(text) => {
                record.summary_text = Some(text.clone());
                record.summary_status = AiFieldStatus::Ready;
            }
            // An error never clobbers text that a forced run meant to replace
            Err(_) if record.has_summary() => {}
            Err(_) => record.summary_status = AiFieldStatus::Error,
        }
        if summary.is_ok() || !record.has_summary() {
            record.summary_updated_at = Some(ctx.now);
            changed = true;
        }
    }

    let subject_current = record.has_subject()
        && record
            .subject_version
            .is_some_and(|v| v >= ctx.subject_version);
    if let Some(subject) = &outcome.subject
        && (ctx.force || !subject_current)
    {
        match subject {
            Ok(text) => {
                record.subject_text = Some(text.clone());
                record.subject_status = AiFieldStatus::Ready;
                record.subject_version = Some(ctx.subject_version);
                record.subject_updated_at = Some(ctx.now);
                changed = true;
            }
            Err(_) if record.has_subject() => {
                // Keep the older text readable; release a pending marker
                if record.subject_status == AiFieldStatus::Pending {
                    record.subject_status = AiFieldStatus::Ready;
                    changed = true;
                }
            }
            Err(_) => {
                record.subject_status = AiFieldStatus::Error;
                record.subject_updated_at = Some(ctx.now);
                changed = true;
            }
        }
    }

    changed
}

/// Record one rule's verdict. Any recorded action is kept.
pub fn merge_verdict(
    record: &mut ThreadRecord,
    rule: &ModerationRule,
    verdict: &Result<Verdict, String>,
    now: DateTime<Utc>,
) -> bool {
    let entry = record.moderation.entry(rule.id.clone()).or_default();
    let status = match verdict {
        Ok(v) => v.status(),
        Err(_) => ModerationStatus::Error,
    };
    // A done match re-confirmed by the model is left as it is
    if entry.status == ModerationStatus::Match
        && status == ModerationStatus::Match
        && entry.action_taken.is_some()
        && entry.rule_version >= rule.version
    {
        return false;
    }
    entry.status = status;
    entry.rule_version = rule.version;
    entry.evaluated_at = Some(now);
    true
}
