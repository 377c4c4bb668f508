//! Candidate selection: which inbox threads need work this tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

use super::moderation::{ModerationRule, RuleWork};
use super::prompts::TextFields;
use crate::types::ThreadRecord;

/// Which category fills the tick first when there is more work than the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkPriority {
    #[default]
    SummaryFirst,
    ModerationFirst,
}

impl std::str::FromStr for WorkPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "summary_first" | "summary" => Ok(WorkPriority::SummaryFirst),
            "moderation_first" | "moderation" => Ok(WorkPriority::ModerationFirst),
            _ => Err(format!(
                "Unknown priority: {}. Valid values: summary-first, moderation-first",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelectContext {
    pub now: DateTime<Utc>,
    pub stale_after: chrono::Duration,
    pub subject_version: u32,
    pub force: bool,
}

/// One thread's work for a tick. A thread appears at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub record: ThreadRecord,
    pub text: TextFields,
    /// `(rule index, work)` pairs
    pub moderation: Vec<(usize, RuleWork)>,
}

impl WorkItem {
    pub fn thread_id(&self) -> &str {
        &self.record.id
    }

    pub fn needs_moderation(&self) -> bool {
        !self.moderation.is_empty()
    }

    pub fn evaluations(&self) -> impl Iterator<Item = usize> + '_ {
        self.moderation
            .iter()
            .filter(|(_, work)| *work == RuleWork::Evaluate)
            .map(|(index, _)| *index)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    /// Selected work, at most `limit` items
    pub items: Vec<WorkItem>,
    /// Threads needing any work, selected or not
    pub total: usize,
}

fn work_for(record: &ThreadRecord, rules: &[ModerationRule], ctx: &SelectContext) -> Option<WorkItem> {
    if !record.is_inbox_visible() {
        return None;
    }
    let text = TextFields {
        summary: ctx.force || record.needs_summary(ctx.now, ctx.stale_after),
        subject: ctx.force || record.needs_subject(ctx.subject_version, ctx.now, ctx.stale_after),
    };
    let moderation: Vec<(usize, RuleWork)> = rules
        .iter()
        .enumerate()
        .filter_map(|(i, rule)| rule.work_for(record, ctx.now, ctx.stale_after).map(|w| (i, w)))
        .collect();

    (text.any() || !moderation.is_empty()).then(|| WorkItem {
        record: record.clone(),
        text,
        moderation,
    })
}

/// Select up to `limit` threads. Newest mail goes first; a forced run goes
/// least-recently-summarized first so consecutive ticks walk the whole set.
pub fn select(
    records: &[ThreadRecord],
    rules: &[ModerationRule],
    ctx: &SelectContext,
    limit: usize,
    priority: WorkPriority,
) -> CandidateSet {
    let mut work: Vec<WorkItem> = records
        .iter()
        .filter_map(|record| work_for(record, rules, ctx))
        .collect();
    let total = work.len();

    if ctx.force {
        work.sort_by_key(|item| {
            (
                item.record.summary_updated_at,
                Reverse(item.record.received_at),
            )
        });
    } else {
        work.sort_by_key(|item| Reverse(item.record.received_at));
    }

    // Stable partition keeps the base order inside each group
    let first_group = |item: &WorkItem| match priority {
        WorkPriority::SummaryFirst => item.text.any(),
        WorkPriority::ModerationFirst => item.needs_moderation(),
    };
    let (mut items, rest): (Vec<WorkItem>, Vec<WorkItem>) = work.into_iter().partition(first_group);
    items.extend(rest);
    items.truncate(limit);

    CandidateSet { items, total }
}
