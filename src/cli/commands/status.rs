//! Status Command
//!
//! Local dataset, provider quota and cache state, without touching the network.

use serde::Serialize;

use crate::ai::provider::QuotaSnapshot;
use crate::ai::scheduler::CacheEntry;
use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::constants::collections;
use crate::precompute::ModerationRule;
use crate::storage::StoreExt;
use crate::types::{AiFieldStatus, Result, ThreadRecord};

#[derive(Debug, Default, Serialize)]
pub struct FieldCounts {
    pub ready: usize,
    pub pending: usize,
    pub error: usize,
    pub missing: usize,
}

impl FieldCounts {
    fn add(&mut self, status: AiFieldStatus) {
        match status {
            AiFieldStatus::Ready => self.ready += 1,
            AiFieldStatus::Pending => self.pending += 1,
            AiFieldStatus::Error => self.error += 1,
            AiFieldStatus::None => self.missing += 1,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct DatasetStats {
    pub threads: usize,
    pub inbox_visible: usize,
    pub summaries: FieldCounts,
    pub subjects: FieldCounts,
    /// Matches whose label has not been applied yet
    pub unactioned_matches: usize,
    pub moderation_errors: usize,
}

impl DatasetStats {
    pub fn collect(records: &[ThreadRecord], rules: &[ModerationRule]) -> Self {
        let mut stats = DatasetStats {
            threads: records.len(),
            ..Default::default()
        };
        for record in records.iter().filter(|r| r.is_inbox_visible()) {
            stats.inbox_visible += 1;
            stats.summaries.add(record.summary_status);
            stats.subjects.add(record.subject_status);
            for rule in rules.iter().filter(|r| r.enabled) {
                if let Some(entry) = record.moderation.get(&rule.id) {
                    if entry.needs_action() {
                        stats.unactioned_matches += 1;
                    }
                    if entry.status == crate::types::ModerationStatus::Error {
                        stats.moderation_errors += 1;
                    }
                }
            }
        }
        stats
    }
}

pub fn run(as_json: bool) -> Result<()> {
    let ctx = CommandContext::load()?;
    let store = ctx.store();

    let records = ctx.threads().all()?;
    let dataset = DatasetStats::collect(&records, &ctx.config.moderation.rules);
    let quota: Vec<QuotaSnapshot> = store
        .get_json(collections::AI_STATE, collections::QUOTA_STATE_KEY)?
        .unwrap_or_default();
    let cached: Vec<CacheEntry> = store
        .get_json(collections::AI_STATE, collections::RESPONSE_CACHE_KEY)?
        .unwrap_or_default();
    let summary = ctx.run_log().summary();
    let schema_version = ctx.db.schema_version()?;

    if as_json {
        let json = serde_json::json!({
            "database": ctx.db_path,
            "schema_version": schema_version,
            "dataset": dataset,
            "quota": quota,
            "cached_responses": cached.len(),
            "runs": summary,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    let output = Output::new();
    output.header("InboxPilot Status");
    output.field("Database", ctx.db_path.display());
    output.field("Schema version", schema_version);
    output.field("Provider", &ctx.config.provider.kind);

    output.section("Threads");
    output.field("Stored", dataset.threads);
    output.field("In inbox", dataset.inbox_visible);
    output.field(
        "Summaries",
        format!(
            "{} ready, {} pending, {} error, {} missing",
            dataset.summaries.ready,
            dataset.summaries.pending,
            dataset.summaries.error,
            dataset.summaries.missing
        ),
    );
    output.field(
        "Subjects",
        format!(
            "{} ready, {} pending, {} error, {} missing",
            dataset.subjects.ready,
            dataset.subjects.pending,
            dataset.subjects.error,
            dataset.subjects.missing
        ),
    );
    output.field("Rules", ctx.config.moderation.rules.len());
    output.field("Unactioned matches", dataset.unactioned_matches);

    output.section("Provider");
    output.field("Cached responses", cached.len());
    if quota.is_empty() {
        output.field("Quota", "closed");
    }
    for snapshot in &quota {
        let state = match snapshot.cooldown_until {
            Some(until) if until > chrono::Utc::now() => format!("cooling down until {}", until),
            _ => "closed".to_string(),
        };
        output.field(
            &snapshot.provider_id,
            format!("{} ({} consecutive rate limits)", state, snapshot.consecutive_failures),
        );
    }

    output.section("Runs");
    output.field("Recorded", summary.runs);
    output.field("Failed", summary.failed_runs);
    if let Some(last) = summary.last_run {
        output.field("Last run", last.started_at.to_rfc3339());
        output.field("Last processed", last.processed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModerationEntry, ModerationStatus};

    #[test]
    fn test_dataset_stats_counts_visible_only() {
        let mut ready = ThreadRecord::new("a").with_labels(["INBOX"]);
        ready.summary_status = AiFieldStatus::Ready;
        ready.moderation.insert(
            "promo".into(),
            ModerationEntry {
                status: ModerationStatus::Match,
                ..Default::default()
            },
        );
        let archived = ThreadRecord::new("b");
        let rules = vec![ModerationRule {
            id: "promo".into(),
            ..Default::default()
        }];

        let stats = DatasetStats::collect(&[ready, archived], &rules);
        assert_eq!(stats.threads, 2);
        assert_eq!(stats.inbox_visible, 1);
        assert_eq!(stats.summaries.ready, 1);
        assert_eq!(stats.subjects.missing, 1);
        assert_eq!(stats.unactioned_matches, 1);
    }
}
