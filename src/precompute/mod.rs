//! Background precompute pipeline
//!
//! One tick walks the local thread dataset, picks threads that still need a
//! summary, a subject or a moderation verdict, sends the work through the
//! request scheduler and merges the results back without clobbering text
//! or label state that changed underneath it.
//!
//! Tick stages:
//! 1. Sync (optional): inbox listing, missing metadata, label reconciliation
//! 2. Candidate selection and batch construction
//! 3. Content preparation (cached bodies first)
//! 4. Re-validation and pending markers
//! 5. Dispatch: combined prompts per chunk, individual fallback, moderation
//! 6. Merge, then label actions for unactioned matches

pub mod candidates;
pub mod content;
pub mod labels;
pub mod merge;
pub mod moderation;
pub mod prompts;
pub mod run_log;

pub use candidates::{CandidateSet, SelectContext, WorkItem, WorkPriority};
pub use content::ThreadContent;
pub use labels::LabelResolver;
pub use merge::{FieldOutcome, MergeContext, TextOutcome};
pub use moderation::{ModerationRule, RuleWork, Verdict};
pub use prompts::{PromptSet, TextFields, TextResult};
pub use run_log::{RunLog, RunLogEntry, RunSummary, SyncReport};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ai::scheduler::Scheduler;
use crate::config::PrecomputeSettings;
use crate::constants::{labels as label_constants, precompute};
use crate::mail::{MessageMetadata, SharedMailApi};
use crate::storage::ThreadRepository;
use crate::types::{AiRequest, ModerationAction, Result, RunId, ThreadRecord};

#[derive(Debug, Clone, Copy, Default)]
pub struct TickOptions {
    /// Sync the inbox listing before selecting candidates
    pub sync: bool,
    /// Recompute summaries and subjects that already exist
    pub force: bool,
    /// Overrides the configured priority
    pub priority: Option<WorkPriority>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Threads written or actioned
    pub processed_count: usize,
    /// Threads needing work at tick start
    pub total_candidates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrecomputeReport {
    pub ticks: usize,
    pub processed_count: usize,
    /// Candidates seen by the last tick
    pub total_candidates: usize,
}

/// A selected thread plus the content it contributes to prompts
#[derive(Debug)]
struct Prepared {
    item: WorkItem,
    /// Absent for label-only work
    content: Option<ThreadContent>,
}

type Verdicts = HashMap<String, Vec<(usize, std::result::Result<Verdict, String>)>>;

pub struct Orchestrator {
    scheduler: Scheduler,
    repo: ThreadRepository,
    mail: SharedMailApi,
    settings: PrecomputeSettings,
    rules: Vec<ModerationRule>,
    labels: LabelResolver,
    run_log: RunLog,
    model: String,
}

impl Orchestrator {
    pub fn new(
        scheduler: Scheduler,
        repo: ThreadRepository,
        mail: SharedMailApi,
        settings: PrecomputeSettings,
        rules: Vec<ModerationRule>,
    ) -> Self {
        let model = settings
            .model
            .clone()
            .unwrap_or_else(|| scheduler.provider().default_model().to_string());
        Self {
            labels: LabelResolver::new(mail.clone()),
            scheduler,
            repo,
            mail,
            settings,
            rules,
            run_log: RunLog::default(),
            model,
        }
    }

    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = run_log;
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn run_logs(&self) -> Vec<RunLogEntry> {
        self.run_log.entries()
    }

    pub fn run_summary(&self) -> RunSummary {
        self.run_log.summary()
    }

    /// Run one tick. Never fails: an unexpected error is logged, recorded in
    /// the run log and reported as zero progress.
    pub async fn tick(&self, limit: usize, options: TickOptions) -> TickReport {
        self.tick_excluding(limit, options, &mut HashSet::new()).await
    }

    /// One tick that skips threads in `seen` and adds the threads it selects
    async fn tick_excluding(
        &self,
        limit: usize,
        options: TickOptions,
        seen: &mut HashSet<String>,
    ) -> TickReport {
        let started = Instant::now();
        let mut entry = RunLogEntry::new(RunId::generate(), Utc::now(), limit, options.force);
        info!(
            run_id = %entry.run_id,
            limit,
            sync = options.sync,
            force = options.force,
            "Precompute tick started"
        );

        let report = match self.run_tick(limit, options, seen, &mut entry).await {
            Ok(()) => TickReport {
                processed_count: entry.processed,
                total_candidates: entry.total_candidates,
            },
            Err(e) => {
                error!(run_id = %entry.run_id, "Precompute tick failed: {}", e);
                entry.error = Some(e.to_string());
                TickReport {
                    processed_count: 0,
                    total_candidates: entry.total_candidates,
                }
            }
        };

        entry.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %entry.run_id,
            processed = report.processed_count,
            candidates = report.total_candidates,
            skipped = entry.skipped,
            item_errors = entry.item_errors,
            duration_ms = entry.duration_ms,
            "Precompute tick finished"
        );
        self.run_log.record(entry);
        report
    }

    /// Repeat ticks until `limit` threads were processed or a tick makes no
    /// progress. Only the first tick syncs. A thread is selected at most once
    /// per run, so a forced run ends after one pass over the inbox.
    pub async fn precompute_now(&self, limit: usize, options: TickOptions) -> PrecomputeReport {
        let mut report = PrecomputeReport::default();
        let mut options = options;
        let mut seen = HashSet::new();
        let tick_limit = self.settings.tick_limit.max(1);

        while report.processed_count < limit && report.ticks < precompute::MAX_TICKS_PER_RUN {
            let remaining = limit - report.processed_count;
            let tick = self
                .tick_excluding(remaining.min(tick_limit), options, &mut seen)
                .await;
            options.sync = false;

            report.ticks += 1;
            report.processed_count += tick.processed_count;
            report.total_candidates = tick.total_candidates;
            if tick.processed_count == 0 {
                break;
            }
        }

        info!(
            ticks = report.ticks,
            processed = report.processed_count,
            "Precompute run finished"
        );
        report
    }

    async fn run_tick(
        &self,
        limit: usize,
        options: TickOptions,
        seen: &mut HashSet<String>,
        entry: &mut RunLogEntry,
    ) -> Result<()> {
        if options.sync {
            entry.sync = Some(self.sync().await?);
        }

        let now = Utc::now();
        let ctx = SelectContext {
            now,
            stale_after: self.settings.stale_after(),
            subject_version: self.settings.subject_version,
            force: options.force,
        };
        let mut records = self.repo.all()?;
        records.retain(|r| !seen.contains(&r.id));
        let priority = options.priority.unwrap_or(self.settings.priority);
        let CandidateSet { items, total } =
            candidates::select(&records, &self.rules, &ctx, limit, priority);
        entry.total_candidates = total;
        if items.is_empty() {
            debug!("No precompute candidates");
            return Ok(());
        }
        debug!(selected = items.len(), total, "Selected precompute candidates");
        seen.extend(items.iter().map(|item| item.thread_id().to_string()));

        let prepared = self.prepare(items).await;
        let active = self.mark_in_flight(prepared, now, entry);
        if active.is_empty() {
            return Ok(());
        }

        let mut text = self.generate_text(&active, options.force).await;
        let mut verdicts = self.evaluate_rules(&active, options.force).await;

        let merge_ctx = MergeContext {
            now: Utc::now(),
            subject_version: self.settings.subject_version,
            force: options.force,
        };
        for prepared in &active {
            let id = prepared.item.thread_id();
            let outcome = text.remove(id).unwrap_or_default();
            let rule_verdicts = verdicts.remove(id).unwrap_or_default();
            self.merge_one(prepared, &outcome, &rule_verdicts, &merge_ctx, entry).await;
        }

        Ok(())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// List the inbox, fetch metadata the local dataset lacks and reconcile
    /// the inbox label on every local record.
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut listed: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut complete = false;
        for _ in 0..precompute::MAX_SYNC_PAGES {
            let page = self.mail.list_inbox_ids(page_token.as_deref()).await?;
            listed.extend(page.ids);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => {
                    complete = true;
                    break;
                }
            }
        }
        if !complete {
            warn!(
                pages = precompute::MAX_SYNC_PAGES,
                "Inbox listing truncated; keeping inbox labels of unlisted threads"
            );
        }

        let listed_set: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let mut report = SyncReport {
            listed: listed_set.len(),
            ..Default::default()
        };

        let mut missing = Vec::new();
        for id in &listed_set {
            match self.repo.get(id)? {
                Some(record) if record.latest_message_id.is_some() => {}
                _ => missing.push(id.to_string()),
            }
        }

        let mut fetches = futures::stream::iter(missing)
            .map(|id| async move {
                let result = self.mail.get_message_metadata(&id).await;
                (id, result)
            })
            .buffer_unordered(precompute::FETCH_CONCURRENCY);
        while let Some((id, result)) = fetches.next().await {
            match result {
                Ok(metadata) => match self.store_metadata(&id, &metadata) {
                    Ok(()) => report.fetched += 1,
                    Err(e) => {
                        warn!(thread_id = %id, "Failed to store metadata: {}", e);
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    warn!(thread_id = %id, "Failed to fetch metadata: {}", e);
                    report.failed += 1;
                }
            }
        }

        for id in self.repo.ids()? {
            let in_listing = listed_set.contains(id.as_str());
            if !in_listing && !complete {
                continue;
            }
            let mut changed = false;
            self.repo.update(&id, |record| {
                let mut incoming: Vec<String> = record
                    .label_set
                    .union(&record.pending_label_removals)
                    .filter(|label| label.as_str() != label_constants::INBOX)
                    .cloned()
                    .collect();
                if in_listing {
                    incoming.push(label_constants::INBOX.to_string());
                }
                let before = (record.label_set.clone(), record.pending_label_removals.clone());
                record.merge_synced_labels(incoming);
                changed = before != (record.label_set.clone(), record.pending_label_removals.clone());
                changed
            })?;
            if changed {
                report.label_updates += 1;
            }
        }

        info!(
            listed = report.listed,
            fetched = report.fetched,
            failed = report.failed,
            label_updates = report.label_updates,
            "Inbox sync finished"
        );
        Ok(report)
    }

    fn store_metadata(&self, id: &str, metadata: &MessageMetadata) -> Result<()> {
        let mut fresh = ThreadRecord::new(id);
        apply_metadata(&mut fresh, metadata);
        fresh.merge_synced_labels(listed_labels(metadata));
        if self.repo.insert_if_absent(&fresh)? {
            return Ok(());
        }
        self.repo.update(id, |record| {
            apply_metadata(record, metadata);
            record.merge_synced_labels(listed_labels(metadata));
            true
        })?;
        Ok(())
    }

    // =========================================================================
    // Preparation
    // =========================================================================

    async fn prepare(&self, items: Vec<WorkItem>) -> Vec<Prepared> {
        let max_body_tokens = self.settings.max_body_tokens;
        let mut stream = futures::stream::iter(items)
            .map(|item| async move {
                let needs_content = item.text.any() || item.evaluations().next().is_some();
                let content = if needs_content {
                    Some(
                        content::prepare(&self.repo, self.mail.as_ref(), &item.record, max_body_tokens)
                            .await,
                    )
                } else {
                    None
                };
                Prepared { item, content }
            })
            .buffered(precompute::FETCH_CONCURRENCY);

        let mut prepared = Vec::new();
        while let Some(p) = stream.next().await {
            prepared.push(p);
        }
        prepared
    }

    /// Re-read each candidate, drop the ones that left the inbox, and mark the
    /// rest pending.
    fn mark_in_flight(
        &self,
        prepared: Vec<Prepared>,
        now: DateTime<Utc>,
        entry: &mut RunLogEntry,
    ) -> Vec<Prepared> {
        let mut active = Vec::with_capacity(prepared.len());
        for p in prepared {
            let id = p.item.thread_id().to_string();
            let result = self.repo.update(&id, |record| {
                if !record.is_inbox_visible() {
                    return false;
                }
                let mut changed = false;
                if p.item.text.summary {
                    changed |= record.mark_summary_pending(now);
                }
                if p.item.text.subject {
                    changed |= record.mark_subject_pending(now);
                }
                for index in p.item.evaluations() {
                    let rule = &self.rules[index];
                    record.mark_moderation_pending(&rule.id, rule.version, now);
                    changed = true;
                }
                changed
            });
            match result {
                Ok(Some(record)) if record.is_inbox_visible() => active.push(p),
                Ok(_) => {
                    debug!(thread_id = %id, "Thread left the inbox before dispatch");
                    entry.skipped += 1;
                }
                Err(e) => {
                    warn!(thread_id = %id, "Failed to mark thread in flight: {}", e);
                    entry.item_errors += 1;
                }
            }
        }
        active
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Summaries and subjects: one combined prompt per chunk, then individual
    /// calls for whatever a combined answer left out. Chunk prompts are
    /// already combined and stay out of scheduler batching. `force` skips
    /// the response cache.
    async fn generate_text(&self, active: &[Prepared], force: bool) -> HashMap<String, TextOutcome> {
        let wanted: Vec<(&ThreadContent, TextFields)> = active
            .iter()
            .filter(|p| p.item.text.any())
            .filter_map(|p| p.content.as_ref().map(|c| (c, p.item.text)))
            .collect();
        if wanted.is_empty() {
            return HashMap::new();
        }

        let chunk_size = self.settings.chunk_size.max(1);
        let pending: Vec<_> = wanted
            .chunks(chunk_size)
            .filter(|chunk| chunk.len() > 1)
            .map(|chunk| {
                let payload = self.settings.prompts.combined(chunk);
                let keys: Vec<(String, TextFields)> = chunk
                    .iter()
                    .map(|(c, f)| (c.thread_id.clone(), *f))
                    .collect();
                let request = AiRequest::background(&self.model, payload)
                    .without_batching()
                    .with_cache_bypass(force);
                (keys, self.scheduler.enqueue(request))
            })
            .collect();

        let mut results: HashMap<String, TextResult> = HashMap::new();
        for (keys, response) in pending {
            match response.await {
                Ok(response) => {
                    let ids: Vec<(&str, TextFields)> =
                        keys.iter().map(|(id, f)| (id.as_str(), *f)).collect();
                    let parsed = prompts::parse_combined(&response.text, &ids);
                    if parsed.len() < keys.len() {
                        debug!(
                            returned = parsed.len(),
                            requested = keys.len(),
                            "Combined answer incomplete"
                        );
                    }
                    results.extend(parsed);
                }
                Err(e) => warn!(threads = keys.len(), "Combined prompt failed: {}", e),
            }
        }

        let fallback: Vec<(&ThreadContent, TextFields)> = wanted
            .iter()
            .filter_map(|(content, fields)| {
                let missing = match results.get(&content.thread_id) {
                    Some(result) => fields.missing_from(result),
                    None => *fields,
                };
                missing.any().then_some((*content, missing))
            })
            .collect();
        if !fallback.is_empty() {
            debug!(threads = fallback.len(), "Individual text calls");
        }

        let mut errors: HashMap<String, String> = HashMap::new();
        let mut stream = futures::stream::iter(fallback)
            .map(|(content, fields)| async move {
                let request =
                    AiRequest::background(&self.model, self.settings.prompts.single(content, fields))
                        .with_cache_bypass(force);
                let result = self
                    .scheduler
                    .enqueue(request)
                    .await
                    .map(|response| prompts::parse_single(&response.text, fields));
                (content.thread_id.clone(), result)
            })
            .buffer_unordered(self.settings.per_call_concurrency.max(1));
        while let Some((id, result)) = stream.next().await {
            match result {
                Ok(parsed) => results.entry(id).or_default().fill_from(parsed),
                Err(e) => {
                    warn!(thread_id = %id, "Text generation failed: {}", e);
                    errors.insert(id, e.to_string());
                }
            }
        }

        wanted
            .iter()
            .map(|(content, fields)| {
                let id = &content.thread_id;
                let result = results.remove(id).unwrap_or_default();
                let reason = errors
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| "no usable answer".to_string());
                let outcome = TextOutcome {
                    summary: fields
                        .summary
                        .then(|| result.summary.clone().ok_or_else(|| reason.clone())),
                    subject: fields
                        .subject
                        .then(|| result.subject.clone().ok_or_else(|| reason.clone())),
                };
                (id.clone(), outcome)
            })
            .collect()
    }

    async fn evaluate_rules(&self, active: &[Prepared], force: bool) -> Verdicts {
        let jobs: Vec<(&str, usize, &ThreadContent)> = active
            .iter()
            .filter_map(|p| p.content.as_ref().map(|c| (p, c)))
            .flat_map(|(p, content)| {
                p.item
                    .evaluations()
                    .map(move |index| (p.item.thread_id(), index, content))
            })
            .collect();

        let mut verdicts: Verdicts = HashMap::new();
        let mut stream = futures::stream::iter(jobs)
            .map(|(thread_id, index, content)| async move {
                let rule = &self.rules[index];
                let request = AiRequest::background(&self.model, rule.payload(content))
                    .with_cache_bypass(force);
                let verdict = match self.scheduler.enqueue(request).await {
                    Ok(response) => moderation::parse_verdict(&response.text)
                        .ok_or_else(|| "unreadable verdict".to_string()),
                    Err(e) => Err(e.to_string()),
                };
                (thread_id, index, verdict)
            })
            .buffer_unordered(self.settings.per_call_concurrency.max(1));
        while let Some((thread_id, index, verdict)) = stream.next().await {
            if let Err(e) = &verdict {
                warn!(thread_id, rule = %self.rules[index].id, "Moderation failed: {}", e);
            }
            verdicts
                .entry(thread_id.to_string())
                .or_default()
                .push((index, verdict));
        }
        verdicts
    }

    // =========================================================================
    // Merge
    // =========================================================================

    async fn merge_one(
        &self,
        prepared: &Prepared,
        outcome: &TextOutcome,
        verdicts: &[(usize, std::result::Result<Verdict, String>)],
        ctx: &MergeContext,
        entry: &mut RunLogEntry,
    ) {
        let id = prepared.item.thread_id();
        let fingerprint = prepared.content.as_ref().map(|c| c.fingerprint.clone());
        let mut visible = false;
        let mut written = false;

        let result = self.repo.update(id, |record| {
            if !record.is_inbox_visible() {
                return false;
            }
            visible = true;
            let mut changed = merge::merge_text(record, outcome, ctx);
            for (index, verdict) in verdicts {
                changed |= merge::merge_verdict(record, &self.rules[*index], verdict, ctx.now);
            }
            if changed && fingerprint.is_some() && record.content_fingerprint != fingerprint {
                record.content_fingerprint = fingerprint.clone();
            }
            written = changed;
            changed
        });

        let record = match result {
            Ok(Some(record)) if visible => record,
            Ok(_) => {
                debug!(thread_id = %id, "Thread left the inbox; result discarded");
                entry.skipped += 1;
                return;
            }
            Err(e) => {
                warn!(thread_id = %id, "Failed to merge results: {}", e);
                entry.item_errors += 1;
                return;
            }
        };

        if written {
            if matches!(outcome.summary, Some(Ok(_))) {
                entry.summaries_ready += 1;
            }
            if matches!(outcome.subject, Some(Ok(_))) {
                entry.subjects_ready += 1;
            }
        }
        entry.moderation_evaluated += verdicts.len();
        let failures = [&outcome.summary, &outcome.subject]
            .into_iter()
            .filter(|o| matches!(o, Some(Err(_))))
            .count()
            + verdicts.iter().filter(|(_, v)| v.is_err()).count();
        entry.item_errors += failures;

        let labeled = self.apply_rule_labels(&record, entry).await;
        if written || labeled > 0 {
            entry.processed += 1;
        }
    }

    /// Apply the label of every enabled rule that matched without an action.
    /// `action_taken` is only recorded once the mail API accepted the label.
    async fn apply_rule_labels(&self, record: &ThreadRecord, entry: &mut RunLogEntry) -> usize {
        let mut applied = 0;
        for rule in self.rules.iter().filter(|r| r.enabled) {
            let due = record
                .moderation
                .get(&rule.id)
                .is_some_and(|e| e.needs_action() && e.rule_version >= rule.version);
            if !due {
                continue;
            }

            let label_id = match self.labels.resolve(&rule.label).await {
                Ok(id) => id,
                Err(e) => {
                    warn!(rule = %rule.id, label = %rule.label, "Failed to resolve label: {}", e);
                    entry.item_errors += 1;
                    continue;
                }
            };
            if let Err(e) = self
                .mail
                .apply_labels(&record.id, std::slice::from_ref(&label_id), &[])
                .await
            {
                warn!(thread_id = %record.id, rule = %rule.id, "Failed to apply label: {}", e);
                entry.item_errors += 1;
                continue;
            }

            let result = self.repo.update(&record.id, |current| {
                if !current.is_inbox_visible() {
                    return false;
                }
                let Some(moderation) = current.moderation.get_mut(&rule.id) else {
                    return false;
                };
                if !moderation.needs_action() {
                    return false;
                }
                moderation.action_taken = Some(ModerationAction::LabelEnqueued);
                current.add_label_locally(&label_id);
                true
            });
            match result {
                Ok(Some(current))
                    if current
                        .moderation
                        .get(&rule.id)
                        .is_some_and(|e| e.action_taken.is_some()) =>
                {
                    debug!(thread_id = %record.id, rule = %rule.id, "Label applied");
                    applied += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(thread_id = %record.id, "Failed to record label action: {}", e);
                    entry.item_errors += 1;
                }
            }
        }
        entry.labels_applied += applied;
        applied
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("model", &self.model)
            .field("rules", &self.rules.len())
            .field("run_log", &self.run_log)
            .finish_non_exhaustive()
    }
}

fn apply_metadata(record: &mut ThreadRecord, metadata: &MessageMetadata) {
    record.latest_message_id = Some(metadata.message_id.clone());
    if metadata.subject.is_some() {
        record.subject = metadata.subject.clone();
    }
    if metadata.from.is_some() {
        record.from = metadata.from.clone();
    }
    if metadata.snippet.is_some() {
        record.snippet = metadata.snippet.clone();
    }
    if metadata.received_at.is_some() {
        record.received_at = metadata.received_at;
    }
}

/// Labels of a thread that the inbox listing returned
fn listed_labels(metadata: &MessageMetadata) -> Vec<String> {
    let mut labels = metadata.label_ids.clone();
    if !labels.iter().any(|l| l == label_constants::INBOX) {
        labels.push(label_constants::INBOX.to_string());
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::provider::{CompletionProvider, CompletionResult, QuotaGuard};
    use crate::ai::scheduler::{CacheConfig, ResponseCache, SchedulerConfig};
    use crate::mail::{InboxPage, MailApi, MailLabel, MessageBody};
    use crate::storage::MemoryStore;
    use crate::types::{
        AiFieldStatus, ErrorCategory, ModerationStatus, Payload, PilotError, ProviderError,
    };
    use async_trait::async_trait;
    use regex::Regex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Answers summary/subject prompts as JSON and flags promo threads
    struct ScriptedProvider {
        calls: AtomicUsize,
        combined_calls: AtomicUsize,
        fail_text: AtomicBool,
        supports_combined: AtomicBool,
    }

    impl ScriptedProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                combined_calls: AtomicUsize::new(0),
                fail_text: AtomicBool::new(false),
                supports_combined: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, payload: &Payload, _model: &str) -> CompletionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let parts = payload.to_parts();
            let system = parts.first().map(|p| p.text.as_str()).unwrap_or("");
            let user = parts.last().map(|p| p.text.as_str()).unwrap_or("");

            if system.contains("classify email threads") {
                let verdict = if user.contains("SALE") { "MATCH" } else { "NOT_MATCH" };
                return Ok(json!({ "verdict": verdict }).to_string());
            }
            if self.fail_text.load(Ordering::SeqCst) {
                return Err(ProviderError::new(ErrorCategory::MalformedRequest, "bad request"));
            }
            if user.contains("### Thread ") {
                self.combined_calls.fetch_add(1, Ordering::SeqCst);
                let re = Regex::new(r"### Thread (\S+)").unwrap();
                let mut map = serde_json::Map::new();
                for cap in re.captures_iter(user) {
                    let id = &cap[1];
                    map.insert(
                        id.to_string(),
                        json!({ "summary": format!("summary {}", id), "subject": format!("subject {}", id) }),
                    );
                }
                return Ok(serde_json::Value::Object(map).to_string());
            }
            Ok(json!({ "summary": "single summary", "subject": "single subject" }).to_string())
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "test-model"
        }

        fn supports_combined(&self) -> bool {
            self.supports_combined.load(Ordering::SeqCst)
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct FakeMail {
        inbox: Mutex<Vec<String>>,
        metadata: Mutex<HashMap<String, MessageMetadata>>,
        applied: Mutex<Vec<(String, Vec<String>)>>,
        fail_apply: AtomicBool,
    }

    #[async_trait]
    impl MailApi for FakeMail {
        async fn list_inbox_ids(&self, _page_token: Option<&str>) -> Result<InboxPage> {
            Ok(InboxPage {
                ids: self.inbox.lock().unwrap().clone(),
                next_page_token: None,
            })
        }

        async fn get_message_metadata(&self, thread_id: &str) -> Result<MessageMetadata> {
            self.metadata
                .lock()
                .unwrap()
                .get(thread_id)
                .cloned()
                .ok_or_else(|| PilotError::NotFound(thread_id.to_string()))
        }

        async fn get_message_full(&self, message_id: &str) -> Result<MessageBody> {
            Ok(MessageBody {
                message_id: message_id.to_string(),
                body_text: Some(format!("Body of {}", message_id)),
                ..Default::default()
            })
        }

        async fn apply_labels(&self, thread_id: &str, add: &[String], _remove: &[String]) -> Result<()> {
            if self.fail_apply.load(Ordering::SeqCst) {
                return Err(PilotError::Mail("label service unavailable".into()));
            }
            self.applied
                .lock()
                .unwrap()
                .push((thread_id.to_string(), add.to_vec()));
            Ok(())
        }

        async fn list_labels(&self) -> Result<Vec<MailLabel>> {
            Ok(vec![])
        }

        async fn create_label(&self, name: &str) -> Result<MailLabel> {
            Ok(MailLabel {
                id: format!("Label_{}", name),
                name: name.to_string(),
            })
        }
    }

    fn scheduler(provider: Arc<ScriptedProvider>) -> Scheduler {
        Scheduler::new(
            provider,
            Arc::new(QuotaGuard::with_defaults()),
            ResponseCache::new(CacheConfig::default()),
            SchedulerConfig::default(),
        )
    }

    fn repo() -> ThreadRepository {
        ThreadRepository::new(Arc::new(MemoryStore::new()))
    }

    fn inbox_thread(id: &str, snippet: &str) -> ThreadRecord {
        let mut record = ThreadRecord::new(id).with_labels(["INBOX"]);
        record.latest_message_id = Some(format!("m-{}", id));
        record.subject = Some(snippet.into());
        record.snippet = Some(snippet.into());
        record.received_at = Some(Utc::now());
        record
    }

    fn promo_rule() -> ModerationRule {
        ModerationRule {
            id: "promo".into(),
            label: "AI/Promo".into(),
            prompt: "Promotional offers".into(),
            ..Default::default()
        }
    }

    fn orchestrator(
        provider: Arc<ScriptedProvider>,
        repo: ThreadRepository,
        mail: Arc<FakeMail>,
        rules: Vec<ModerationRule>,
    ) -> Orchestrator {
        Orchestrator::new(scheduler(provider), repo, mail, PrecomputeSettings::default(), rules)
    }

    #[tokio::test]
    async fn test_tick_fills_summaries_via_combined_prompt() {
        let provider = ScriptedProvider::new();
        let repo = repo();
        for id in ["a", "b", "c"] {
            repo.put(&inbox_thread(id, "hi")).unwrap();
        }
        let orch = orchestrator(provider.clone(), repo.clone(), Arc::new(FakeMail::default()), vec![]);

        let report = orch.tick(10, TickOptions::default()).await;
        assert_eq!(report, TickReport { processed_count: 3, total_candidates: 3 });
        assert_eq!(provider.combined_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let a = repo.get("a").unwrap().unwrap();
        assert_eq!(a.summary_text.as_deref(), Some("summary a"));
        assert_eq!(a.summary_status, AiFieldStatus::Ready);
        assert_eq!(a.subject_text.as_deref(), Some("subject a"));
        assert!(a.content_fingerprint.is_some());

        // Nothing left to do
        let again = orch.tick(10, TickOptions::default()).await;
        assert_eq!(again, TickReport::default());
        assert_eq!(orch.run_logs().len(), 2);
    }

    #[tokio::test]
    async fn test_chunk_prompts_not_folded_by_scheduler() {
        let provider = ScriptedProvider::new();
        provider.supports_combined.store(true, Ordering::SeqCst);
        let repo = repo();
        for id in ["a", "b", "c", "d"] {
            repo.put(&inbox_thread(id, "hi")).unwrap();
        }
        let settings = PrecomputeSettings {
            chunk_size: 2,
            ..Default::default()
        };
        let orch = Orchestrator::new(
            scheduler(provider.clone()),
            repo.clone(),
            Arc::new(FakeMail::default()),
            settings,
            vec![],
        );

        let report = orch.tick(10, TickOptions::default()).await;
        assert_eq!(report.processed_count, 4);
        assert_eq!(provider.combined_calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(orch.scheduler().stats().combined_calls, 0);
        assert_eq!(
            repo.get("d").unwrap().unwrap().summary_text.as_deref(),
            Some("summary d")
        );
    }

    #[tokio::test]
    async fn test_failed_text_recorded_per_item() {
        let provider = ScriptedProvider::new();
        provider.fail_text.store(true, Ordering::SeqCst);
        let repo = repo();
        repo.put(&inbox_thread("a", "hi")).unwrap();
        let orch = orchestrator(provider, repo.clone(), Arc::new(FakeMail::default()), vec![]);

        let report = orch.tick(10, TickOptions::default()).await;
        assert_eq!(report.processed_count, 1);
        let a = repo.get("a").unwrap().unwrap();
        assert_eq!(a.summary_status, AiFieldStatus::Error);
        assert_eq!(a.subject_status, AiFieldStatus::Error);
        assert!(orch.run_summary().total_item_errors >= 2);
    }

    #[tokio::test]
    async fn test_moderation_match_applies_label_once() {
        let provider = ScriptedProvider::new();
        let repo = repo();
        let mut promo = inbox_thread("p", "SALE today");
        promo.summary_text = Some("cached".into());
        promo.summary_status = AiFieldStatus::Ready;
        promo.subject_text = Some("cached subject".into());
        promo.subject_status = AiFieldStatus::Ready;
        promo.subject_version = Some(1);
        repo.put(&promo).unwrap();
        let mail = Arc::new(FakeMail::default());
        let orch = orchestrator(provider, repo.clone(), mail.clone(), vec![promo_rule()]);

        let report = orch.tick(10, TickOptions::default()).await;
        assert_eq!(report.processed_count, 1);

        let record = repo.get("p").unwrap().unwrap();
        let entry = &record.moderation["promo"];
        assert_eq!(entry.status, ModerationStatus::Match);
        assert_eq!(entry.action_taken, Some(ModerationAction::LabelEnqueued));
        assert!(record.has_label("Label_AI/Promo"));
        assert_eq!(record.summary_text.as_deref(), Some("cached"));
        assert_eq!(mail.applied.lock().unwrap().len(), 1);

        assert_eq!(orch.tick(10, TickOptions::default()).await.total_candidates, 0);
    }

    #[tokio::test]
    async fn test_failed_label_apply_retried_without_reevaluation() {
        let provider = ScriptedProvider::new();
        let repo = repo();
        repo.put(&inbox_thread("p", "SALE today")).unwrap();
        let mail = Arc::new(FakeMail::default());
        mail.fail_apply.store(true, Ordering::SeqCst);
        let orch = orchestrator(provider.clone(), repo.clone(), mail.clone(), vec![promo_rule()]);

        orch.tick(10, TickOptions::default()).await;
        let entry = repo.get("p").unwrap().unwrap().moderation["promo"].clone();
        assert_eq!(entry.status, ModerationStatus::Match);
        assert!(entry.action_taken.is_none());

        let calls_before = provider.calls.load(Ordering::SeqCst);
        mail.fail_apply.store(false, Ordering::SeqCst);
        let report = orch.tick(10, TickOptions::default()).await;
        assert_eq!(report.processed_count, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), calls_before);
        let entry = repo.get("p").unwrap().unwrap().moderation["promo"].clone();
        assert_eq!(entry.action_taken, Some(ModerationAction::LabelEnqueued));
    }

    #[tokio::test]
    async fn test_sync_fetches_and_keeps_local_removal() {
        let provider = ScriptedProvider::new();
        let repo = repo();
        let mail = Arc::new(FakeMail::default());
        *mail.inbox.lock().unwrap() = vec!["new".into(), "archived".into()];
        mail.metadata.lock().unwrap().insert(
            "new".into(),
            MessageMetadata {
                thread_id: "new".into(),
                message_id: "m-new".into(),
                label_ids: vec!["INBOX".into(), "UNREAD".into()],
                subject: Some("Welcome".into()),
                ..Default::default()
            },
        );
        let mut archived = inbox_thread("archived", "x");
        archived.remove_label_locally("INBOX");
        repo.put(&archived).unwrap();
        repo.put(&inbox_thread("gone", "x")).unwrap();

        let orch = orchestrator(provider, repo.clone(), mail, vec![]);
        let sync = orch.sync().await.unwrap();
        assert_eq!(sync.listed, 2);
        assert_eq!(sync.fetched, 1);

        let new = repo.get("new").unwrap().unwrap();
        assert!(new.is_inbox_visible());
        assert_eq!(new.latest_message_id.as_deref(), Some("m-new"));
        assert!(!repo.get("archived").unwrap().unwrap().is_inbox_visible());
        assert!(!repo.get("gone").unwrap().unwrap().is_inbox_visible());
    }

    #[tokio::test]
    async fn test_precompute_now_stops_without_progress() {
        let provider = ScriptedProvider::new();
        let repo = repo();
        for i in 0..5 {
            repo.put(&inbox_thread(&format!("t{}", i), "hi")).unwrap();
        }
        let settings = PrecomputeSettings {
            tick_limit: 2,
            ..Default::default()
        };
        let orch = Orchestrator::new(
            scheduler(provider),
            repo,
            Arc::new(FakeMail::default()),
            settings,
            vec![],
        );

        let report = orch.precompute_now(100, TickOptions::default()).await;
        assert_eq!(report.processed_count, 5);
        assert_eq!(report.ticks, 4);
        assert_eq!(orch.run_summary().runs, 4);
    }

    #[tokio::test]
    async fn test_tick_error_reports_zero_progress() {
        struct BrokenMail;

        #[async_trait]
        impl MailApi for BrokenMail {
            async fn list_inbox_ids(&self, _: Option<&str>) -> Result<InboxPage> {
                Err(PilotError::Mail("offline".into()))
            }
            async fn get_message_metadata(&self, id: &str) -> Result<MessageMetadata> {
                Err(PilotError::NotFound(id.into()))
            }
            async fn get_message_full(&self, id: &str) -> Result<MessageBody> {
                Err(PilotError::NotFound(id.into()))
            }
            async fn apply_labels(&self, _: &str, _: &[String], _: &[String]) -> Result<()> {
                Ok(())
            }
            async fn list_labels(&self) -> Result<Vec<MailLabel>> {
                Ok(vec![])
            }
            async fn create_label(&self, name: &str) -> Result<MailLabel> {
                Err(PilotError::Mail(name.into()))
            }
        }

        let repo = repo();
        repo.put(&inbox_thread("a", "hi")).unwrap();
        let orch = Orchestrator::new(
            scheduler(ScriptedProvider::new()),
            repo,
            Arc::new(BrokenMail),
            PrecomputeSettings::default(),
            vec![],
        );

        let report = orch
            .tick(10, TickOptions { sync: true, ..Default::default() })
            .await;
        assert_eq!(report.processed_count, 0);
        let summary = orch.run_summary();
        assert_eq!(summary.failed_runs, 1);
        assert!(summary.last_run.unwrap().error.unwrap().contains("offline"));
    }
}
