//! Precompute Command
//!
//! Runs the background precompute pipeline once from the command line.
//!
//! Usage:
//!   inboxpilot precompute [--limit N] [--no-sync] [--force] [--once]
//!                         [--priority summary-first|moderation-first] [--json]

use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::ai::scheduler::SchedulerEvent;
use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::precompute::{PrecomputeReport, TickOptions, WorkPriority};
use crate::types::Result;

#[derive(Debug, Clone, Default)]
pub struct PrecomputeOptions {
    /// Threads to process in total (tick limit when unset)
    pub limit: Option<usize>,
    pub sync: bool,
    pub force: bool,
    pub priority: Option<WorkPriority>,
    /// Run a single tick instead of ticking until no progress
    pub once: bool,
    pub json: bool,
    pub quiet: bool,
}

pub async fn run(options: PrecomputeOptions) -> Result<()> {
    let ctx = CommandContext::load()?;
    let orchestrator = ctx.orchestrator()?;
    let output = Output::quiet(options.quiet || options.json);

    // One notice per run when a request gives up after its retries
    let mut events = orchestrator.scheduler().subscribe();
    let notices = tokio::spawn(async move {
        let mut notified = false;
        loop {
            match events.recv().await {
                Ok(SchedulerEvent::RetriesExhausted { category, message, .. }) => {
                    if !notified {
                        Output::new().warning(&format!(
                            "AI provider unavailable ({}): {}. Remaining work will be retried on the next run.",
                            category, message
                        ));
                        notified = true;
                    }
                }
                Ok(SchedulerEvent::RetryScheduled { request_id, attempt, delay, .. }) => {
                    debug!(request_id = %request_id, attempt, delay_ms = delay.as_millis() as u64, "Retry scheduled");
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let limit = options
        .limit
        .unwrap_or(ctx.config.precompute.tick_limit)
        .max(1);
    let tick_options = TickOptions {
        sync: options.sync,
        force: options.force,
        priority: options.priority,
    };

    output.info(&format!("Precomputing up to {} threads", limit));
    let report = if options.once {
        let tick = orchestrator.tick(limit, tick_options).await;
        PrecomputeReport {
            ticks: 1,
            processed_count: tick.processed_count,
            total_candidates: tick.total_candidates,
        }
    } else {
        orchestrator.precompute_now(limit, tick_options).await
    };

    orchestrator.scheduler().flush_cache();
    notices.abort();

    if options.json {
        let json = serde_json::json!({
            "report": report,
            "last_run": orchestrator.run_summary().last_run,
            "scheduler": orchestrator.scheduler().stats(),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    let stats = orchestrator.scheduler().stats();
    output.success(&format!(
        "Processed {} threads in {} tick(s)",
        report.processed_count, report.ticks
    ));
    if !options.quiet {
        output.section("Scheduler");
        output.field("Provider calls", stats.provider_calls);
        output.field("Combined calls", stats.combined_calls);
        output.field("Cache hits", stats.cache_hits);
        output.field("Retries", stats.retries);
        output.field("Permanent failures", stats.permanent_failures);
        if let Some(last) = orchestrator.run_summary().last_run {
            output.section("Last tick");
            output.field("Candidates", last.total_candidates);
            output.field("Summaries ready", last.summaries_ready);
            output.field("Subjects ready", last.subjects_ready);
            output.field("Labels applied", last.labels_applied);
            output.field("Item errors", last.item_errors);
            if let Some(error) = last.error {
                output.error(&error);
            }
        }
    }

    Ok(())
}
