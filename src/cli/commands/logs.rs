//! Logs Command
//!
//! Show recent precompute runs from the persisted run log.

use chrono::Local;

use crate::cli::ui::Output;
use crate::cli::util::CommandContext;
use crate::types::Result;

pub fn run(limit: usize, as_json: bool) -> Result<()> {
    let ctx = CommandContext::load()?;
    let run_log = ctx.run_log();
    let entries: Vec<_> = run_log.entries().into_iter().take(limit).collect();

    if as_json {
        let json = serde_json::json!({
            "summary": run_log.summary(),
            "runs": entries,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    let output = Output::new();
    if entries.is_empty() {
        output.info("No precompute runs recorded yet");
        return Ok(());
    }

    output.header("Precompute runs");
    for entry in &entries {
        let status = match &entry.error {
            Some(error) => format!("failed: {}", error),
            None => format!(
                "{} processed / {} candidates",
                entry.processed, entry.total_candidates
            ),
        };
        println!(
            "  {}  {:>6}ms  {}{}",
            entry.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            entry.duration_ms,
            status,
            if entry.forced { "  (forced)" } else { "" }
        );
        if entry.item_errors > 0 || entry.skipped > 0 {
            println!(
                "  {:>28}{} item errors, {} skipped",
                "", entry.item_errors, entry.skipped
            );
        }
    }

    let summary = run_log.summary();
    output.section("Totals");
    output.field("Runs", summary.runs);
    output.field("Failed runs", summary.failed_runs);
    output.field("Threads processed", summary.total_processed);
    output.field("Labels applied", summary.labels_applied);
    Ok(())
}
