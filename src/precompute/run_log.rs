//! Bounded log of precompute runs, persisted best-effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::constants::{collections, precompute};
use crate::storage::{SharedStore, StoreExt};
use crate::types::{RunId, log_filter_warn};

/// Outcome of the optional inbox sync step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Thread IDs the server lists in the inbox
    pub listed: usize,
    /// Records created or completed from fetched metadata
    pub fetched: usize,
    /// Metadata fetches that failed
    pub failed: usize,
    /// Records whose labels changed to match the server
    pub label_updates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub limit: usize,
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncReport>,
    pub total_candidates: usize,
    pub processed: usize,
    /// Dropped at re-validation or merge because they left the inbox
    pub skipped: usize,
    pub summaries_ready: usize,
    pub subjects_ready: usize,
    pub moderation_evaluated: usize,
    pub labels_applied: usize,
    /// Per-item failures (error statuses written, failed label actions)
    pub item_errors: usize,
    /// Set when the tick itself failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunLogEntry {
    pub fn new(run_id: RunId, started_at: DateTime<Utc>, limit: usize, forced: bool) -> Self {
        Self {
            run_id,
            started_at,
            duration_ms: 0,
            limit,
            forced,
            sync: None,
            total_candidates: 0,
            processed: 0,
            skipped: 0,
            summaries_ready: 0,
            subjects_ready: 0,
            moderation_evaluated: 0,
            labels_applied: 0,
            item_errors: 0,
            error: None,
        }
    }
}

/// Aggregate over the retained runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub runs: usize,
    pub failed_runs: usize,
    pub total_processed: usize,
    pub total_item_errors: usize,
    pub summaries_ready: usize,
    pub subjects_ready: usize,
    pub labels_applied: usize,
    pub last_run: Option<RunLogEntry>,
}

pub struct RunLog {
    entries: Mutex<VecDeque<RunLogEntry>>,
    capacity: usize,
    store: Option<SharedStore>,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new(precompute::MAX_RUN_LOGS)
    }
}

impl RunLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            store: None,
        }
    }

    /// Attach a store and load the newest retained entries from it
    pub fn with_store(mut self, store: SharedStore) -> Self {
        match store.get_all(collections::RUN_LOGS) {
            Ok(docs) => {
                let mut loaded: Vec<RunLogEntry> = docs
                    .into_iter()
                    .filter_map(|(key, value)| {
                        log_filter_warn(
                            serde_json::from_value::<RunLogEntry>(value),
                            &format!("Skipping unreadable run log {}", key),
                        )
                    })
                    .collect();
                loaded.sort_by(|a, b| a.started_at.cmp(&b.started_at));
                let skip = loaded.len().saturating_sub(self.capacity);
                let mut entries = self.lock();
                entries.extend(loaded.into_iter().skip(skip));
                debug!(entries = entries.len(), "Loaded run logs");
            }
            Err(e) => warn!("Failed to load run logs: {}", e),
        }
        self.store = Some(store);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RunLogEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry, evicting the oldest beyond capacity
    pub fn record(&self, entry: RunLogEntry) {
        let evicted: Vec<RunLogEntry> = {
            let mut entries = self.lock();
            entries.push_back(entry.clone());
            let excess = entries.len().saturating_sub(self.capacity);
            entries.drain(..excess).collect()
        };

        let Some(store) = self.store.clone() else {
            return;
        };
        let write = move || {
            if let Err(e) = store.put_json(collections::RUN_LOGS, entry.run_id.as_str(), &entry) {
                warn!("Failed to persist run log: {}", e);
            }
            for old in evicted {
                if let Err(e) = store.delete(collections::RUN_LOGS, old.run_id.as_str()) {
                    warn!("Failed to prune run log: {}", e);
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    /// Newest first
    pub fn entries(&self) -> Vec<RunLogEntry> {
        self.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> RunSummary {
        let entries = self.lock();
        let mut summary = RunSummary {
            runs: entries.len(),
            last_run: entries.back().cloned(),
            ..Default::default()
        };
        for entry in entries.iter() {
            if entry.error.is_some() {
                summary.failed_runs += 1;
            }
            summary.total_processed += entry.processed;
            summary.total_item_errors += entry.item_errors;
            summary.summaries_ready += entry.summaries_ready;
            summary.subjects_ready += entry.subjects_ready;
            summary.labels_applied += entry.labels_applied;
        }
        summary
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("capacity", &self.capacity)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn entry(processed: usize, error: Option<&str>) -> RunLogEntry {
        let mut entry = RunLogEntry::new(RunId::generate(), Utc::now(), 25, false);
        entry.processed = processed;
        entry.error = error.map(String::from);
        std::thread::sleep(std::time::Duration::from_millis(2));
        entry
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = RunLog::new(3);
        for i in 0..5 {
            log.record(entry(i, None));
        }
        let processed: Vec<usize> = log.entries().iter().map(|e| e.processed).collect();
        assert_eq!(processed, vec![4, 3, 2]);
    }

    #[test]
    fn test_summary_aggregates() {
        let log = RunLog::new(10);
        log.record(entry(3, None));
        log.record(entry(0, Some("mail api down")));
        log.record(entry(2, None));

        let summary = log.summary();
        assert_eq!(summary.runs, 3);
        assert_eq!(summary.failed_runs, 1);
        assert_eq!(summary.total_processed, 5);
        assert_eq!(summary.last_run.unwrap().processed, 2);
    }

    #[test]
    fn test_persisted_and_pruned() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let log = RunLog::new(2).with_store(store.clone());
        for i in 0..3 {
            log.record(entry(i, None));
        }
        assert_eq!(store.get_all_keys(collections::RUN_LOGS).unwrap().len(), 2);

        let reloaded = RunLog::new(2).with_store(store);
        let processed: Vec<usize> = reloaded.entries().iter().map(|e| e.processed).collect();
        assert_eq!(processed, vec![2, 1]);
    }
}
