//! Response cache keyed by request content.
//!
//! Entries live for the TTL. Inserts purge expired entries and evict the
//! oldest past `max_entries`. Every insert schedules a debounced flush of the
//! newest entries to the local store; flushes run on a blocking task and
//! their failures are only logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{cache, collections};
use crate::storage::{SharedStore, StoreExt};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub max_persisted_entries: usize,
    pub flush_debounce: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(cache::TTL_SECS),
            max_entries: cache::MAX_ENTRIES,
            max_persisted_entries: cache::MAX_PERSISTED_ENTRIES,
            flush_debounce: Duration::from_millis(cache::FLUSH_DEBOUNCE_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    last_flush: Option<Instant>,
    flush_scheduled: bool,
}

pub struct ResponseCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    store: Option<SharedStore>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            store: None,
        }
    }

    /// Attach a store and load its snapshot, dropping expired entries
    pub fn with_store(mut self, store: SharedStore) -> Self {
        match store.get_json::<Vec<CacheEntry>>(collections::AI_STATE, collections::RESPONSE_CACHE_KEY)
        {
            Ok(Some(entries)) => {
                let now = Utc::now();
                let mut state = self.lock();
                for entry in entries {
                    if self.is_fresh(&entry, now) {
                        state.entries.insert(entry.key.clone(), entry);
                    }
                }
                debug!(entries = state.entries.len(), "Loaded response cache");
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load response cache: {}", e),
        }
        self.store = Some(store);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = (now - entry.created_at).to_std().unwrap_or(Duration::ZERO);
        age < self.config.ttl
    }

    /// Cached text younger than the TTL. Expired entries are evicted.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let mut state = self.lock();
        let entry = state.entries.get(key)?;
        if self.is_fresh(entry, now) {
            return Some(entry.text.clone());
        }
        state.entries.remove(key);
        None
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Store a completion and schedule a flush
    pub fn insert(self: &Arc<Self>, key: String, text: String, now: DateTime<Utc>) {
        let schedule = {
            let mut state = self.lock();
            state.entries.retain(|_, entry| self.is_fresh(entry, now));
            state.entries.insert(
                key.clone(),
                CacheEntry {
                    key,
                    text,
                    created_at: now,
                },
            );
            while state.entries.len() > self.config.max_entries {
                let Some(oldest) = state
                    .entries
                    .values()
                    .min_by_key(|e| e.created_at)
                    .map(|e| e.key.clone())
                else {
                    break;
                };
                state.entries.remove(&oldest);
            }
            if self.store.is_none() || state.flush_scheduled {
                None
            } else {
                state.flush_scheduled = true;
                let since_last = state
                    .last_flush
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.flush_debounce);
                Some(self.config.flush_debounce.saturating_sub(since_last))
            }
        };

        if let Some(wait) = schedule {
            self.schedule_flush(wait);
        }
    }

    fn schedule_flush(self: &Arc<Self>, wait: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    if let Some(cache) = weak.upgrade() {
                        cache.flush_in_background();
                    }
                });
            }
            Err(_) => self.flush_now(),
        }
    }

    /// Newest fresh entries, capped for persistence
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let state = self.lock();
        let mut entries: Vec<CacheEntry> = state
            .entries
            .values()
            .filter(|e| self.is_fresh(e, now))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(self.config.max_persisted_entries);
        entries
    }

    fn begin_flush(&self) -> Vec<CacheEntry> {
        {
            let mut state = self.lock();
            state.flush_scheduled = false;
            state.last_flush = Some(Instant::now());
        }
        self.snapshot(Utc::now())
    }

    fn flush_in_background(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = self.begin_flush();
        tokio::task::spawn_blocking(move || write_snapshot(&store, &snapshot));
    }

    /// Synchronous flush, used at shutdown and outside a runtime
    pub fn flush_now(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let snapshot = self.begin_flush();
        write_snapshot(store, &snapshot);
    }
}

fn write_snapshot(store: &SharedStore, snapshot: &[CacheEntry]) {
    match store.put_json(collections::AI_STATE, collections::RESPONSE_CACHE_KEY, snapshot) {
        Ok(()) => debug!(entries = snapshot.len(), "Flushed response cache"),
        Err(e) => warn!("Failed to persist response cache: {}", e),
    }
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}
