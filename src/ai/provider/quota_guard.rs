//! Quota Guard: per-provider rate-limit cooldown
//!
//! A circuit breaker keyed on rate-limit signals. Every call for a provider
//! goes through the same state object; once the cooldown has elapsed callers
//! run concurrently.
//!
//! ## Transitions
//!
//! ```text
//! Closed --[429]--> Open(base_cooldown)
//! Open --[429]--> Open(min(ceiling, cooldown * 2))
//! Open/Closed --[success]--> Closed
//! ```
//!
//! Calls made while `Open` are suspended until the cooldown has elapsed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{collections, quota};
use crate::storage::{SharedStore, StoreExt};
use crate::types::ProviderError;

/// Guard state for one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaState {
    /// Calls flow through
    Closed,
    /// Calls wait until the cooldown has elapsed
    Open,
}

impl std::fmt::Display for QuotaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QuotaGuardConfig {
    /// Cooldown after the first rate-limit signal
    pub base_cooldown: Duration,
    /// Cooldown ceiling
    pub max_cooldown: Duration,
}

impl Default for QuotaGuardConfig {
    fn default() -> Self {
        Self {
            base_cooldown: Duration::from_millis(quota::BASE_COOLDOWN_MS),
            max_cooldown: Duration::from_millis(quota::MAX_COOLDOWN_MS),
        }
    }
}

impl QuotaGuardConfig {
    /// Cooldown for the n-th consecutive rate-limit signal (n >= 1)
    pub fn cooldown_for(&self, consecutive_failures: u32, retry_after: Option<Duration>) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(31);
        let doubled = self
            .base_cooldown
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_cooldown);
        let cooldown = doubled.max(retry_after.unwrap_or_default());
        cooldown.min(self.max_cooldown)
    }
}

/// Persisted view of one provider's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub provider_id: String,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// All mutable state for one provider in a single struct so
/// failure count and cooldown always change together
#[derive(Debug, Default)]
struct ProviderQuota {
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    waits: u64,
}

impl ProviderQuota {
    fn state(&self, now: Instant) -> QuotaState {
        match self.cooldown_until {
            Some(until) if until > now => QuotaState::Open,
            _ => QuotaState::Closed,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }
}

/// Shared per-provider quota guard
pub struct QuotaGuard {
    config: QuotaGuardConfig,
    providers: DashMap<String, Arc<Mutex<ProviderQuota>>>,
    store: Option<SharedStore>,
    /// Sequence of the latest snapshot taken
    snapshot_seq: Mutex<u64>,
    /// Sequence of the latest snapshot written; held while writing
    written_seq: Arc<Mutex<u64>>,
}

impl QuotaGuard {
    pub fn new(config: QuotaGuardConfig) -> Self {
        Self {
            config,
            providers: DashMap::new(),
            store: None,
            snapshot_seq: Mutex::new(0),
            written_seq: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(QuotaGuardConfig::default())
    }

    /// Attach a store and restore any persisted cooldowns from it
    pub fn with_store(mut self, store: SharedStore) -> Self {
        match store.get_json::<Vec<QuotaSnapshot>>(collections::AI_STATE, collections::QUOTA_STATE_KEY)
        {
            Ok(Some(snapshots)) => self.restore(snapshots),
            Ok(None) => {}
            Err(e) => warn!("Failed to load quota state: {}", e),
        }
        self.store = Some(store);
        self
    }

    fn restore(&self, snapshots: Vec<QuotaSnapshot>) {
        let now = Instant::now();
        let wall_now = Utc::now();
        for snap in snapshots {
            let cooldown_until = snap
                .cooldown_until
                .and_then(|until| (until - wall_now).to_std().ok())
                .map(|remaining| now + remaining.min(self.config.max_cooldown));
            debug!(
                provider = %snap.provider_id,
                failures = snap.consecutive_failures,
                "Restored quota state"
            );
            self.providers.insert(
                snap.provider_id,
                Arc::new(Mutex::new(ProviderQuota {
                    consecutive_failures: snap.consecutive_failures,
                    cooldown_until,
                    waits: 0,
                })),
            );
        }
    }

    fn entry(&self, provider_id: &str) -> Arc<Mutex<ProviderQuota>> {
        self.providers
            .entry(provider_id.to_string())
            .or_default()
            .clone()
    }

    fn lock(entry: &Mutex<ProviderQuota>) -> std::sync::MutexGuard<'_, ProviderQuota> {
        entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state (Closed for unknown providers)
    pub fn state(&self, provider_id: &str) -> QuotaState {
        match self.providers.get(provider_id) {
            Some(entry) => Self::lock(&entry).state(Instant::now()),
            None => QuotaState::Closed,
        }
    }

    pub fn consecutive_failures(&self, provider_id: &str) -> u32 {
        self.providers
            .get(provider_id)
            .map(|entry| Self::lock(&entry).consecutive_failures)
            .unwrap_or(0)
    }

    /// Time left until the provider may be called again
    pub fn remaining_cooldown(&self, provider_id: &str) -> Duration {
        self.providers
            .get(provider_id)
            .map(|entry| Self::lock(&entry).remaining(Instant::now()))
            .unwrap_or_default()
    }

    /// Run `call` once the provider's cooldown has elapsed.
    ///
    /// A success resets the guard; a rate-limit error reopens it with a longer
    /// cooldown. The call's own result is always returned unchanged.
    pub async fn run_guarded<T, F, Fut>(&self, provider_id: &str, call: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let entry = self.entry(provider_id);

        // Another caller may extend the cooldown while this one sleeps
        loop {
            let wait = {
                let mut quota = Self::lock(&entry);
                let wait = quota.remaining(Instant::now());
                if !wait.is_zero() {
                    quota.waits += 1;
                }
                wait
            };
            if wait.is_zero() {
                break;
            }
            debug!(provider = provider_id, wait_ms = wait.as_millis() as u64, "Quota guard open, waiting");
            tokio::time::sleep(wait).await;
        }

        let result = call().await;
        match &result {
            Ok(_) => self.record_success(provider_id, &entry),
            Err(err) if err.is_rate_limited() => {
                self.record_rate_limit(provider_id, &entry, err.retry_after)
            }
            Err(_) => {}
        }
        result
    }

    fn record_success(&self, provider_id: &str, entry: &Mutex<ProviderQuota>) {
        let changed = {
            let mut quota = Self::lock(entry);
            let changed = quota.consecutive_failures > 0 || quota.cooldown_until.is_some();
            quota.consecutive_failures = 0;
            quota.cooldown_until = None;
            changed
        };
        if changed {
            info!(provider = provider_id, "Quota guard closed (provider recovered)");
            self.persist();
        }
    }

    fn record_rate_limit(
        &self,
        provider_id: &str,
        entry: &Mutex<ProviderQuota>,
        retry_after: Option<Duration>,
    ) {
        let (failures, cooldown) = {
            let mut quota = Self::lock(entry);
            quota.consecutive_failures = quota.consecutive_failures.saturating_add(1);
            let cooldown = self
                .config
                .cooldown_for(quota.consecutive_failures, retry_after);
            quota.cooldown_until = Some(Instant::now() + cooldown);
            (quota.consecutive_failures, cooldown)
        };
        warn!(
            provider = provider_id,
            failures,
            cooldown_ms = cooldown.as_millis() as u64,
            "Quota guard opened after rate limit"
        );
        self.persist();
    }

    /// Force every provider back to Closed
    pub fn reset(&self) {
        self.providers.clear();
        self.persist();
    }

    pub fn snapshots(&self) -> Vec<QuotaSnapshot> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut by_id = BTreeMap::new();
        for item in self.providers.iter() {
            let quota = Self::lock(item.value());
            let cooldown_until = quota
                .cooldown_until
                .filter(|until| *until > now)
                .and_then(|until| chrono::Duration::from_std(until - now).ok())
                .map(|remaining| wall_now + remaining);
            by_id.insert(
                item.key().clone(),
                QuotaSnapshot {
                    provider_id: item.key().clone(),
                    consecutive_failures: quota.consecutive_failures,
                    cooldown_until,
                },
            );
        }
        by_id.into_values().collect()
    }

    /// Best-effort save on a detached task; failures are only logged.
    /// Snapshots are numbered when taken and a write never replaces a newer
    /// one.
    fn persist(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let (seq, snapshots) = {
            let mut last = self
                .snapshot_seq
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *last += 1;
            (*last, self.snapshots())
        };
        let written = self.written_seq.clone();
        handle.spawn_blocking(move || write_snapshots(&store, &written, seq, &snapshots));
    }
}

/// Write `snapshots` unless a later sequence is already stored
fn write_snapshots(
    store: &SharedStore,
    written: &Mutex<u64>,
    seq: u64,
    snapshots: &[QuotaSnapshot],
) -> bool {
    let mut last = written
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if seq <= *last {
        debug!(seq, written = *last, "Skipping stale quota snapshot");
        return false;
    }
    match store.put_json(collections::AI_STATE, collections::QUOTA_STATE_KEY, snapshots) {
        Ok(()) => {
            *last = seq;
            true
        }
        Err(e) => {
            warn!("Failed to persist quota state: {}", e);
            false
        }
    }
}

impl std::fmt::Debug for QuotaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaGuard")
            .field("config", &self.config)
            .field("providers", &self.providers.len())
            .finish()
    }
}
