//! Configuration Types
//!
//! All configuration structures with sensible defaults.
//! Supports global (~/.config/inboxpilot/) and project (.inboxpilot/) level configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::ai::provider::{ProviderConfig, QuotaGuardConfig};
use crate::ai::scheduler::{CacheConfig, RetryPolicy, SchedulerConfig};
use crate::constants::{cache, precompute, quota, retry, scheduler};
use crate::mail::GmailConfig;
use crate::precompute::{ModerationRule, PromptSet, WorkPriority};
use crate::types::{PilotError, Result};

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration version
    pub version: String,

    /// Completion provider settings
    pub provider: ProviderConfig,

    /// Request scheduler limits and retry policy
    pub scheduler: SchedulerSettings,

    /// Rate-limit cooldown
    pub quota: QuotaSettings,

    /// Response cache
    pub cache: CacheSettings,

    /// Background precompute pipeline
    pub precompute: PrecomputeSettings,

    /// Moderation rules
    pub moderation: ModerationSettings,

    /// Mail API adapter
    pub mail: GmailConfig,

    /// Local database
    pub storage: StorageSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            provider: ProviderConfig::default(),
            scheduler: SchedulerSettings::default(),
            quota: QuotaSettings::default(),
            cache: CacheSettings::default(),
            precompute: PrecomputeSettings::default(),
            moderation: ModerationSettings::default(),
            mail: GmailConfig::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    /// Returns `PilotError::Config` on validation failure.
    pub fn validate(&self) -> Result<()> {
        fn invalid(message: impl Into<String>) -> Result<()> {
            Err(PilotError::Config(message.into()))
        }

        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return invalid(format!(
                "provider.temperature must be between 0.0 and 2.0, got {}",
                self.provider.temperature
            ));
        }
        if self.provider.timeout_secs == Some(0) {
            return invalid("provider.timeout_secs must be greater than 0 when set");
        }

        let s = &self.scheduler;
        if s.max_concurrent == 0 {
            return invalid("scheduler.max_concurrent must be greater than 0");
        }
        if s.max_concurrent_interactive == 0 {
            return invalid("scheduler.max_concurrent_interactive must be greater than 0");
        }
        if s.max_concurrent_interactive > s.max_concurrent {
            return invalid(format!(
                "scheduler.max_concurrent_interactive ({}) cannot exceed max_concurrent ({})",
                s.max_concurrent_interactive, s.max_concurrent
            ));
        }
        if s.max_batch_size == 0 {
            return invalid("scheduler.max_batch_size must be greater than 0");
        }
        if s.max_outstanding_tokens == 0 {
            return invalid("scheduler.max_outstanding_tokens must be greater than 0");
        }
        if s.base_backoff_ms > s.max_backoff_ms {
            return invalid("scheduler.base_backoff_ms cannot exceed max_backoff_ms");
        }
        if self.quota.base_cooldown_ms > self.quota.max_cooldown_ms {
            return invalid("quota.base_cooldown_ms cannot exceed max_cooldown_ms");
        }

        let p = &self.precompute;
        if p.chunk_size == 0 {
            return invalid("precompute.chunk_size must be greater than 0");
        }
        if p.per_call_concurrency == 0 {
            return invalid("precompute.per_call_concurrency must be greater than 0");
        }
        if p.tick_limit == 0 {
            return invalid("precompute.tick_limit must be greater than 0");
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.moderation.rules {
            if rule.id.trim().is_empty() {
                return invalid("moderation rule id cannot be empty");
            }
            if !seen.insert(rule.id.as_str()) {
                return invalid(format!("duplicate moderation rule id: {}", rule.id));
            }
            if rule.enabled && (rule.label.trim().is_empty() || rule.prompt.trim().is_empty()) {
                return invalid(format!(
                    "moderation rule '{}' needs a label and a prompt",
                    rule.id
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Scheduler Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub max_concurrent_interactive: usize,
    pub max_outstanding_tokens: u64,
    pub max_batch_size: usize,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub defer_delay_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: scheduler::MAX_CONCURRENT,
            max_concurrent_interactive: scheduler::MAX_CONCURRENT_INTERACTIVE,
            max_outstanding_tokens: scheduler::MAX_OUTSTANDING_TOKENS,
            max_batch_size: scheduler::MAX_BATCH_SIZE,
            max_retries: retry::MAX_RETRIES,
            base_backoff_ms: retry::BASE_BACKOFF_MS,
            max_backoff_ms: retry::MAX_BACKOFF_MS,
            defer_delay_ms: scheduler::DEFER_DELAY_MS,
        }
    }
}

impl SchedulerSettings {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent,
            max_concurrent_interactive: self.max_concurrent_interactive,
            max_outstanding_tokens: self.max_outstanding_tokens,
            max_batch_size: self.max_batch_size,
            defer_delay: Duration::from_millis(self.defer_delay_ms),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_backoff: Duration::from_millis(self.base_backoff_ms),
                max_backoff: Duration::from_millis(self.max_backoff_ms),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            base_cooldown_ms: quota::BASE_COOLDOWN_MS,
            max_cooldown_ms: quota::MAX_COOLDOWN_MS,
        }
    }
}

impl QuotaSettings {
    pub fn to_guard_config(&self) -> QuotaGuardConfig {
        QuotaGuardConfig {
            base_cooldown: Duration::from_millis(self.base_cooldown_ms),
            max_cooldown: Duration::from_millis(self.max_cooldown_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_persisted_entries: usize,
    pub flush_debounce_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: cache::TTL_SECS,
            max_persisted_entries: cache::MAX_PERSISTED_ENTRIES,
            flush_debounce_ms: cache::FLUSH_DEBOUNCE_MS,
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.ttl_secs),
            max_entries: cache::MAX_ENTRIES,
            max_persisted_entries: self.max_persisted_entries,
            flush_debounce: Duration::from_millis(self.flush_debounce_ms),
        }
    }
}

// =============================================================================
// Precompute Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecomputeSettings {
    /// Model for precompute requests (provider default when unset)
    pub model: Option<String>,
    /// Threads per combined summary/subject prompt
    pub chunk_size: usize,
    /// Concurrent individual or moderation calls per dispatch
    pub per_call_concurrency: usize,
    /// Threads per tick
    pub tick_limit: usize,
    /// Which work fills a tick first
    pub priority: WorkPriority,
    /// Body text cap per thread, in estimated tokens
    pub max_body_tokens: usize,
    /// Pending markers older than this are treated as abandoned
    pub stale_pending_secs: u64,
    /// Bump to regenerate every subject
    pub subject_version: u32,
    pub prompts: PromptSet,
}

impl Default for PrecomputeSettings {
    fn default() -> Self {
        Self {
            model: None,
            chunk_size: precompute::CHUNK_SIZE,
            per_call_concurrency: precompute::PER_CALL_CONCURRENCY,
            tick_limit: precompute::TICK_LIMIT,
            priority: WorkPriority::default(),
            max_body_tokens: precompute::MAX_BODY_TOKENS,
            stale_pending_secs: precompute::STALE_PENDING_SECS as u64,
            subject_version: precompute::SUBJECT_VERSION,
            prompts: PromptSet::default(),
        }
    }
}

impl PrecomputeSettings {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.stale_pending_secs.min(i64::MAX as u64) as i64)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationSettings {
    pub rules: Vec<ModerationRule>,
}

// =============================================================================
// Storage Configuration
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database path (platform data directory when unset)
    pub database_path: Option<PathBuf>,
}

// =============================================================================
// Tests
// =============================================================================
