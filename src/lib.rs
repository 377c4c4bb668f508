//! InboxPilot - AI request scheduling and background precompute for an
//! offline-first mail client
//!
//! Decides which local threads still need a summary, a subject line or a
//! moderation verdict, batches and throttles the completion calls under
//! concurrency, token and rate limits, retries failures with backoff, and
//! merges results back into the local dataset without losing user state.
//!
//! ## Quick Start
//!
//! ```ignore
//! use inboxpilot::{Orchestrator, Scheduler, TickOptions};
//!
//! let scheduler = Scheduler::with_defaults(provider);
//! let orchestrator = Orchestrator::new(scheduler, repo, mail, settings, rules);
//! let report = orchestrator.precompute_now(100, TickOptions { sync: true, ..Default::default() }).await;
//! ```
//!
//! ## Modules
//!
//! - [`ai`]: completion providers, quota guard, request scheduler
//! - [`precompute`]: candidate selection, combined prompts, merge, moderation
//! - [`storage`]: document store (SQLite or in-memory) and thread repository
//! - [`mail`]: mail API collaborator and a Gmail REST adapter
//! - [`config`]: layered configuration

pub mod ai;
pub mod cli;
pub mod config;
pub mod constants;
pub mod mail;
pub mod precompute;
pub mod storage;
pub mod types;

// =============================================================================
// Core Re-exports
// =============================================================================

// Configuration
pub use config::{Config, ConfigLoader};

// Error Types
pub use types::error::{ErrorCategory, PilotError, ProviderError, Result, ResultExt};

// Storage
pub use storage::database::PoolConfig;
pub use storage::{Database, LocalStore, MemoryStore, SharedDatabase, SharedStore, ThreadRepository};

// =============================================================================
// Scheduler Re-exports
// =============================================================================

pub use ai::{
    CompletionProvider, PendingResponse, QuotaGuard, ResponseCache, Scheduler, SchedulerConfig,
    SchedulerEvent, SchedulerStats, SharedProvider,
};
pub use types::{AiRequest, AiResponse, Priority};

// =============================================================================
// Pipeline Re-exports
// =============================================================================

pub use mail::{MailApi, SharedMailApi};
pub use precompute::{
    ModerationRule, Orchestrator, PrecomputeReport, RunLogEntry, RunSummary, TickOptions,
    TickReport, WorkPriority,
};
pub use types::{AiFieldStatus, ModerationStatus, ThreadRecord};
